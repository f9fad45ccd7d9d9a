use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use inquire::{Password, PasswordDisplayMode, Text};
use serenity::async_trait;

use crate::config::Settings;
use crate::errors::{AppError, DeliveryError};
use crate::models::account::ProviderKind;
use crate::runtime::{Components, build_components};
use crate::service::notifier_service::{DiscordDmNotifier, Notifier};
use crate::service::render_service::{EmbedRenderer, Notice, Renderer};
use crate::store::AccountStore;
use crate::tasks::reminder_engine::JobKind;
use crate::tasks::scheduler::execute;

#[derive(Parser)]
#[command(name = "calendarBot", about = "Operator commands for the reminder bot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link a Canvas instance with a personal access token.
    LinkCanvas {
        #[arg(long)]
        user: String,
        #[arg(long)]
        url: String,
    },
    /// Link a Google Calendar through the consent screen.
    LinkGoogle {
        #[arg(long)]
        user: String,
    },
    Unlink {
        #[arg(long)]
        user: String,
        #[arg(long)]
        kind: ProviderKind,
        #[arg(long)]
        address: String,
    },
    /// List linked accounts of a user.
    Accounts {
        #[arg(long)]
        user: String,
    },
    /// Show the most recent delivered reminders of a user.
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the summary a user would get right now, without sending it.
    Upcoming {
        #[arg(long)]
        user: String,
    },
    /// Run one job immediately.
    RunJob { job: JobKind },
}

/// Prints notices instead of sending them.
struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn deliver(&self, user_id: &str, notice: &Notice) -> Result<(), DeliveryError> {
        println!("--- to {} ---\n{}", user_id, notice);
        Ok(())
    }
}

pub async fn cli(settings: Settings) -> Result<(), AppError> {
    let cli = Cli::parse();
    let components = build_components(&settings)?;
    match cli.command {
        Commands::LinkCanvas { user, url } => link_canvas(&components, &user, &url).await,
        Commands::LinkGoogle { user } => link_google(&components, &user).await,
        Commands::Unlink { user, kind, address } => {
            let removed = components.link_service().unlink(&user, kind, &address).await?;
            if removed {
                println!("Unlinked {} account {}", kind, address);
            } else {
                println!("No {} account {} linked for {}", kind, address, user);
            }
            Ok(())
        }
        Commands::Accounts { user } => {
            let accounts = components.store.list_accounts_for_user(&user).await?;
            if accounts.is_empty() {
                println!("No accounts linked for {}", user);
            }
            for account in accounts {
                let expiry = account
                    .credential
                    .expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("#{} {} {} (token expires: {})", account.id, account.kind, account.address, expiry);
            }
            Ok(())
        }
        Commands::History { user, limit } => {
            let entries = components.store.ledger_entries(&user).await?;
            if entries.is_empty() {
                println!("Nothing delivered to {} yet", user);
            }
            for entry in entries.into_iter().take(limit) {
                println!(
                    "{} {} {}",
                    entry.sent_at.to_rfc3339(),
                    entry.kind,
                    entry.dedup_key
                );
            }
            Ok(())
        }
        Commands::Upcoming { user } => {
            let engine = components.engine(&settings, Arc::new(ConsoleNotifier));
            let now = Utc::now();
            let (items, report) = engine.upcoming_for_user(&user, now).await?;
            for failure in &report.failures {
                println!("warning: {}: {}", failure.scope, failure.error);
            }
            if items.is_empty() {
                println!("Nothing coming up in the next {} days", settings.reminder_days_ahead);
                return Ok(());
            }
            let renderer = EmbedRenderer::new(settings.timezone);
            println!("{}", renderer.render_summary(&items, settings.reminder_days_ahead, now));
            Ok(())
        }
        Commands::RunJob { job } => {
            let token = settings.require_bot_token()?;
            let notifier: Arc<dyn Notifier> = Arc::new(DiscordDmNotifier::new(token));
            let engine = Arc::new(components.engine(&settings, notifier));
            let report = execute(engine, job, Utc::now()).await?;
            println!("{}: {}", job, report);
            Ok(())
        }
    }
}

async fn link_canvas(components: &Components, user: &str, url: &str) -> Result<(), AppError> {
    let token = Password::new("Canvas API token:")
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()?;
    let account = components.link_service().link_canvas(user, url, &token).await?;
    println!("Linked Canvas {} for {} (account #{})", account.address, user, account.id);
    Ok(())
}

async fn link_google(components: &Components, user: &str) -> Result<(), AppError> {
    let service = components.link_service();
    let url = service.begin_google(user, Utc::now())?;
    println!("Open this URL and approve access:\n\n{}\n", url);
    let redirect = Text::new("Paste the URL your browser was redirected to:").prompt()?;
    let account = service.complete_google(user, &redirect, Utc::now()).await?;
    println!("Linked Google Calendar {} for {} (account #{})", account.address, user, account.id);
    Ok(())
}
