#![allow(non_snake_case)]

use std::env;
use std::process::ExitCode;

use calendarBot::config::{AppConfig, RunMode, Settings};
use calendarBot::{cli, logging, runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match env::var("CONFIG_FILE") {
        Ok(path) => match AppConfig::from_file(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}", err);
                return ExitCode::FAILURE;
            }
        },
        Err(_) => AppConfig::default(),
    };

    let settings = match Settings::load(|key| config.lookup(key)) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return ExitCode::FAILURE;
        }
    };
    logging::init(settings.log_format);

    let result = match settings.run_mode {
        RunMode::Bot => runtime::run_bot(settings).await,
        RunMode::Cli => cli::cli(settings).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "exiting");
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
