use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serenity::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::errors::JobError;
use crate::tasks::reminder_engine::{JobKind, JobReport, ReminderEngine};

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every day at `hour:00` local time in `tz`.
    Daily { hour: u32, tz: Tz },
    /// Every `interval`, first firing one interval after start.
    Interval(StdDuration),
}

impl Trigger {
    /// First firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Trigger::Daily { hour, tz } => next_daily_run(now, hour, tz),
            Trigger::Interval(interval) => {
                now + Duration::from_std(interval).unwrap_or_else(|_| Duration::minutes(1))
            }
        }
    }
}

fn next_daily_run(now: DateTime<Utc>, hour: u32, tz: Tz) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut day = now.with_timezone(&tz).date_naive();
    loop {
        let naive = day.and_time(at);
        // A time skipped by a DST jump fires an hour later that day.
        let candidate = tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
            .map(|local| local.with_timezone(&Utc));
        if let Some(candidate) = candidate {
            if candidate > now {
                return candidate;
            }
        }
        day = day + Duration::days(1);
    }
}

/// The work a scheduled job performs.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run_job(&self, job: JobKind, now: DateTime<Utc>) -> Result<JobReport, JobError>;
}

#[async_trait]
impl JobBody for ReminderEngine {
    async fn run_job(&self, job: JobKind, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        self.run(job, now).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduledJob {
    pub kind: JobKind,
    pub trigger: Trigger,
}

/// Runs one job body on its own task so a panic comes back as
/// `JobError::Aborted` instead of unwinding into the caller.
pub async fn execute<B>(body: Arc<B>, job: JobKind, now: DateTime<Utc>) -> Result<JobReport, JobError>
where
    B: JobBody + ?Sized + 'static,
{
    match tokio::spawn(async move { body.run_job(job, now).await }).await {
        Ok(result) => result,
        Err(join_err) => Err(JobError::Aborted(join_err.to_string())),
    }
}

struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Starts the trigger loop of `job`. Each firing spawns the body; a firing
/// that finds the previous run still executing is skipped.
pub fn spawn_job<B>(body: Arc<B>, job: ScheduledJob) -> JoinHandle<()>
where
    B: JobBody + ?Sized + 'static,
{
    tokio::spawn(async move {
        let running = Arc::new(AtomicBool::new(false));
        let mut next = job.trigger.next_after(Utc::now());
        info!(job = %job.kind, next_run = %next, "job scheduled");
        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
            sleep(wait).await;
            let fired_at = Utc::now();
            next = job.trigger.next_after(fired_at);

            if running.swap(true, Ordering::SeqCst) {
                warn!(job = %job.kind, "previous run still executing; skipping this trigger");
                continue;
            }
            let flag = RunningFlag(running.clone());
            let body = body.clone();
            let kind = job.kind;
            tokio::spawn(async move {
                let _flag = flag;
                if let Err(err) = execute(body, kind, fired_at).await {
                    error!(job = %kind, error = %err, "job run failed");
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_trigger_fires_at_the_configured_hour() {
        let trigger = Trigger::Daily { hour: 8, tz: Tz::UTC };
        assert_eq!(trigger.next_after(at("2024-01-10T07:59:00Z")), at("2024-01-10T08:00:00Z"));
        assert_eq!(trigger.next_after(at("2024-01-10T08:00:00Z")), at("2024-01-11T08:00:00Z"));
        assert_eq!(trigger.next_after(at("2024-01-10T20:00:00Z")), at("2024-01-11T08:00:00Z"));
    }

    #[test]
    fn daily_trigger_uses_local_zone() {
        let trigger = Trigger::Daily {
            hour: 8,
            tz: chrono_tz::America::New_York,
        };
        assert_eq!(trigger.next_after(at("2024-01-10T12:00:00Z")), at("2024-01-10T13:00:00Z"));
        assert_eq!(trigger.next_after(at("2024-07-10T12:00:00Z")), at("2024-07-11T12:00:00Z"));
    }

    #[test]
    fn daily_trigger_skips_forward_over_dst_gap() {
        // 02:00 does not exist in New York on 2024-03-10.
        let trigger = Trigger::Daily {
            hour: 2,
            tz: chrono_tz::America::New_York,
        };
        assert_eq!(trigger.next_after(at("2024-03-10T05:00:00Z")), at("2024-03-10T07:00:00Z"));
    }

    #[test]
    fn interval_trigger_adds_interval() {
        let trigger = Trigger::Interval(StdDuration::from_secs(300));
        assert_eq!(trigger.next_after(at("2024-01-10T08:00:00Z")), at("2024-01-10T08:05:00Z"));
    }

    struct SlowBody {
        active: AtomicUsize,
        max_active: AtomicUsize,
        runs: AtomicUsize,
        hold: StdDuration,
        panic_on_first: bool,
    }

    impl SlowBody {
        fn new(hold: StdDuration, panic_on_first: bool) -> Self {
            Self {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                runs: AtomicUsize::new(0),
                hold,
                panic_on_first,
            }
        }
    }

    #[async_trait]
    impl JobBody for SlowBody {
        async fn run_job(&self, _job: JobKind, _now: DateTime<Utc>) -> Result<JobReport, JobError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_first && run == 0 {
                panic!("boom");
            }
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            sleep(self.hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(JobReport::default())
        }
    }

    #[tokio::test]
    async fn overlapping_triggers_never_run_the_body_twice_at_once() {
        let body = Arc::new(SlowBody::new(StdDuration::from_millis(120), false));
        let handle = spawn_job(
            body.clone(),
            ScheduledJob {
                kind: JobKind::HourBefore,
                trigger: Trigger::Interval(StdDuration::from_millis(20)),
            },
        );
        sleep(StdDuration::from_millis(400)).await;
        handle.abort();

        assert!(body.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(body.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_body_is_reported_and_loop_keeps_running() {
        let body = Arc::new(SlowBody::new(StdDuration::from_millis(1), true));
        let err = execute(body.clone(), JobKind::DailySummary, Utc::now()).await.unwrap_err();
        assert!(matches!(err, JobError::Aborted(_)));

        let handle = spawn_job(
            body.clone(),
            ScheduledJob {
                kind: JobKind::DailySummary,
                trigger: Trigger::Interval(StdDuration::from_millis(20)),
            },
        );
        sleep(StdDuration::from_millis(150)).await;
        handle.abort();
        assert!(body.runs.load(Ordering::SeqCst) >= 3);
    }
}
