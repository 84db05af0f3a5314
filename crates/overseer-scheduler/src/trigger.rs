//! Cron trigger engine: parses schedule expressions and fires callbacks.
//!
//! Each registered entry gets its own Tokio task that sleeps until the next
//! fire time and then dispatches the callback on a fresh task, so a slow run
//! never delays the next fire.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};

/// Callback invoked on every fire.
pub type Callback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

const DAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    /// `@every <duration>`: fixed period, whole seconds, at least one second.
    Every(Duration),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            schedule: expr.to_string(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("empty expression".to_string()));
        }

        if let Some(period) = trimmed.strip_prefix("@every") {
            let period = round_period(parse_duration(period.trim()).map_err(invalid)?);
            let schedule = Schedule::Every(period);
            if schedule.next_after(&Local::now()).is_none() {
                return Err(invalid(format!("interval {period:?} is out of range")));
            }
            return Ok(schedule);
        }

        let normalized = normalize_cron(trimmed).map_err(invalid)?;
        cron::Schedule::from_str(&normalized)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// First fire strictly after `after`, or `None` once the schedule is exhausted.
    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(after).next(),
            Schedule::Every(period) => chrono::Duration::from_std(*period)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
        }
    }
}

/// robfig-style interval rounding: truncate to whole seconds, minimum 1s.
fn round_period(period: Duration) -> Duration {
    Duration::from_secs(period.as_secs().max(1))
}

/// Expand descriptors and 5-field expressions into the 6/7-field form with a
/// leading seconds column, and map the day-of-week field onto names.
fn normalize_cron(expr: &str) -> std::result::Result<String, String> {
    let expanded = match expr {
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        "@monthly" => "0 0 0 1 * *",
        "@weekly" => "0 0 0 * * Sun",
        "@daily" | "@midnight" => "0 0 0 * * *",
        "@hourly" => "0 0 * * * *",
        other if other.starts_with('@') => return Err(format!("unknown descriptor {other}")),
        other => other,
    };

    let mut fields: Vec<String> = expanded.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => return Err(format!("expected 5, 6 or 7 fields, got {n}")),
    }

    fields[5] = day_of_week_names(&fields[5])?;
    Ok(fields.join(" "))
}

/// Rewrite numeric days (0 or 7 = Sunday) as names so the field means the same
/// thing as in classic cron.
fn day_of_week_names(field: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(field.len());
    let mut digits = String::new();
    let mut after_slash = false;

    let flush = |digits: &mut String, out: &mut String, step: bool| -> std::result::Result<(), String> {
        if digits.is_empty() {
            return Ok(());
        }
        if step {
            out.push_str(digits);
        } else {
            let day: usize = digits
                .parse()
                .map_err(|_| format!("invalid day of week {digits}"))?;
            let name = DAY_NAMES
                .get(day)
                .ok_or_else(|| format!("day of week {day} out of range 0-7"))?;
            out.push_str(name);
        }
        digits.clear();
        Ok(())
    };

    for c in field.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        flush(&mut digits, &mut out, after_slash)?;
        after_slash = c == '/';
        out.push(c);
    }
    flush(&mut digits, &mut out, after_slash)?;
    Ok(out)
}

/// Parse a Go-style duration: `90s`, `1h30m`, `1.5h`, `500ms`.
fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    if input.is_empty() {
        return Err("missing duration after @every".to_string());
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        if num_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {input:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];
        total += value * scale;
    }

    Duration::try_from_secs_f64(total).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a registered entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub id: EntryId,
    pub expr: String,
    pub next: Option<DateTime<Local>>,
}

struct Entry {
    id: EntryId,
    expr: String,
    schedule: Arc<Schedule>,
    callback: Callback,
}

/// Fires registered callbacks according to their schedules.
///
/// `start` and any `add` made after it must be called from within a Tokio
/// runtime.
pub struct CronEngine {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    /// `Some` while started; cancelling it halts every ticker.
    running: Mutex<Option<CancellationToken>>,
}

impl CronEngine {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            running: Mutex::new(None),
        }
    }

    /// Register `callback` under `expr`. Starts ticking immediately if the
    /// engine is already running.
    pub fn add(&self, expr: &str, callback: Callback) -> Result<EntryId> {
        let schedule = Arc::new(Schedule::parse(expr)?);
        let id = EntryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            id,
            expr: expr.to_string(),
            schedule,
            callback,
        };

        // Lock order matches `start`: running, then entries.
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = running.as_ref() {
            spawn_ticker(&entry, token.clone());
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);

        debug!(entry = %id, schedule = expr, "cron entry added");
        Ok(id)
    }

    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.iter() {
            spawn_ticker(entry, token.clone());
        }
        info!(entries = entries.len(), "cron engine started");
        *running = Some(token);
    }

    /// Halt every ticker. Runs already dispatched are not affected.
    pub fn stop(&self) {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
            info!("cron engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_token().is_some()
    }

    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = Local::now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| EntryInfo {
                id: e.id,
                expr: e.expr.clone(),
                next: e.schedule.next_after(&now),
            })
            .collect()
    }

    fn running_token(&self) -> Option<CancellationToken> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_ticker(entry: &Entry, token: CancellationToken) {
    let id = entry.id;
    let schedule = Arc::clone(&entry.schedule);
    let callback = Arc::clone(&entry.callback);

    tokio::spawn(async move {
        let mut last: Option<DateTime<Local>> = None;
        loop {
            let now = Local::now();
            let from = last.map_or(now, |l| l.max(now));
            let Some(next) = schedule.next_after(&from) else {
                debug!(entry = %id, "schedule exhausted");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {
                    debug!(entry = %id, "cron entry fired");
                    tokio::spawn(callback());
                    last = Some(next);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parses_every_durations() {
        let cases = [
            ("@every 1h", 3600),
            ("@every 1h30m", 5400),
            ("@every 90s", 90),
            ("@every 1.5m", 90),
            ("@every 500ms", 1),
            ("@every 2500ms", 2),
        ];
        for (expr, secs) in cases {
            match Schedule::parse(expr).unwrap() {
                Schedule::Every(d) => assert_eq!(d, Duration::from_secs(secs), "{expr}"),
                other => panic!("{expr} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_bad_expressions() {
        for expr in ["", "   ", "@every", "@every 5x", "@every h", "@sometimes", "* * *", "61 * * * *"] {
            assert!(
                matches!(Schedule::parse(expr), Err(SchedulerError::InvalidSchedule { .. })),
                "{expr:?} should be rejected"
            );
        }
    }

    #[test]
    fn five_field_gets_seconds_column() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 30 2 * * *").unwrap(), "0 30 2 * * *");
    }

    #[test]
    fn day_of_week_numbers_become_names() {
        assert_eq!(day_of_week_names("1-5").unwrap(), "Mon-Fri");
        assert_eq!(day_of_week_names("0,6").unwrap(), "Sun,Sat");
        assert_eq!(day_of_week_names("7").unwrap(), "Sun");
        assert_eq!(day_of_week_names("*/2").unwrap(), "*/2");
        assert_eq!(day_of_week_names("Mon").unwrap(), "Mon");
        assert!(day_of_week_names("8").is_err());
    }

    #[test]
    fn descriptors_expand() {
        let from = Local.with_ymd_and_hms(2024, 3, 10, 12, 34, 56).unwrap();
        let hourly = Schedule::parse("@hourly").unwrap().next_after(&from).unwrap();
        assert_eq!((hourly.hour(), hourly.minute(), hourly.second()), (13, 0, 0));

        let daily = Schedule::parse("@midnight").unwrap().next_after(&from).unwrap();
        assert_eq!((daily.hour(), daily.minute()), (0, 0));
        assert!(daily > from);
    }

    #[test]
    fn every_adds_period() {
        let from = Local::now();
        let next = Schedule::parse("@every 10s").unwrap().next_after(&from).unwrap();
        assert_eq!((next - from).num_seconds(), 10);
    }

    #[test]
    fn entries_report_next_fire() {
        let engine = CronEngine::new();
        let cb: Callback = Arc::new(|| async {}.boxed());
        let id = engine.add("@every 1h", cb).unwrap();

        let entries = engine.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].expr, "@every 1h");
        assert!(entries[0].next.is_some());
        assert!(!engine.is_running());
    }

    #[test]
    fn oversized_interval_is_rejected() {
        assert!(matches!(
            Schedule::parse("@every 3000000000h"),
            Err(SchedulerError::InvalidSchedule { .. })
        ));

        let engine = CronEngine::new();
        let cb: Callback = Arc::new(|| async {}.boxed());
        assert!(engine.add("@every 3000000000h", cb).is_err());
        assert!(engine.entries().is_empty());
    }

    #[test]
    fn interval_past_the_calendar_has_no_next_fire() {
        let huge = Schedule::Every(Duration::from_secs(u64::MAX / 4));
        assert!(huge.next_after(&Local::now()).is_none());

        let far = Schedule::Every(Duration::from_secs(3_000_000_000 * 3600));
        assert!(far.next_after(&Local::now()).is_none());
    }

    #[test]
    fn invalid_entry_is_not_registered() {
        let engine = CronEngine::new();
        let cb: Callback = Arc::new(|| async {}.boxed());
        assert!(engine.add("not a schedule", cb).is_err());
        assert!(engine.entries().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fires_until_stopped() {
        let engine = CronEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let cb: Callback = Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        engine.add("* * * * * *", cb).unwrap();

        engine.start();
        assert!(engine.is_running());
        tokio::time::sleep(Duration::from_millis(2200)).await;
        engine.stop();
        assert!(!engine.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 1, "expected at least one fire, saw {seen}");

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), seen, "fired after stop");
    }
}
