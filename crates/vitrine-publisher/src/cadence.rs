use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use vitrine_core::CoreError;

/// How often the trigger fires.
///
/// | Expression            | Meaning                                   |
/// |-----------------------|-------------------------------------------|
/// | `*/5 * * * *`         | 5-field Unix cron (minute resolution)      |
/// | `0 */30 * * * *`      | 6/7-field cron with seconds (and year)     |
/// | `@every 30s`          | Fixed interval; units `ms`, `s`, `m`, `h`  |
/// | `@minutely` `@hourly` `@daily` | Aliases                           |
#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Cadence {
    pub fn parse(expression: &str) -> Result<Self, CoreError> {
        let expression = expression.trim();
        let invalid = |reason: String| {
            CoreError::Config(format!("invalid cadence {expression:?}: {reason}"))
        };

        if let Some(rest) = expression.strip_prefix("@every") {
            let every = parse_interval(rest.trim()).map_err(invalid)?;
            return Ok(Cadence::Every(every));
        }

        let cron_expr = match expression {
            "" => return Err(invalid("expression is empty".to_string())),
            "@minutely" => "* * * * *",
            "@hourly" => "0 * * * *",
            "@daily" => "0 0 * * *",
            other => other,
        };
        let schedule = cron::Schedule::from_str(&to_cron_crate_format(cron_expr))
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Cadence::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// First fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every(every) => chrono::Duration::from_std(*every)
                .ok()
                .map(|step| from + step),
            Cadence::Cron { schedule, .. } => schedule.after(&from).next(),
        }
    }

    /// How long to sleep from `now` until the next fire time.
    ///
    /// `None` when the schedule has no future occurrence.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

impl FromStr for Cadence {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cadence::parse(s)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Every(every) => write!(f, "@every {}ms", every.as_millis()),
            Cadence::Cron { expression, .. } => write!(f, "{expression}"),
        }
    }
}

/// The `cron` crate wants `sec min hour dom month dow [year]`; a plain
/// 5-field Unix expression gets `0` seconds prepended and `*` year appended.
fn to_cron_crate_format(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression} *")
    } else {
        expression.to_string()
    }
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in {raw:?} (use ms, s, m or h)"))?;
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("expected a number before the unit, got {raw:?}"))?;
    if amount == 0 {
        return Err("interval must be greater than zero".to_string());
    }
    let every = match unit.trim() {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3600)),
        other => return Err(format!("unknown unit {other:?} (use ms, s, m or h)")),
    };
    Ok(every)
}
