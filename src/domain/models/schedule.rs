//! Schedule kinds, normalization, and next-run computation.
//!
//! A stored `schedule_json` is either a plain cron string, a predefined
//! `@`-tag, or a JSON object `{kind, ...}`. Normalization is idempotent:
//! normalizing an already-normalized value returns it unchanged.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::domain::errors::{GatewayError, GatewayResult};

/// A normalized schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// 5-field, 6-field (seconds), 7-field (seconds + year) cron
    /// expression, or an `@`-tag. Stored as given.
    Cron { cron_expr: String },
    /// Fixed interval in milliseconds.
    Interval { interval_ms: u64 },
    /// One-shot at a unix-ms timestamp.
    Once { at_ms: i64 },
}

impl Schedule {
    /// Normalize a raw schedule value (string or JSON object).
    pub fn normalize(input: &Value) -> GatewayResult<Self> {
        match input {
            Value::String(s) => Self::parse_expr(s),
            Value::Object(_) => {
                let schedule: Self = serde_json::from_value(input.clone())
                    .map_err(|e| GatewayError::BadSchedule(e.to_string()))?;
                schedule.validate()?;
                Ok(schedule)
            }
            other => Err(GatewayError::BadSchedule(format!(
                "expected string or object, got {other}"
            ))),
        }
    }

    /// Normalize a raw string: either JSON or a bare cron expression.
    pub fn normalize_str(input: &str) -> GatewayResult<Self> {
        let trimmed = input.trim();
        if trimmed.starts_with('{') {
            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| GatewayError::BadSchedule(e.to_string()))?;
            Self::normalize(&value)
        } else {
            Self::parse_expr(trimmed)
        }
    }

    fn parse_expr(expr: &str) -> GatewayResult<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(GatewayError::BadSchedule("empty schedule".into()));
        }
        // Validates; the stored expression stays as given.
        to_cron_schedule(expr)?;
        Ok(Self::Cron {
            cron_expr: expr.to_string(),
        })
    }

    fn validate(&self) -> GatewayResult<()> {
        match self {
            Self::Cron { cron_expr } => to_cron_schedule(cron_expr).map(|_| ()),
            Self::Interval { interval_ms } => {
                if *interval_ms == 0 {
                    return Err(GatewayError::BadSchedule(
                        "interval_ms must be positive".into(),
                    ));
                }
                Ok(())
            }
            Self::Once { at_ms } => {
                if *at_ms <= 0 {
                    return Err(GatewayError::BadSchedule("at_ms must be positive".into()));
                }
                Ok(())
            }
        }
    }

    /// Next fire time strictly after `now`, or `None` when the schedule
    /// is finished (`once` in the past or cron advanced past its final
    /// tick).
    pub fn next_run(&self, now: DateTime<Utc>) -> GatewayResult<Option<DateTime<Utc>>> {
        match self {
            Self::Cron { cron_expr } => {
                let schedule = to_cron_schedule(cron_expr)?;
                Ok(schedule.after(&now).next())
            }
            Self::Interval { interval_ms } => {
                let delta = chrono::Duration::milliseconds(i64::try_from(*interval_ms).map_err(
                    |_| GatewayError::BadSchedule("interval_ms out of range".into()),
                )?);
                Ok(Some(now + delta))
            }
            Self::Once { at_ms } => {
                let at = Utc
                    .timestamp_millis_opt(*at_ms)
                    .single()
                    .ok_or_else(|| GatewayError::BadSchedule("at_ms out of range".into()))?;
                Ok(if at > now { Some(at) } else { None })
            }
        }
    }

    /// Human-readable description for logs and list output.
    pub fn description(&self) -> String {
        match self {
            Self::Cron { cron_expr } => format!("cron: {cron_expr}"),
            Self::Interval { interval_ms } => {
                let secs = interval_ms / 1000;
                if secs >= 3600 {
                    format!("every {} hour(s)", secs / 3600)
                } else if secs >= 60 {
                    format!("every {} minute(s)", secs / 60)
                } else {
                    format!("every {secs} second(s)")
                }
            }
            Self::Once { at_ms } => format!("once at unix-ms {at_ms}"),
        }
    }
}

/// Compile a stored cron expression for evaluation.
///
/// The `cron` crate wants 6 or 7 fields (seconds first); 5-field
/// expressions gain a leading `0`. `@hourly`-style tags pass through;
/// `@Nminutes` / `@Nhours` translate to equivalent expressions.
fn to_cron_schedule(expr: &str) -> GatewayResult<cron::Schedule> {
    let expanded = expand_cron_expr(expr)?;
    cron::Schedule::from_str(&expanded)
        .map_err(|e| GatewayError::BadSchedule(format!("invalid cron expression '{expr}': {e}")))
}

fn expand_cron_expr(expr: &str) -> GatewayResult<String> {
    if let Some(tag) = expr.strip_prefix('@') {
        return expand_tag(tag, expr);
    }
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {expr}")),
        6 | 7 => Ok(expr.to_string()),
        n => Err(GatewayError::BadSchedule(format!(
            "cron expression '{expr}' has {n} fields, expected 5-7"
        ))),
    }
}

fn expand_tag(tag: &str, original: &str) -> GatewayResult<String> {
    match tag {
        "yearly" | "annually" | "monthly" | "weekly" | "daily" | "hourly" => {
            Ok(original.to_string())
        }
        _ => {
            // @5minutes, @2hours
            let digits: String = tag.chars().take_while(char::is_ascii_digit).collect();
            let unit = &tag[digits.len()..];
            let n: u32 = digits
                .parse()
                .map_err(|_| GatewayError::BadSchedule(format!("unknown schedule tag '@{tag}'")))?;
            if n == 0 {
                return Err(GatewayError::BadSchedule(format!(
                    "unknown schedule tag '@{tag}'"
                )));
            }
            match unit {
                "minute" | "minutes" => Ok(format!("0 */{n} * * * *")),
                "hour" | "hours" => Ok(format!("0 0 */{n} * * *")),
                _ => Err(GatewayError::BadSchedule(format!(
                    "unknown schedule tag '@{tag}'"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_cron_string_normalizes() {
        let s = Schedule::normalize(&json!("*/5 * * * *")).unwrap();
        assert_eq!(
            s,
            Schedule::Cron {
                cron_expr: "*/5 * * * *".into()
            }
        );
    }

    #[test]
    fn daily_tag_normalizes() {
        let s = Schedule::normalize(&json!("@daily")).unwrap();
        assert_eq!(
            s,
            Schedule::Cron {
                cron_expr: "@daily".into()
            }
        );
    }

    #[test]
    fn minutes_tag_is_accepted() {
        let s = Schedule::normalize(&json!("@5minutes")).unwrap();
        assert!(s.next_run(Utc::now()).unwrap().is_some());
    }

    #[test]
    fn garbage_is_rejected() {
        let err = Schedule::normalize(&json!("not a cron")).unwrap_err();
        assert!(matches!(err, GatewayError::BadSchedule(_)));
    }

    #[test]
    fn json_object_passes_through() {
        let v = json!({"kind": "interval", "interval_ms": 60_000});
        let s = Schedule::normalize(&v).unwrap();
        assert_eq!(s, Schedule::Interval { interval_ms: 60_000 });
    }

    #[test]
    fn zero_interval_is_rejected() {
        let v = json!({"kind": "interval", "interval_ms": 0});
        assert!(Schedule::normalize(&v).is_err());
    }

    #[test]
    fn normalize_is_idempotent() {
        let first = Schedule::normalize(&json!("*/5 * * * *")).unwrap();
        let again = Schedule::normalize(&serde_json::to_value(&first).unwrap()).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn interval_next_run_adds_interval() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let s = Schedule::Interval { interval_ms: 60_000 };
        let next = s.next_run(now).unwrap().unwrap();
        assert_eq!(next.timestamp_millis(), 1_700_000_060_000);
    }

    #[test]
    fn past_once_yields_none() {
        let now = Utc::now();
        let s = Schedule::Once {
            at_ms: now.timestamp_millis() - 1000,
        };
        assert_eq!(s.next_run(now).unwrap(), None);

        let s = Schedule::Once {
            at_ms: now.timestamp_millis() + 60_000,
        };
        assert!(s.next_run(now).unwrap().is_some());
    }

    #[test]
    fn cron_next_run_is_strictly_after_now() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let s = Schedule::Cron {
            cron_expr: "0 * * * *".into(),
        };
        let next = s.next_run(now).unwrap().unwrap();
        assert!(next > now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn six_field_cron_is_accepted() {
        assert!(Schedule::normalize(&json!("30 */2 * * * *")).is_ok());
    }
}
