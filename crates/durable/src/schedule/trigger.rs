//! Schedule triggers
//!
//! Cron expressions may use the standard 5-field Unix form (minute, hour,
//! day-of-month, month, day-of-week) or the 6-field form with seconds that
//! the `cron` crate parses. All times are UTC.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ScheduleError;
use crate::clock;
use crate::serde_millis;

/// When a schedule fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Every `every`, counted from creation (or from unpause)
    Interval {
        #[serde(with = "serde_millis")]
        every: Duration,
    },

    /// At every match of a cron expression
    Cron { expression: String },
}

impl Trigger {
    pub fn interval(every: Duration) -> Self {
        Trigger::Interval { every }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Trigger::Cron {
            expression: expression.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Trigger::Interval { every } if every.is_zero() => Err(ScheduleError::InvalidTrigger(
                "interval must be greater than zero".to_string(),
            )),
            Trigger::Interval { .. } => Ok(()),
            Trigger::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// First fire time strictly after `after`
    ///
    /// `None` when a cron expression has no further matches.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Trigger::Interval { every } => {
                if every.is_zero() {
                    return Err(ScheduleError::InvalidTrigger(
                        "interval must be greater than zero".to_string(),
                    ));
                }
                Ok(Some(clock::after(after, *every)))
            }
            Trigger::Cron { expression } => Ok(parse_cron(expression)?.after(&after).next()),
        }
    }
}

/// Convert a 5-field Unix cron expression to the 6-field form
///
/// The `cron` crate wants seconds first; 5-field expressions fire at
/// second 0.
fn normalize_cron_expr(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(&normalize_cron_expr(expression)).map_err(|e| {
        ScheduleError::InvalidTrigger(format!("invalid cron expression '{}': {}", expression, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_normalize_cron_expr() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("0  *  * * *"), "0 0 * * * *");
        assert_eq!(normalize_cron_expr("30 0 * * * *"), "30 0 * * * *");
    }

    #[test]
    fn test_validate() {
        assert!(Trigger::cron("0 * * * *").validate().is_ok());
        assert!(Trigger::cron("*/10 * * * * *").validate().is_ok());
        assert!(Trigger::interval(Duration::from_secs(60)).validate().is_ok());

        let err = Trigger::cron("every tuesday").validate().unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTrigger(_)));
        assert!(Trigger::cron("").validate().is_err());
        assert!(Trigger::interval(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_next_after_interval() {
        let trigger = Trigger::interval(Duration::from_secs(90));
        assert_eq!(trigger.next_after(at(10, 0, 0)).unwrap(), Some(at(10, 1, 30)));
    }

    #[test]
    fn test_next_after_cron_is_strictly_later() {
        let hourly = Trigger::cron("0 * * * *");
        assert_eq!(hourly.next_after(at(10, 0, 0)).unwrap(), Some(at(11, 0, 0)));
        assert_eq!(hourly.next_after(at(10, 59, 59)).unwrap(), Some(at(11, 0, 0)));

        let every_ten_seconds = Trigger::cron("*/10 * * * * *");
        assert_eq!(
            every_ten_seconds.next_after(at(10, 0, 5)).unwrap(),
            Some(at(10, 0, 10))
        );
    }

    #[test]
    fn test_wire_format() {
        let trigger = Trigger::interval(Duration::from_secs(5));
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "interval", "every": 5000 }));
    }
}
