//! Schedule rules.

use crate::error::JobsError;
use chrono::{DateTime, TimeZone, Utc};
use std::str::FromStr;
use std::time::Duration;

/// When a scheduled task fires.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Cron expression with seconds, e.g. `0 */5 * * * *`.
    Cron(Box<cron::Schedule>),
    /// Fixed period. Ticks fall on multiples of the period since the Unix
    /// epoch, so every process computes the same tick times.
    Every(Duration),
    /// A single point in time.
    At(DateTime<Utc>),
}

impl Rule {
    pub fn cron(expr: &str) -> Result<Self, JobsError> {
        let schedule = cron::Schedule::from_str(expr).map_err(|e| JobsError::Schedule {
            rule: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Rule::Cron(Box::new(schedule)))
    }

    pub fn every(period: Duration) -> Self {
        Rule::Every(period)
    }

    pub fn at(when: DateTime<Utc>) -> Self {
        Rule::At(when)
    }

    /// First tick strictly after `after`, or `None` if the rule is exhausted.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Rule::Cron(schedule) => schedule.after(&after).next(),
            Rule::Every(period) => {
                let period_ms = i64::try_from(period.as_millis()).ok().filter(|p| *p > 0)?;
                let next_ms = (after.timestamp_millis().div_euclid(period_ms) + 1) * period_ms;
                Utc.timestamp_millis_opt(next_ms).single()
            }
            Rule::At(when) => (*when > after).then_some(*when),
        }
    }
}

impl FromStr for Rule {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rule::cron(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_every_is_epoch_aligned() {
        let rule = Rule::every(Duration::from_secs(5));
        assert_eq!(rule.next_after(at(12_345)), Some(at(15_000)));
        assert_eq!(rule.next_after(at(15_000)), Some(at(20_000)));
    }

    #[test]
    fn test_zero_period_never_fires() {
        assert_eq!(Rule::every(Duration::ZERO).next_after(at(0)), None);
    }

    #[test]
    fn test_at_fires_once() {
        let rule = Rule::at(at(10_000));
        assert_eq!(rule.next_after(at(5_000)), Some(at(10_000)));
        assert_eq!(rule.next_after(at(10_000)), None);
    }

    #[test]
    fn test_cron_next() {
        let rule = Rule::cron("0 */5 * * * *").unwrap();
        // 00:01:00 -> 00:05:00
        assert_eq!(rule.next_after(at(60_000)), Some(at(300_000)));
    }

    #[test]
    fn test_invalid_cron() {
        let err = "not a cron".parse::<Rule>().unwrap_err();
        assert!(matches!(err, JobsError::Schedule { .. }));
    }
}
