//! Cron-style launch windows evaluated in a fixed timezone.

use crate::error::ScheduleError;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use tracing::trace;

/// A cron expression that has already been parsed.
///
/// Expressions use the `cron` crate dialect: six or seven space separated fields with
/// seconds first (`sec min hour day-of-month month day-of-week [year]`).
#[derive(Clone)]
pub struct CronExpr {
  raw: String,
  schedule: CronSchedule,
}

impl CronExpr {
  pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
    let trimmed = expr.trim();
    let schedule =
      CronSchedule::from_str(trimmed).map_err(|e| ScheduleError::InvalidExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
      })?;
    Ok(Self {
      raw: trimmed.to_string(),
      schedule,
    })
  }

  /// Parses a whole list, failing on the first invalid entry.
  pub fn parse_all<S: AsRef<str>>(exprs: &[S]) -> Result<Vec<Self>, ScheduleError> {
    exprs.iter().map(|e| Self::parse(e.as_ref())).collect()
  }

  pub fn as_str(&self) -> &str {
    &self.raw
  }
}

impl fmt::Debug for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("CronExpr").field(&self.raw).finish()
  }
}

impl fmt::Display for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.raw)
  }
}

impl PartialEq for CronExpr {
  fn eq(&self, other: &Self) -> bool {
    self.raw == other.raw
  }
}

impl FromStr for CronExpr {
  type Err = ScheduleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

/// Decides whether an instant falls inside any of a classroom's launch windows.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleEvaluator {
  tz: Tz,
}

impl ScheduleEvaluator {
  pub fn new(timezone: &str) -> Result<Self, ScheduleError> {
    let tz = timezone
      .parse::<Tz>()
      .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;
    Ok(Self { tz })
  }

  pub fn timezone(&self) -> Tz {
    self.tz
  }

  /// True if `instant`, seen in the configured zone and truncated to the second, is one of
  /// the expression's firing times.
  pub fn matches_at(&self, expr: &CronExpr, instant: DateTime<Utc>) -> bool {
    let local = instant.with_timezone(&self.tz);
    let local = local.with_nanosecond(0).unwrap_or(local);
    let probe = local - ChronoDuration::seconds(1);
    let matched = expr
      .schedule
      .after(&probe)
      .next()
      .map_or(false, |next| next == local);
    trace!(expr = %expr, %local, matched, "Evaluated cron expression.");
    matched
  }

  /// Logical OR across every expression. An empty list never matches.
  pub fn any_matches_at(&self, exprs: &[CronExpr], instant: DateTime<Utc>) -> bool {
    exprs.iter().any(|expr| self.matches_at(expr, instant))
  }

  pub fn any_matches_now(&self, exprs: &[CronExpr]) -> bool {
    self.any_matches_at(exprs, Utc::now())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn evaluator() -> ScheduleEvaluator {
    ScheduleEvaluator::new("Asia/Taipei").unwrap()
  }

  #[test]
  fn every_second_always_matches() {
    let expr = CronExpr::parse("* * * * * *").unwrap();
    assert!(evaluator().matches_at(&expr, Utc::now()));
  }

  #[test]
  fn hours_are_read_in_configured_zone() {
    // 09:xx in Taipei is 01:xx UTC.
    let expr = CronExpr::parse("* * 9 * * *").unwrap();
    let at = Utc.with_ymd_and_hms(2024, 3, 4, 1, 30, 15).unwrap();
    assert!(evaluator().matches_at(&expr, at));
    let utc_nine = Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 15).unwrap();
    assert!(!evaluator().matches_at(&expr, utc_nine));
  }

  #[test]
  fn sub_second_instants_are_truncated() {
    let expr = CronExpr::parse("30 * * * * *").unwrap();
    let at = Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 30).unwrap() + ChronoDuration::milliseconds(750);
    assert!(evaluator().matches_at(&expr, at));
  }

  #[test]
  fn any_is_a_logical_or() {
    let exprs = CronExpr::parse_all(&["* * 3 * * *", "* * 9 * * *"]).unwrap();
    let at = Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap();
    assert!(evaluator().any_matches_at(&exprs, at));
    assert!(!evaluator().any_matches_at(&[], at));
  }

  #[test]
  fn invalid_expressions_are_rejected() {
    assert!(matches!(
      CronExpr::parse("every monday"),
      Err(ScheduleError::InvalidExpression { .. })
    ));
    assert!(CronExpr::parse_all(&["* * * * * *", "bogus"]).is_err());
    assert!(ScheduleEvaluator::new("Nowhere/Land").is_err());
  }
}
