//! Spend ceilings derived from the usage log.
//!
//! Per-principal spend is summed over the current day, week, and month
//! and compared against configured USD ceilings. Rejection happens on
//! the first window at or over its ceiling. Window boundaries use the
//! server's local clock: midnight for days, the most recent Sunday
//! 00:00 for weeks, and the first of the month for months.
//!
//! Accounting failures admit the request by default (a transient query
//! error must not block paying traffic); `COST_FAIL_CLOSED` flips that.

use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, Utc};
use tracing::warn;

use crate::config::CostLimits;
use crate::error::{GatewayError, SpendPeriod};
use crate::usage::UsageLog;

#[derive(Clone)]
pub struct CostGuard {
    usage: UsageLog,
    limits: CostLimits,
    fail_closed: bool,
}

/// Start of the current local day, as epoch milliseconds.
pub fn day_start_ms(now: DateTime<Local>) -> i64 {
    now.date_naive()
        .and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis())
}

/// Most recent Sunday 00:00 local time. Weeks run Sunday-to-Sunday in
/// the server's timezone.
pub fn week_start_ms(now: DateTime<Local>) -> i64 {
    let days_back = now.weekday().num_days_from_sunday() as i64;
    let sunday = now.date_naive() - Duration::days(days_back);
    sunday
        .and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis())
}

/// First of the current month, 00:00 local time.
pub fn month_start_ms(now: DateTime<Local>) -> i64 {
    now.date_naive()
        .with_day(1)
        .and_then(|d| d.and_time(NaiveTime::MIN).and_local_timezone(Local).earliest())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis())
}

fn next_boundary_description(period: SpendPeriod, now: DateTime<Local>) -> String {
    let next = match period {
        SpendPeriod::Daily => day_start_ms(now) + Duration::days(1).num_milliseconds(),
        SpendPeriod::Weekly => week_start_ms(now) + Duration::days(7).num_milliseconds(),
        SpendPeriod::Monthly => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            now.date_naive()
                .with_day(1)
                .and_then(|d| d.with_month(month))
                .and_then(|d| d.with_year(year))
                .and_then(|d| d.and_time(NaiveTime::MIN).and_local_timezone(Local).earliest())
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_else(|| now.timestamp_millis())
        }
    };
    let dt = DateTime::<Utc>::from_timestamp_millis(next).unwrap_or_else(Utc::now);
    format!("resets at {}", dt.to_rfc3339())
}

impl CostGuard {
    pub fn new(usage: UsageLog, limits: CostLimits, fail_closed: bool) -> Self {
        Self {
            usage,
            limits,
            fail_closed,
        }
    }

    /// Spend for one user over the three current windows, in cents.
    pub fn current_spend_cents(&self, user_id: &str) -> anyhow::Result<(i64, i64, i64)> {
        let now_local = Local::now();
        let now_ms = Utc::now().timestamp_millis() + 1;
        let daily = self
            .usage
            .spend_cents_between(user_id, day_start_ms(now_local), now_ms)?;
        let weekly = self
            .usage
            .spend_cents_between(user_id, week_start_ms(now_local), now_ms)?;
        let monthly = self
            .usage
            .spend_cents_between(user_id, month_start_ms(now_local), now_ms)?;
        Ok((daily, weekly, monthly))
    }

    pub fn limits(&self) -> CostLimits {
        self.limits
    }

    /// Gate a request on the configured ceilings. Anonymous principals
    /// bypass the check entirely.
    pub fn check(&self, user_id: &str) -> Result<(), GatewayError> {
        if user_id == "anonymous" {
            return Ok(());
        }

        let (daily, weekly, monthly) = match self.current_spend_cents(user_id) {
            Ok(spend) => spend,
            Err(err) => {
                if self.fail_closed {
                    return Err(GatewayError::Internal(format!(
                        "spend accounting unavailable: {}",
                        err
                    )));
                }
                warn!(user_id, "cost ceiling query failed, admitting request: {}", err);
                return Ok(());
            }
        };

        let now_local = Local::now();
        let checks = [
            (SpendPeriod::Daily, daily, self.limits.daily_usd),
            (SpendPeriod::Weekly, weekly, self.limits.weekly_usd),
            (SpendPeriod::Monthly, monthly, self.limits.monthly_usd),
        ];

        for (period, spent_cents, limit_usd) in checks {
            let limit_cents = (limit_usd * 100.0).round() as i64;
            if spent_cents >= limit_cents {
                return Err(GatewayError::SpendCapExceeded {
                    period,
                    limit: limit_usd,
                    current: spent_cents as f64 / 100.0,
                    reset_info: next_boundary_description(period, now_local),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, UsageLogEntry};

    fn guard(daily: f64, fail_closed: bool) -> CostGuard {
        let usage = UsageLog::new(Store::open_in_memory().unwrap());
        CostGuard::new(
            usage,
            CostLimits {
                daily_usd: daily,
                weekly_usd: 50.0,
                monthly_usd: 200.0,
            },
            fail_closed,
        )
    }

    fn spend(guard: &CostGuard, user: &str, cost_cents: i64) {
        guard.usage.log(UsageLogEntry {
            id: None,
            ts_ms: Utc::now().timestamp_millis(),
            user_id: user.to_string(),
            app_id: None,
            endpoint: "/v1/chat".to_string(),
            method: "POST".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost_cents,
            duration_ms: 1,
            status: 200,
            error: None,
        });
    }

    #[test]
    fn test_under_ceiling_passes() {
        let guard = guard(10.0, false);
        spend(&guard, "u1", 500);
        assert!(guard.check("u1").is_ok());
    }

    #[test]
    fn test_daily_ceiling_rejects() {
        let guard = guard(0.01, false);
        spend(&guard, "u1", 1);

        match guard.check("u1") {
            Err(GatewayError::SpendCapExceeded {
                period,
                limit,
                current,
                reset_info,
            }) => {
                assert_eq!(period, SpendPeriod::Daily);
                assert_eq!(limit, 0.01);
                assert!(current >= 0.01);
                assert!(reset_info.contains("resets at"));
            }
            other => panic!("expected spend_cap_exceeded, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_anonymous_bypasses() {
        let guard = guard(0.0, false);
        assert!(guard.check("anonymous").is_ok());
    }

    #[test]
    fn test_other_users_unaffected() {
        let guard = guard(0.01, false);
        spend(&guard, "u1", 100);
        assert!(guard.check("u1").is_err());
        assert!(guard.check("u2").is_ok());
    }

    #[test]
    fn test_window_boundary_math() {
        let now = Local::now();
        let day = day_start_ms(now);
        let week = week_start_ms(now);
        let month = month_start_ms(now);

        let now_ms = now.timestamp_millis();
        assert!(day <= now_ms);
        assert!(week <= day);
        assert!(month <= now_ms);
        // A day window is at most 24h behind now (25 around DST shifts).
        assert!(now_ms - day <= Duration::hours(25).num_milliseconds());
        // A week window is at most 7 days behind.
        assert!(now_ms - week <= Duration::days(8).num_milliseconds());
    }

    #[test]
    fn test_entry_before_midnight_counts_yesterday() {
        let guard = guard(0.01, false);
        let day_start = day_start_ms(Local::now());
        // Timestamped one ms before local midnight: previous day's total.
        guard.usage.log(UsageLogEntry {
            id: None,
            ts_ms: day_start - 1,
            user_id: "u1".to_string(),
            app_id: None,
            endpoint: "/v1/chat".to_string(),
            method: "POST".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost_cents: 100,
            duration_ms: 1,
            status: 200,
            error: None,
        });

        let (daily, _, _) = guard.current_spend_cents("u1").unwrap();
        assert_eq!(daily, 0);
    }
}
