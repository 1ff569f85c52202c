use chrono::{DateTime, Local};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

use crate::pw::error::ProgramError;

/// Cron schedule for a program. Accepts five-field standard form and the
/// `@descriptor` shorthands. The underlying parser wants a seconds field, so
/// five-field input gets `0` prepended.
#[derive(Debug, Clone)]
pub struct Schedule {
    expr: String,
    inner: CronSchedule,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Schedule, ProgramError> {
        let normalized = normalize_cron_expr(expr);
        let inner = CronSchedule::from_str(&normalized).map_err(|e| ProgramError::Schedule {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Schedule {
            expr: expr.to_string(),
            inner,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        self.inner.after(&now).next()
    }
}

fn normalize_cron_expr(expr: &str) -> String {
    match expr.trim() {
        "@minutely" => "0 * * * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * SUN".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        t => {
            let parts: Vec<&str> = t.split_whitespace().collect();
            if parts.len() == 5 {
                format!("0 {t}")
            } else {
                t.to_string()
            }
        }
    }
}
