//! Heartbeat cron validation (`spec.md` §4.4). Invalid expressions are
//! never fatal: callers log and skip the agent, per `spec.md` §7.
//!
//! Agent configs use standard 5-field crontab syntax (`"*/5 * * * *"`),
//! but the `cron` crate's `Schedule` requires a leading seconds field. We
//! prepend `"0 "` before parsing so a config carrying either form works;
//! a 6- or 7-field expression is passed through unchanged.

use std::str::FromStr;

use cron::Schedule;

use crate::error::CoreError;

/// Parse and validate a `heartbeat` cron expression, returning the
/// `cron::Schedule` the turn manager can fold into its job scheduler.
pub fn parse_heartbeat(expr: &str) -> Result<Schedule, CoreError> {
    let normalized = normalize_to_six_fields(expr);
    Schedule::from_str(&normalized).map_err(|e| CoreError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// `cron`'s parser wants 6 or 7 whitespace-separated fields (seconds
/// first). A bare 5-field crontab expression gets a `"0"` seconds field
/// prepended; anything else is left alone and will fail parsing on its
/// own terms.
fn normalize_to_six_fields(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_standard_five_field_expression() {
        assert!(parse_heartbeat("*/5 * * * *").is_ok());
    }

    #[test]
    fn accepts_six_field_expression_with_explicit_seconds() {
        assert!(parse_heartbeat("0 */5 * * * *").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_heartbeat("not a cron expression").is_err());
    }
}
