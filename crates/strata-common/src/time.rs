use chrono::{DateTime, SubsecRound, Utc};

/// Current UTC time truncated to milliseconds, the precision kept in
/// on-disk metadata.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
