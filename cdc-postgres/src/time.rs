use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01 00:00:00 UTC).
const POSTGRES_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// The Postgres epoch, used for timestamps in replication protocol messages.
pub static POSTGRES_EPOCH: LazyLock<SystemTime> =
    LazyLock::new(|| UNIX_EPOCH + Duration::from_secs(POSTGRES_EPOCH_UNIX_SECS));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_epoch_is_year_2000() {
        let since_unix = POSTGRES_EPOCH.duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(since_unix.as_secs(), 30 * 365 * 86_400 + 7 * 86_400);
    }
}
