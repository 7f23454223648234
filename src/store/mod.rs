//! SQLite persistence.
//!
//! Entity queries are free functions over `&Connection` so the same code runs
//! on the shared request connection, inside a caller's `Transaction` (which
//! derefs to `Connection`), or on a dedicated background connection.

mod schema;
mod sqlite;
pub mod events;
pub mod participants;
pub mod tickets;
pub mod trackers;
pub mod users;
pub mod webhooks;

pub use sqlite::{SqliteStore, run_in_transaction};

use chrono::{DateTime, SecondsFormat, Utc};

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// Fixed-width UTC timestamps, so text comparison in SQL orders by time.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> String {
    format_datetime(&Utc::now())
}

/// Builds `?{start}, ?{start+1}, ...` for `n` positional parameters.
pub(crate) fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reorders fetched rows to match `keys`, leaving `None` for missing keys.
pub(crate) fn align<K, V, F>(keys: &[K], rows: Vec<V>, key_of: F) -> Vec<Option<V>>
where
    K: Eq + std::hash::Hash,
    V: Clone,
    F: Fn(&V) -> K,
{
    let by_key: std::collections::HashMap<K, V> =
        rows.into_iter().map(|row| (key_of(&row), row)).collect();
    keys.iter().map(|key| by_key.get(key).cloned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "?2, ?3, ?4");
        assert_eq!(placeholders(1, 0), "");
    }

    #[test]
    fn test_align_preserves_input_order() {
        let rows = vec![(3, "c"), (1, "a")];
        let aligned = align(&[1, 2, 3, 1], rows, |row| row.0);
        assert_eq!(aligned, vec![Some((1, "a")), None, Some((3, "c")), Some((1, "a"))]);
    }
}
