//! Webhook subscriptions and the delivery outbox.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{format_datetime, now, parse_datetime};
use crate::error::{Error, Result};
use crate::types::{Cursor, WebhookDelivery, WebhookKind, WebhookSubscription};

fn split_events(events: &str) -> Vec<String> {
    events
        .split(',')
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

fn subscription_columns(kind: WebhookKind) -> &'static str {
    match kind {
        WebhookKind::LegacyUser => "id, created, url, events, NULL, user_id, NULL",
        WebhookKind::LegacyTracker => "id, created, url, events, NULL, user_id, tracker_id",
        WebhookKind::User => "id, created, url, events, query, user_id, NULL",
        WebhookKind::Tracker => "id, created, url, events, query, user_id, tracker_id",
    }
}

fn subscription_from_row(kind: WebhookKind, row: &Row<'_>) -> rusqlite::Result<WebhookSubscription> {
    Ok(WebhookSubscription {
        id: row.get(0)?,
        kind,
        created: parse_datetime(&row.get::<_, String>(1)?),
        url: row.get(2)?,
        events: split_events(&row.get::<_, String>(3)?),
        query: row.get(4)?,
        user_id: row.get(5)?,
        tracker_id: row.get(6)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewWebhook<'a> {
    pub kind: WebhookKind,
    pub user_id: i64,
    pub tracker_id: Option<i64>,
    pub url: &'a str,
    pub events: &'a [String],
    pub query: Option<&'a str>,
}

pub fn create_webhook(conn: &Connection, hook: &NewWebhook<'_>) -> Result<WebhookSubscription> {
    let events = hook.events.join(",");
    let created = now();
    match hook.kind {
        WebhookKind::LegacyUser => conn.execute(
            "INSERT INTO user_webhook_subscription (created, url, events, user_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![created, hook.url, events, hook.user_id],
        )?,
        WebhookKind::User => {
            let query = hook
                .query
                .ok_or_else(|| Error::Invalid("a query is required".into()))?;
            conn.execute(
                "INSERT INTO gql_user_wh_sub (created, url, events, query, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![created, hook.url, events, query, hook.user_id],
            )?
        }
        WebhookKind::LegacyTracker => {
            let tracker_id = hook
                .tracker_id
                .ok_or_else(|| Error::Invalid("a tracker is required".into()))?;
            conn.execute(
                "INSERT INTO tracker_webhook_subscription (created, url, events, user_id, tracker_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![created, hook.url, events, hook.user_id, tracker_id],
            )?
        }
        WebhookKind::Tracker => {
            let tracker_id = hook
                .tracker_id
                .ok_or_else(|| Error::Invalid("a tracker is required".into()))?;
            let query = hook
                .query
                .ok_or_else(|| Error::Invalid("a query is required".into()))?;
            conn.execute(
                "INSERT INTO gql_tracker_wh_sub (created, url, events, query, user_id, tracker_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![created, hook.url, events, query, hook.user_id, tracker_id],
            )?
        }
    };
    get_webhook(conn, hook.kind, conn.last_insert_rowid(), hook.user_id)?
        .ok_or_else(|| Error::invariant("inserted webhook subscription vanished"))
}

/// Loads a subscription owned by `user_id`.
pub fn get_webhook(
    conn: &Connection,
    kind: WebhookKind,
    id: i64,
    user_id: i64,
) -> Result<Option<WebhookSubscription>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM {} WHERE id = ?1 AND user_id = ?2",
            subscription_columns(kind),
            kind.table()
        ),
        params![id, user_id],
        |row| subscription_from_row(kind, row),
    )
    .optional()
    .map_err(Error::from)
}

/// Lists a user's subscriptions of one kind, newest first.
pub fn list_webhooks(
    conn: &Connection,
    kind: WebhookKind,
    user_id: i64,
    tracker_id: Option<i64>,
    cursor: &Cursor,
) -> Result<Vec<WebhookSubscription>> {
    let tracker_filter = match kind {
        WebhookKind::LegacyTracker | WebhookKind::Tracker => "AND (?2 IS NULL OR tracker_id = ?2)",
        WebhookKind::LegacyUser | WebhookKind::User => "",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE user_id = ?1 {tracker_filter}
           AND (?3 IS NULL OR id < ?3)
         ORDER BY id DESC LIMIT ?4",
        subscription_columns(kind),
        kind.table(),
    ))?;
    let rows = stmt
        .query_map(
            params![user_id, tracker_id, cursor.next, cursor.fetch_limit()],
            |row| subscription_from_row(kind, row),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_webhook(conn: &Connection, kind: WebhookKind, id: i64, user_id: i64) -> Result<bool> {
    let rows = conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1 AND user_id = ?2", kind.table()),
        params![id, user_id],
    )?;
    Ok(rows > 0)
}

/// Selects the subscriptions an event fans out to.
///
/// User subscriptions match on the acting user; tracker subscriptions match
/// on the tracker.
pub fn matching_webhooks(
    conn: &Connection,
    kind: WebhookKind,
    user_id: i64,
    tracker_id: Option<i64>,
    event: &str,
) -> Result<Vec<WebhookSubscription>> {
    let (filter, key) = match kind {
        WebhookKind::LegacyUser | WebhookKind::User => ("user_id = ?1", Some(user_id)),
        WebhookKind::LegacyTracker | WebhookKind::Tracker => ("tracker_id = ?1", tracker_id),
    };
    let Some(key) = key else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE {filter} ORDER BY id ASC",
        subscription_columns(kind),
        kind.table(),
    ))?;
    let rows = stmt
        .query_map(params![key], |row| subscription_from_row(kind, row))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|sub| sub.events.iter().any(|e| e == event))
        .collect())
}

// Delivery outbox

const DELIVERY_COLUMNS: &str = "id, uuid, created, kind, subscription_id, event, url, query, \
     payload, attempts, response_status, delivered_at";

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookDelivery> {
    let kind: String = row.get(3)?;
    let kind = WebhookKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown webhook kind {kind}").into(),
        )
    })?;
    Ok(WebhookDelivery {
        id: row.get(0)?,
        uuid: row.get(1)?,
        created: parse_datetime(&row.get::<_, String>(2)?),
        kind,
        subscription_id: row.get(4)?,
        event: row.get(5)?,
        url: row.get(6)?,
        query: row.get(7)?,
        payload: row.get(8)?,
        attempts: row.get(9)?,
        response_status: row.get(10)?,
        delivered_at: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_datetime(&s)),
    })
}

#[derive(Debug, Clone)]
pub struct NewDelivery<'a> {
    pub uuid: &'a str,
    pub kind: WebhookKind,
    pub subscription_id: i64,
    pub event: &'a str,
    pub url: &'a str,
    pub query: Option<&'a str>,
    pub payload: &'a str,
}

/// Writes a delivery to the outbox. Inside a transaction the row is only
/// visible to the delivery worker once the transaction commits.
pub fn enqueue_delivery(conn: &Connection, delivery: &NewDelivery<'_>) -> Result<i64> {
    let ts = now();
    conn.execute(
        "INSERT INTO webhook_delivery (uuid, created, kind, subscription_id, event, url, query,
             payload, next_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?2)",
        params![
            delivery.uuid,
            ts,
            delivery.kind.name(),
            delivery.subscription_id,
            delivery.event,
            delivery.url,
            delivery.query,
            delivery.payload,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Undelivered rows that are due and still have attempts left.
pub fn due_deliveries(
    conn: &Connection,
    at: &DateTime<Utc>,
    max_attempts: u32,
    limit: usize,
) -> Result<Vec<WebhookDelivery>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DELIVERY_COLUMNS} FROM webhook_delivery
         WHERE delivered_at IS NULL AND attempts < ?1 AND next_attempt_at <= ?2
         ORDER BY id ASC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![
                max_attempts,
                format_datetime(at),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            delivery_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Earliest pending retry time, if any row still has attempts left.
pub fn next_due_at(conn: &Connection, max_attempts: u32) -> Result<Option<DateTime<Utc>>> {
    let next: Option<String> = conn.query_row(
        "SELECT MIN(next_attempt_at) FROM webhook_delivery
         WHERE delivered_at IS NULL AND attempts < ?1",
        params![max_attempts],
        |row| row.get(0),
    )?;
    Ok(next.map(|s| parse_datetime(&s)))
}

/// Records one delivery attempt. `retry_at` is ignored for successful
/// deliveries.
pub fn record_attempt(
    conn: &Connection,
    id: i64,
    response_status: Option<u16>,
    delivered: bool,
    retry_at: &DateTime<Utc>,
) -> Result<()> {
    let delivered_at = delivered.then(now);
    conn.execute(
        "UPDATE webhook_delivery SET attempts = attempts + 1, response_status = ?1,
             delivered_at = ?2, next_attempt_at = ?3
         WHERE id = ?4",
        params![response_status, delivered_at, format_datetime(retry_at), id],
    )?;
    Ok(())
}

/// Deliveries scheduled for one subscription, newest first.
pub fn list_deliveries(
    conn: &Connection,
    kind: WebhookKind,
    subscription_id: i64,
    cursor: &Cursor,
) -> Result<Vec<WebhookDelivery>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DELIVERY_COLUMNS} FROM webhook_delivery
         WHERE kind = ?1 AND subscription_id = ?2 AND (?3 IS NULL OR id < ?3)
         ORDER BY id DESC LIMIT ?4"
    ))?;
    let rows = stmt
        .query_map(
            params![kind.name(), subscription_id, cursor.next, cursor.fetch_limit()],
            delivery_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
            .connection()
            .execute_batch(
                r#"
                INSERT INTO "user" (id, created, updated, username, email)
                    VALUES (1, 'x', 'x', 'u1', 'u1@example.org');
                INSERT INTO tracker (id, owner_id, created, updated, name)
                    VALUES (7, 1, 'x', 'x', 'proj');
                "#,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_webhook_crud_and_matching() {
        let store = seeded();
        let conn = store.connection();
        let events = vec!["ticket:create".to_string(), "label:create".to_string()];

        let hook = create_webhook(
            &conn,
            &NewWebhook {
                kind: WebhookKind::LegacyTracker,
                user_id: 1,
                tracker_id: Some(7),
                url: "https://hooks.example.org/a",
                events: &events,
                query: None,
            },
        )
        .unwrap();
        assert_eq!(hook.events, events);
        assert_eq!(hook.tracker_id, Some(7));

        let matched =
            matching_webhooks(&conn, WebhookKind::LegacyTracker, 1, Some(7), "label:create")
                .unwrap();
        assert_eq!(matched.len(), 1);
        assert!(
            matching_webhooks(&conn, WebhookKind::LegacyTracker, 1, Some(7), "label:delete")
                .unwrap()
                .is_empty()
        );

        let listed =
            list_webhooks(&conn, WebhookKind::LegacyTracker, 1, None, &Cursor::default()).unwrap();
        assert_eq!(listed.len(), 1);

        assert!(delete_webhook(&conn, WebhookKind::LegacyTracker, hook.id, 1).unwrap());
        assert!(get_webhook(&conn, WebhookKind::LegacyTracker, hook.id, 1).unwrap().is_none());
    }

    #[test]
    fn test_modern_webhook_requires_query() {
        let store = seeded();
        let conn = store.connection();
        let events = vec!["TICKET_CREATED".to_string()];
        let result = create_webhook(
            &conn,
            &NewWebhook {
                kind: WebhookKind::User,
                user_id: 1,
                tracker_id: None,
                url: "https://hooks.example.org/b",
                events: &events,
                query: None,
            },
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn test_delivery_attempts() {
        let store = seeded();
        let conn = store.connection();
        let id = enqueue_delivery(
            &conn,
            &NewDelivery {
                uuid: "d-1",
                kind: WebhookKind::User,
                subscription_id: 1,
                event: "TICKET_CREATED",
                url: "https://hooks.example.org/c",
                query: Some("query { version }"),
                payload: "{}",
            },
        )
        .unwrap();

        let due = due_deliveries(&conn, &Utc::now(), 3, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);

        let later = Utc::now() + chrono::Duration::hours(1);
        record_attempt(&conn, id, Some(500), false, &later).unwrap();
        assert!(due_deliveries(&conn, &Utc::now(), 3, 10).unwrap().is_empty());
        assert!(next_due_at(&conn, 3).unwrap().is_some());

        record_attempt(&conn, id, Some(200), true, &Utc::now()).unwrap();
        assert!(next_due_at(&conn, 3).unwrap().is_none());
        let listed = list_deliveries(&conn, WebhookKind::User, 1, &Cursor::default()).unwrap();
        assert_eq!(listed[0].attempts, 2);
        assert!(listed[0].delivered_at.is_some());
    }
}
