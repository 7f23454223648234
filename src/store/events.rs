//! Events, subscriptions and the notification inbox.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Value};

use super::tickets::{ticket_from, ticket_visible, viewer_value};
use super::{align, format_datetime, now, parse_datetime, placeholders};
use crate::error::{Error, Result};
use crate::types::{
    Cursor, Event, EventNotification, EventType, Subscription, SubscriptionTarget,
    TicketResolution, TicketStatus,
};

const EVENT_COLUMNS: &str = "e.id, e.created, e.event_type, e.ticket_id, e.participant_id, \
     e.by_participant_id, e.comment_id, e.label_id, e.from_ticket_id, e.old_status, \
     e.new_status, e.old_resolution, e.new_resolution";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        created: parse_datetime(&row.get::<_, String>(1)?),
        event_type: row.get(2)?,
        ticket_id: row.get(3)?,
        participant_id: row.get(4)?,
        by_participant_id: row.get(5)?,
        comment_id: row.get(6)?,
        label_id: row.get(7)?,
        from_ticket_id: row.get(8)?,
        old_status: row.get(9)?,
        new_status: row.get(10)?,
        old_resolution: row.get(11)?,
        new_resolution: row.get(12)?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: EventType,
    pub ticket_id: i64,
    pub participant_id: Option<i64>,
    pub by_participant_id: Option<i64>,
    pub comment_id: Option<i64>,
    pub label_id: Option<i64>,
    pub from_ticket_id: Option<i64>,
    pub old_status: Option<TicketStatus>,
    pub new_status: Option<TicketStatus>,
    pub old_resolution: Option<TicketResolution>,
    pub new_resolution: Option<TicketResolution>,
    pub created: Option<chrono::DateTime<chrono::Utc>>,
}

impl NewEvent {
    #[must_use]
    pub fn new(event_type: EventType, ticket_id: i64, participant_id: i64) -> Self {
        Self {
            event_type,
            ticket_id,
            participant_id: Some(participant_id),
            ..Self::default()
        }
    }
}

pub fn insert_event(conn: &Connection, event: &NewEvent) -> Result<i64> {
    if event.event_type.bits() == 0 {
        return Err(Error::invariant("event inserted with an empty type mask"));
    }
    let created = event.created.as_ref().map_or_else(now, format_datetime);
    conn.execute(
        "INSERT INTO event (created, event_type, ticket_id, participant_id, by_participant_id,
             comment_id, label_id, from_ticket_id, old_status, new_status, old_resolution,
             new_resolution)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            created,
            event.event_type,
            event.ticket_id,
            event.participant_id,
            event.by_participant_id,
            event.comment_id,
            event.label_id,
            event.from_ticket_id,
            event.old_status,
            event.new_status,
            event.old_resolution,
            event.new_resolution,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_event(conn: &Connection, id: i64) -> Result<Option<Event>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM event e WHERE e.id = ?1"),
        params![id],
        event_from_row,
    )
    .optional()
    .map_err(Error::from)
}

pub fn events_by_ids(
    conn: &Connection,
    viewer: Option<i64>,
    ids: &[i64],
) -> Result<Vec<Option<Event>>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM {} JOIN event e ON e.ticket_id = tk.id
         WHERE e.id IN ({}) AND {}",
        ticket_from(),
        placeholders(2, ids.len()),
        ticket_visible(),
    );
    let mut args = vec![viewer_value(viewer)];
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(align(ids, rows, |e| e.id))
}

/// A ticket's events, newest first.
pub fn list_events(conn: &Connection, ticket_id: i64, cursor: &Cursor) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM event e
         WHERE e.ticket_id = ?1 AND (?2 IS NULL OR e.id < ?2)
         ORDER BY e.id DESC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![ticket_id, cursor.next, cursor.fetch_limit()],
            event_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A ticket's full history in insertion order.
pub fn all_events(conn: &Connection, ticket_id: i64) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM event e WHERE e.ticket_id = ?1 ORDER BY e.id ASC"
    ))?;
    let rows = stmt
        .query_map(params![ticket_id], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// Subscription operations

type SubscriptionRow = (i64, String, i64, Option<i64>, Option<i64>);

fn subscription_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_subscription(row: SubscriptionRow) -> Result<Subscription> {
    let (id, created, participant_id, ticket_id, tracker_id) = row;
    let target = match (ticket_id, tracker_id) {
        (Some(ticket), None) => SubscriptionTarget::Ticket(ticket),
        (None, Some(tracker)) => SubscriptionTarget::Tracker(tracker),
        _ => {
            return Err(Error::invariant(format!(
                "subscription {id} must reference exactly one of ticket or tracker"
            )));
        }
    };
    Ok(Subscription {
        id,
        created: parse_datetime(&created),
        participant_id,
        target,
    })
}

const SUBSCRIPTION_COLUMNS: &str = "id, created, participant_id, ticket_id, tracker_id";

fn target_columns(target: SubscriptionTarget) -> (Option<i64>, Option<i64>) {
    match target {
        SubscriptionTarget::Ticket(id) => (Some(id), None),
        SubscriptionTarget::Tracker(id) => (None, Some(id)),
    }
}

/// Subscribes a participant. Subscribing twice returns the existing row.
pub fn subscribe(
    conn: &Connection,
    participant_id: i64,
    target: SubscriptionTarget,
) -> Result<Subscription> {
    let (ticket_id, tracker_id) = target_columns(target);
    conn.execute(
        "INSERT INTO ticket_subscription (created, participant_id, ticket_id, tracker_id)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT DO NOTHING",
        params![now(), participant_id, ticket_id, tracker_id],
    )?;
    get_subscription(conn, participant_id, target)?
        .ok_or_else(|| Error::invariant("subscription missing after upsert"))
}

pub fn get_subscription(
    conn: &Connection,
    participant_id: i64,
    target: SubscriptionTarget,
) -> Result<Option<Subscription>> {
    let (ticket_id, tracker_id) = target_columns(target);
    conn.query_row(
        &format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM ticket_subscription
             WHERE participant_id = ?1 AND ticket_id IS ?2 AND tracker_id IS ?3"
        ),
        params![participant_id, ticket_id, tracker_id],
        subscription_row,
    )
    .optional()?
    .map(into_subscription)
    .transpose()
}

pub fn unsubscribe(
    conn: &Connection,
    participant_id: i64,
    target: SubscriptionTarget,
) -> Result<bool> {
    let (ticket_id, tracker_id) = target_columns(target);
    let rows = conn.execute(
        "DELETE FROM ticket_subscription
         WHERE participant_id = ?1 AND ticket_id IS ?2 AND tracker_id IS ?3",
        params![participant_id, ticket_id, tracker_id],
    )?;
    Ok(rows > 0)
}

/// A participant's subscriptions, newest first.
pub fn list_subscriptions(
    conn: &Connection,
    participant_id: i64,
    cursor: &Cursor,
) -> Result<Vec<Subscription>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM ticket_subscription
         WHERE participant_id = ?1 AND (?2 IS NULL OR id < ?2)
         ORDER BY id DESC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![participant_id, cursor.next, cursor.fetch_limit()],
            subscription_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_subscription).collect()
}

// Notification operations

/// A user's inbox, newest first.
pub fn list_notifications(
    conn: &Connection,
    user_id: i64,
    cursor: &Cursor,
) -> Result<Vec<EventNotification>> {
    let mut stmt = conn.prepare(
        "SELECT id, created, event_id, user_id FROM event_notification
         WHERE user_id = ?1 AND (?2 IS NULL OR id < ?2)
         ORDER BY id DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![user_id, cursor.next, cursor.fetch_limit()], |row| {
            Ok(EventNotification {
                id: row.get(0)?,
                created: parse_datetime(&row.get::<_, String>(1)?),
                event_id: row.get(2)?,
                user_id: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
