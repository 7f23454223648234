use rusqlite::Connection;
use serde::Deserialize;

use super::{Actor, visible_tracker};
use crate::error::{Error, Result};
use crate::store::webhooks::{self as store, NewWebhook};
use crate::types::{Cursor, Page, WebhookDelivery, WebhookKind, WebhookSubscription, paginate};
use crate::validation::validate_webhook_url;
use crate::webhooks::validate_events;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookInput {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
}

fn is_tracker_kind(kind: WebhookKind) -> bool {
    matches!(kind, WebhookKind::LegacyTracker | WebhookKind::Tracker)
}

/// Creates a subscription of `kind`. Tracker kinds need a tracker the actor
/// can see; modern kinds need a query document.
pub fn create_webhook(
    conn: &Connection,
    actor: &Actor<'_>,
    kind: WebhookKind,
    tracker_id: Option<i64>,
    input: &WebhookInput,
) -> Result<WebhookSubscription> {
    validate_webhook_url(&input.url)?;
    validate_events(kind, &input.events)?;
    let query = input.query.as_deref().filter(|q| !q.trim().is_empty());
    if kind.is_legacy() && query.is_some() {
        return Err(Error::Invalid("legacy webhooks do not take a query".into()));
    }

    let tracker_id = match (is_tracker_kind(kind), tracker_id) {
        (true, Some(id)) => Some(visible_tracker(conn, actor, id)?.id),
        (true, None) => return Err(Error::Invalid("a tracker is required".into())),
        (false, _) => None,
    };
    let sub = store::create_webhook(
        conn,
        &NewWebhook {
            kind,
            user_id: actor.user.id,
            tracker_id,
            url: &input.url,
            events: &input.events,
            query,
        },
    )?;
    tracing::info!(kind = kind.name(), subscription = sub.id, "created webhook subscription");
    Ok(sub)
}

pub fn get_webhook(
    conn: &Connection,
    actor: &Actor<'_>,
    kind: WebhookKind,
    id: i64,
) -> Result<WebhookSubscription> {
    store::get_webhook(conn, kind, id, actor.user.id)?.ok_or(Error::NotFound)
}

pub fn list_webhooks(
    conn: &Connection,
    actor: &Actor<'_>,
    kind: WebhookKind,
    tracker_id: Option<i64>,
    cursor: &Cursor,
) -> Result<Page<WebhookSubscription>> {
    let rows = store::list_webhooks(conn, kind, actor.user.id, tracker_id, cursor)?;
    Ok(paginate(rows, cursor, |s| s.id))
}

pub fn delete_webhook(
    conn: &Connection,
    actor: &Actor<'_>,
    kind: WebhookKind,
    id: i64,
) -> Result<WebhookSubscription> {
    let sub = get_webhook(conn, actor, kind, id)?;
    store::delete_webhook(conn, kind, id, actor.user.id)?;
    Ok(sub)
}

/// Deliveries of one of the actor's subscriptions.
pub fn list_deliveries(
    conn: &Connection,
    actor: &Actor<'_>,
    kind: WebhookKind,
    id: i64,
    cursor: &Cursor,
) -> Result<Page<WebhookDelivery>> {
    let sub = get_webhook(conn, actor, kind, id)?;
    let rows = store::list_deliveries(conn, kind, sub.id, cursor)?;
    Ok(paginate(rows, cursor, |d| d.id))
}
