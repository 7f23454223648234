use serde_json::{Value, json};

use crate::error::Result;
use crate::types::{Event, Label, Ticket, Tracker};

/// The record a webhook event is about.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Tracker(&'a Tracker),
    Ticket(&'a Ticket),
    Label(&'a Label, &'a Tracker),
    Event(&'a Event, &'a Ticket),
}

impl Subject<'_> {
    pub(super) fn tracker_id(&self) -> Option<i64> {
        Some(match self {
            Subject::Tracker(tracker) => tracker.id,
            Subject::Ticket(ticket) | Subject::Event(_, ticket) => ticket.tracker_id,
            Subject::Label(label, _) => label.tracker_id,
        })
    }

    /// The `subject` field of a modern payload: the record as the API shows it.
    pub(super) fn modern(&self) -> Result<Value> {
        Ok(match self {
            Subject::Tracker(tracker) => serde_json::to_value(tracker)?,
            Subject::Ticket(ticket) => serde_json::to_value(ticket)?,
            Subject::Label(label, _) => serde_json::to_value(label)?,
            Subject::Event(event, _) => serde_json::to_value(event)?,
        })
    }

    /// The event-kind-specific body sent to legacy subscriptions.
    pub(super) fn legacy(&self) -> Value {
        match self {
            Subject::Tracker(tracker) => legacy_tracker(tracker),
            Subject::Ticket(ticket) => legacy_ticket(ticket),
            Subject::Label(label, tracker) => json!({
                "name": label.name,
                "colors": {
                    "background": label.background_color,
                    "foreground": label.foreground_color,
                },
                "created": label.created,
                "tracker": short_tracker(tracker.id, &tracker.owner_name, &tracker.name),
            }),
            Subject::Event(event, ticket) => json!({
                "id": event.id,
                "created": event.created,
                "event_type": event.event_type.names(),
                "old_status": event.old_status,
                "old_resolution": event.old_resolution,
                "new_status": event.new_status,
                "new_resolution": event.new_resolution,
                "ticket": legacy_ticket(ticket),
            }),
        }
    }
}

fn short_owner(owner: &str) -> Value {
    json!({ "canonical_name": format!("~{owner}"), "name": owner })
}

fn short_tracker(id: i64, owner: &str, name: &str) -> Value {
    json!({ "id": id, "owner": short_owner(owner), "name": name })
}

fn legacy_tracker(tracker: &Tracker) -> Value {
    json!({
        "id": tracker.id,
        "owner": short_owner(&tracker.owner_name),
        "created": tracker.created,
        "updated": tracker.updated,
        "name": tracker.name,
        "description": tracker.description,
        "visibility": tracker.visibility,
        "default_access": tracker.default_access.to_strings(),
    })
}

fn legacy_ticket(ticket: &Ticket) -> Value {
    json!({
        "id": ticket.scoped_id,
        "ref": ticket.reference().to_string(),
        "tracker": short_tracker(ticket.tracker_id, &ticket.owner_name, &ticket.tracker_name),
        "subject": ticket.subject,
        "body": ticket.body,
        "status": ticket.status,
        "resolution": ticket.resolution,
        "created": ticket.created,
        "updated": ticket.updated,
    })
}
