//! Webhook scheduling.
//!
//! Mutations schedule deliveries by writing outbox rows on their own
//! transaction, so a rolled-back mutation never emits a webhook. The
//! [`worker`] delivers rows after commit.

mod payload;
pub mod worker;

pub use payload::Subject;
pub use worker::{DeliveryQueue, DeliveryWorker};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::webhooks::{self, NewDelivery};
use crate::types::WebhookKind;

/// Events a webhook subscription can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookEvent {
    TrackerCreated,
    TrackerUpdate,
    TrackerDeleted,
    TicketCreated,
    TicketUpdate,
    TicketDeleted,
    LabelCreated,
    LabelUpdate,
    LabelDeleted,
    EventCreated,
}

impl WebhookEvent {
    pub const ALL: [WebhookEvent; 10] = [
        WebhookEvent::TrackerCreated,
        WebhookEvent::TrackerUpdate,
        WebhookEvent::TrackerDeleted,
        WebhookEvent::TicketCreated,
        WebhookEvent::TicketUpdate,
        WebhookEvent::TicketDeleted,
        WebhookEvent::LabelCreated,
        WebhookEvent::LabelUpdate,
        WebhookEvent::LabelDeleted,
        WebhookEvent::EventCreated,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            WebhookEvent::TrackerCreated => "TRACKER_CREATED",
            WebhookEvent::TrackerUpdate => "TRACKER_UPDATE",
            WebhookEvent::TrackerDeleted => "TRACKER_DELETED",
            WebhookEvent::TicketCreated => "TICKET_CREATED",
            WebhookEvent::TicketUpdate => "TICKET_UPDATE",
            WebhookEvent::TicketDeleted => "TICKET_DELETED",
            WebhookEvent::LabelCreated => "LABEL_CREATED",
            WebhookEvent::LabelUpdate => "LABEL_UPDATE",
            WebhookEvent::LabelDeleted => "LABEL_DELETED",
            WebhookEvent::EventCreated => "EVENT_CREATED",
        }
    }

    /// Name used by legacy subscriptions, e.g. `ticket:create`.
    #[must_use]
    pub const fn legacy_name(self) -> &'static str {
        match self {
            WebhookEvent::TrackerCreated => "tracker:create",
            WebhookEvent::TrackerUpdate => "tracker:update",
            WebhookEvent::TrackerDeleted => "tracker:delete",
            WebhookEvent::TicketCreated => "ticket:create",
            WebhookEvent::TicketUpdate => "ticket:update",
            WebhookEvent::TicketDeleted => "ticket:delete",
            WebhookEvent::LabelCreated => "label:create",
            WebhookEvent::LabelUpdate => "label:update",
            WebhookEvent::LabelDeleted => "label:delete",
            WebhookEvent::EventCreated => "event:create",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == s)
    }

    pub fn parse_legacy(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.legacy_name() == s)
    }

    /// The name a subscription of `kind` uses for this event.
    #[must_use]
    pub const fn name_for(self, kind: WebhookKind) -> &'static str {
        if kind.is_legacy() {
            self.legacy_name()
        } else {
            self.name()
        }
    }
}

/// Validates the event list of a new subscription of `kind`.
pub fn validate_events(kind: WebhookKind, events: &[String]) -> Result<()> {
    if events.is_empty() {
        return Err(Error::Invalid("at least one event is required".into()));
    }
    for event in events {
        let known = if kind.is_legacy() {
            WebhookEvent::parse_legacy(event).is_some()
        } else {
            WebhookEvent::parse(event).is_some()
        };
        if !known {
            return Err(Error::Invalid(format!("unknown webhook event {event}")));
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ModernPayload<'a> {
    uuid: &'a str,
    event: &'static str,
    timestamp: String,
    subject: serde_json::Value,
}

/// Schedules deliveries on behalf of the authenticated user whose mutation
/// is running on `conn`.
pub struct Dispatcher<'c> {
    conn: &'c Connection,
    user_id: i64,
}

impl<'c> Dispatcher<'c> {
    /// Fails with an invariant error when there is no authenticated user.
    pub fn new(conn: &'c Connection, user_id: Option<i64>) -> Result<Self> {
        let user_id = user_id
            .ok_or_else(|| Error::invariant("webhook dispatcher used without an authenticated user"))?;
        Ok(Self { conn, user_id })
    }

    /// Writes outbox rows for every subscription matching `event`, in both
    /// delivery modes. Returns the number of deliveries scheduled.
    pub fn schedule(&self, event: WebhookEvent, subject: &Subject<'_>) -> Result<usize> {
        let tracker_id = subject.tracker_id();
        let mut scheduled = 0;

        for kind in [WebhookKind::User, WebhookKind::Tracker] {
            let subs = webhooks::matching_webhooks(
                self.conn,
                kind,
                self.user_id,
                tracker_id,
                event.name(),
            )?;
            for sub in subs {
                let uuid = Uuid::new_v4().to_string();
                let payload = serde_json::to_string(&ModernPayload {
                    uuid: &uuid,
                    event: event.name(),
                    timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    subject: subject.modern()?,
                })?;
                webhooks::enqueue_delivery(
                    self.conn,
                    &NewDelivery {
                        uuid: &uuid,
                        kind,
                        subscription_id: sub.id,
                        event: event.name(),
                        url: &sub.url,
                        query: sub.query.as_deref(),
                        payload: &payload,
                    },
                )?;
                scheduled += 1;
            }
        }

        for kind in [WebhookKind::LegacyUser, WebhookKind::LegacyTracker] {
            let subs = webhooks::matching_webhooks(
                self.conn,
                kind,
                self.user_id,
                tracker_id,
                event.legacy_name(),
            )?;
            if subs.is_empty() {
                continue;
            }
            let payload = serde_json::to_string(&subject.legacy())?;
            for sub in subs {
                webhooks::enqueue_delivery(
                    self.conn,
                    &NewDelivery {
                        uuid: &Uuid::new_v4().to_string(),
                        kind,
                        subscription_id: sub.id,
                        event: event.legacy_name(),
                        url: &sub.url,
                        query: None,
                        payload: &payload,
                    },
                )?;
                scheduled += 1;
            }
        }

        if scheduled > 0 {
            tracing::debug!(event = event.name(), scheduled, "scheduled webhook deliveries");
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::store::trackers::{self, NewTracker};
    use crate::store::users::{self, NewUser};
    use crate::store::webhooks::NewWebhook;
    use crate::types::{Access, Cursor, Visibility};

    fn setup() -> (SqliteStore, i64, i64) {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let (user, tracker) = store
            .transaction(|tx| {
                let user = users::create_user(
                    tx,
                    &NewUser {
                        username: "alice".into(),
                        email: "alice@example.org".into(),
                        ..NewUser::default()
                    },
                )?;
                let tracker = trackers::create_tracker(
                    tx,
                    &NewTracker {
                        owner_id: user.id,
                        name: "bugs".into(),
                        description: None,
                        visibility: Visibility::Public,
                        default_access: Access::BROWSE,
                        default_user_perms: Access::BROWSE,
                    },
                )?;
                Ok((user.id, tracker))
            })
            .unwrap();
        (store, user, tracker)
    }

    #[test]
    fn test_event_names_parse_back() {
        for event in WebhookEvent::ALL {
            assert_eq!(WebhookEvent::parse(event.name()), Some(event));
            assert_eq!(WebhookEvent::parse_legacy(event.legacy_name()), Some(event));
        }
        assert!(WebhookEvent::parse("ticket:create").is_none());
    }

    #[test]
    fn test_validate_events_by_kind() {
        assert!(validate_events(WebhookKind::User, &["TICKET_CREATED".into()]).is_ok());
        assert!(validate_events(WebhookKind::LegacyUser, &["TICKET_CREATED".into()]).is_err());
        assert!(validate_events(WebhookKind::LegacyTracker, &["label:create".into()]).is_ok());
        assert!(validate_events(WebhookKind::Tracker, &[]).is_err());
    }

    #[test]
    fn test_dispatcher_requires_user() {
        let (store, _, _) = setup();
        let conn = store.connection();
        assert!(matches!(Dispatcher::new(&conn, None), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_schedule_fills_outbox_for_both_modes() {
        let (store, user, tracker_id) = setup();
        let conn = store.connection();
        let modern = webhooks::create_webhook(
            &conn,
            &NewWebhook {
                kind: WebhookKind::Tracker,
                user_id: user,
                tracker_id: Some(tracker_id),
                url: "https://hooks.example.org/modern",
                events: &["TRACKER_UPDATE".into()],
                query: Some("query { tracker { id } }"),
            },
        )
        .unwrap();
        let legacy = webhooks::create_webhook(
            &conn,
            &NewWebhook {
                kind: WebhookKind::LegacyUser,
                user_id: user,
                tracker_id: None,
                url: "https://hooks.example.org/legacy",
                events: &["tracker:update".into()],
                query: None,
            },
        )
        .unwrap();

        let tracker = trackers::tracker_by_id_unsafe(&conn, Some(user), tracker_id)
            .unwrap()
            .unwrap();
        let dispatcher = Dispatcher::new(&conn, Some(user)).unwrap();
        let n = dispatcher
            .schedule(WebhookEvent::TrackerUpdate, &Subject::Tracker(&tracker))
            .unwrap();
        assert_eq!(n, 2);
        let n = dispatcher
            .schedule(WebhookEvent::TrackerDeleted, &Subject::Tracker(&tracker))
            .unwrap();
        assert_eq!(n, 0);

        let rows =
            webhooks::list_deliveries(&conn, WebhookKind::Tracker, modern.id, &Cursor::default())
                .unwrap();
        assert_eq!(rows.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(body["event"], "TRACKER_UPDATE");
        assert_eq!(body["uuid"], rows[0].uuid.as_str());
        assert_eq!(body["subject"]["name"], "bugs");
        assert_eq!(rows[0].query.as_deref(), Some("query { tracker { id } }"));

        let rows = webhooks::list_deliveries(
            &conn,
            WebhookKind::LegacyUser,
            legacy.id,
            &Cursor::default(),
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event, "tracker:update");
        let body: serde_json::Value = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(body["owner"]["canonical_name"], "~alice");
    }
}
