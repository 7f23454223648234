//! Mutations.
//!
//! Each operation runs on the caller's transaction: authorization, the row
//! changes, event fan-out and webhook scheduling commit or roll back
//! together. Deliveries written here only become visible to the
//! [`DeliveryWorker`](crate::webhooks::DeliveryWorker) once the caller
//! commits, after which it should call [`DeliveryQueue::wake`](crate::webhooks::DeliveryQueue::wake).

pub mod labels;
pub mod subscriptions;
pub mod tickets;
pub mod trackers;
pub mod users;
pub mod webhooks;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::events::EventBuilder;
use crate::mentions::{MentionContext, scan};
use crate::participants::ParticipantResolver;
use crate::store::events::{NewEvent, get_event, insert_event};
use crate::store::participants::upsert_user_participant;
use crate::store::{tickets as ticket_store, trackers as tracker_store};
use crate::types::{Event, Participant, Ticket, Tracker, User};
use crate::webhooks::{Dispatcher, Subject, WebhookEvent};

/// The authenticated user performing a mutation.
#[derive(Clone, Copy)]
pub struct Actor<'a> {
    pub user: &'a User,
    /// This service's origin, for resolving ticket URLs in bodies.
    pub origin: &'a str,
    pub resolver: &'a ParticipantResolver,
}

impl<'a> Actor<'a> {
    pub fn new(user: &'a User, origin: &'a str, resolver: &'a ParticipantResolver) -> Self {
        Self {
            user,
            origin,
            resolver,
        }
    }

    pub(crate) fn participant(&self, conn: &Connection) -> Result<Participant> {
        upsert_user_participant(conn, self.user.id)
    }

    pub(crate) fn dispatcher<'c>(&self, conn: &'c Connection) -> Result<Dispatcher<'c>> {
        Dispatcher::new(conn, Some(self.user.id))
    }

    fn mention_context<'t>(&'t self, tracker: &'t Tracker) -> MentionContext<'t> {
        MentionContext {
            origin: self.origin,
            author: &self.user.username,
            tracker_owner: &tracker.owner_name,
            tracker: &tracker.name,
        }
    }
}

/// Loads a tracker the actor can see. Hidden and missing trackers are both
/// reported as not found.
pub(crate) fn visible_tracker(conn: &Connection, actor: &Actor<'_>, id: i64) -> Result<Tracker> {
    tracker_store::trackers_by_ids(conn, Some(actor.user.id), &[id])?
        .pop()
        .flatten()
        .ok_or(Error::NotFound)
}

/// Loads a tracker the actor owns.
pub(crate) fn owned_tracker(conn: &Connection, actor: &Actor<'_>, id: i64) -> Result<Tracker> {
    let tracker = visible_tracker(conn, actor, id)?;
    if tracker.owner_id != actor.user.id {
        return Err(Error::AccessDenied);
    }
    Ok(tracker)
}

/// Loads a ticket by scoped id along with its tracker.
pub(crate) fn visible_ticket(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
) -> Result<(Tracker, Ticket)> {
    let tracker = visible_tracker(conn, actor, tracker_id)?;
    let ticket =
        ticket_store::tickets_by_scoped_ids(conn, Some(actor.user.id), &[(tracker_id, scoped_id)])?
            .pop()
            .flatten()
            .ok_or(Error::NotFound)?;
    Ok((tracker, ticket))
}

/// Writes `event` through the fan-out phases and schedules its webhook.
///
/// When `mention_text` is given, users and tickets it mentions are
/// implicated as well.
pub(crate) fn publish_event(
    conn: &Connection,
    actor: &Actor<'_>,
    submitter: &Participant,
    tracker: &Tracker,
    ticket: &Ticket,
    event: &NewEvent,
    mention_text: Option<&str>,
) -> Result<Event> {
    let builder = EventBuilder::new(conn, submitter.id, event.event_type)?
        .with_ticket(tracker.id, ticket.id)?;
    let builder = match mention_text.filter(|text| !text.trim().is_empty()) {
        Some(text) => {
            let mentions = scan(text, &actor.mention_context(tracker));
            builder
                .add_mentions(actor.resolver, &mentions)?
                .insert_subscriptions()?
        }
        None => builder.insert_subscriptions()?,
    };

    let event_id = insert_event(conn, event)?;
    let fan_out = builder.insert_notifications(event_id, event.comment_id)?;
    tracing::debug!(
        event = event_id,
        ticket = ticket.id,
        notifications = fan_out.notifications,
        mentions = fan_out.mention_events.len(),
        ticket_mentions = fan_out.ticket_mention_events.len(),
        "published event"
    );

    let stored = get_event(conn, event_id)?
        .ok_or_else(|| Error::invariant(format!("event {event_id} vanished after insert")))?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::EventCreated, &Subject::Event(&stored, ticket))?;
    Ok(stored)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::participants::{NoFederation, ParticipantResolver};
    use crate::store::SqliteStore;
    use crate::store::users::{self, NewUser};
    use crate::types::User;

    pub const ORIGIN: &str = "https://todo.example.org";

    pub fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    pub fn resolver() -> ParticipantResolver {
        ParticipantResolver::new(Arc::new(NoFederation))
    }

    pub fn user(store: &SqliteStore, username: &str) -> User {
        users::create_user(
            &store.connection(),
            &NewUser {
                username: username.into(),
                email: format!("{username}@example.org"),
                ..NewUser::default()
            },
        )
        .unwrap()
    }

    pub fn count(store: &SqliteStore, sql: &str) -> i64 {
        store.connection().query_row(sql, [], |row| row.get(0)).unwrap()
    }
}
