//! Event fan-out.
//!
//! [`EventBuilder`] walks a mutation through its phases inside the caller's
//! transaction. The implicated participants are collected in a temporary
//! table so subscribers, the submitter and mentioned users can be unioned
//! and materialized with set-based SQL:
//!
//! ```text
//! EventBuilder::new -> with_ticket -> [add_mentions] -> insert_subscriptions
//!     -> (caller inserts the primary event) -> insert_notifications
//! ```
//!
//! Each phase consumes the builder and returns the next state, so the phases
//! cannot be reordered. Rows already subscribed are marked `subscribe = 0`;
//! the submitter and mentioned users are marked `subscribe = 1`.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::mentions::Mentions;
use crate::participants::ParticipantResolver;
use crate::store::events::{NewEvent, insert_event};
use crate::store::now;
use crate::types::{EventType, TicketRef};

/// Builder states.
pub mod state {
    pub struct Seeded;
    pub struct WithTicket;
    pub struct WithMentions;
    pub struct Subscribed;
}

/// States from which subscriptions may be materialized.
pub trait Implicated {}
impl Implicated for state::WithTicket {}
impl Implicated for state::WithMentions {}

pub struct EventBuilder<'c, S> {
    conn: &'c Connection,
    submitter: i64,
    event_type: EventType,
    ticket_id: Option<i64>,
    mentioned: Vec<i64>,
    foreign_tickets: BTreeSet<TicketRef>,
    _state: PhantomData<S>,
}

/// Rows written by the final phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub notifications: usize,
    pub mention_events: Vec<i64>,
    pub ticket_mention_events: Vec<i64>,
}

impl<'c, S> EventBuilder<'c, S> {
    fn into_state<T>(self) -> EventBuilder<'c, T> {
        EventBuilder {
            conn: self.conn,
            submitter: self.submitter,
            event_type: self.event_type,
            ticket_id: self.ticket_id,
            mentioned: self.mentioned,
            foreign_tickets: self.foreign_tickets,
            _state: PhantomData,
        }
    }

    fn implicate(&self, participant_id: i64, event_type: EventType, subscribe: bool) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO temp.event_participant (participant_id, event_type, subscribe)
             VALUES (?1, ?2, ?3)",
            params![participant_id, event_type, subscribe],
        )?;
        Ok(())
    }
}

impl<'c> EventBuilder<'c, state::Seeded> {
    /// Creates the implicated set and seeds it with the submitter.
    pub fn new(conn: &'c Connection, submitter: i64, event_type: EventType) -> Result<Self> {
        conn.execute_batch(
            "DROP TABLE IF EXISTS temp.event_participant;
             CREATE TEMP TABLE event_participant (
                 participant_id INTEGER NOT NULL,
                 event_type INTEGER NOT NULL,
                 subscribe INTEGER NOT NULL,
                 PRIMARY KEY (participant_id, event_type)
             );",
        )?;
        let builder = Self {
            conn,
            submitter,
            event_type,
            ticket_id: None,
            mentioned: Vec::new(),
            foreign_tickets: BTreeSet::new(),
            _state: PhantomData,
        };
        builder.implicate(submitter, event_type, true)?;
        Ok(builder)
    }

    /// Adds everyone subscribed to the ticket or its tracker.
    pub fn with_ticket(
        mut self,
        tracker_id: i64,
        ticket_id: i64,
    ) -> Result<EventBuilder<'c, state::WithTicket>> {
        self.conn.execute(
            "INSERT OR IGNORE INTO temp.event_participant (participant_id, event_type, subscribe)
             SELECT DISTINCT participant_id, ?1, 0 FROM ticket_subscription
             WHERE ticket_id = ?2 OR tracker_id = ?3",
            params![self.event_type, ticket_id, tracker_id],
        )?;
        self.ticket_id = Some(ticket_id);
        Ok(self.into_state())
    }
}

impl<'c> EventBuilder<'c, state::WithTicket> {
    /// Resolves mentioned usernames and records mentioned tickets.
    ///
    /// Unknown usernames are dropped.
    pub fn add_mentions(
        mut self,
        resolver: &ParticipantResolver,
        mentions: &Mentions,
    ) -> Result<EventBuilder<'c, state::WithMentions>> {
        if !mentions.users.is_empty() {
            let usernames: Vec<String> = mentions.users.iter().cloned().collect();
            let resolved = resolver.by_usernames(self.conn, &usernames)?;
            for (name, participant) in usernames.iter().zip(resolved) {
                let Some(participant) = participant else {
                    tracing::debug!(username = %name, "dropping mention of unknown user");
                    continue;
                };
                self.implicate(participant.id, EventType::USER_MENTIONED, true)?;
                self.mentioned.push(participant.id);
            }
        }
        self.foreign_tickets = mentions.tickets.clone();
        Ok(self.into_state())
    }
}

impl<'c, S: Implicated> EventBuilder<'c, S> {
    /// Subscribes every implicated participant marked for subscription.
    /// Running this twice leaves the same rows.
    pub fn insert_subscriptions(self) -> Result<EventBuilder<'c, state::Subscribed>> {
        let Some(ticket_id) = self.ticket_id else {
            return Err(Error::invariant("event builder has no ticket"));
        };
        self.conn.execute(
            "INSERT INTO ticket_subscription (created, participant_id, ticket_id)
             SELECT DISTINCT ?1, participant_id, ?2 FROM temp.event_participant
             WHERE subscribe = 1
             ON CONFLICT DO NOTHING",
            params![now(), ticket_id],
        )?;
        Ok(self.into_state())
    }
}

impl EventBuilder<'_, state::Subscribed> {
    /// Notifies implicated users of the primary event, then writes the
    /// mention side-events and drops the implicated set.
    pub fn insert_notifications(self, event_id: i64, comment_id: Option<i64>) -> Result<FanOut> {
        let Some(ticket_id) = self.ticket_id else {
            return Err(Error::invariant("event builder has no ticket"));
        };
        let created = now();
        let mut fan_out = FanOut {
            notifications: self.conn.execute(
                "INSERT INTO event_notification (created, event_id, user_id)
                 SELECT DISTINCT ?1, ?2, p.user_id
                 FROM temp.event_participant ep JOIN participant p ON p.id = ep.participant_id
                 WHERE p.participant_type = 'user' AND (ep.event_type & ?3) != 0
                 ON CONFLICT DO NOTHING",
                params![created, event_id, self.event_type],
            )?,
            ..FanOut::default()
        };

        for participant_id in &self.mentioned {
            let mention_id = insert_event(
                self.conn,
                &NewEvent {
                    event_type: EventType::USER_MENTIONED,
                    ticket_id,
                    participant_id: Some(*participant_id),
                    by_participant_id: Some(self.submitter),
                    from_ticket_id: Some(ticket_id),
                    comment_id,
                    ..NewEvent::default()
                },
            )?;
            fan_out.notifications += self.conn.execute(
                "INSERT INTO event_notification (created, event_id, user_id)
                 SELECT ?1, ?2, p.user_id FROM participant p
                 WHERE p.id = ?3 AND p.participant_type = 'user'
                 ON CONFLICT DO NOTHING",
                params![created, mention_id, participant_id],
            )?;
            fan_out.mention_events.push(mention_id);
        }

        for target in &self.foreign_tickets {
            let inserted = self.conn.execute(
                r#"WITH target AS (
                       SELECT tk.id FROM ticket tk
                       JOIN tracker t ON t.id = tk.tracker_id
                       JOIN "user" o ON o.id = t.owner_id
                       WHERE o.username = ?1 AND t.name = ?2 AND tk.scoped_id = ?3
                   )
                   INSERT INTO event (created, event_type, ticket_id, participant_id,
                       by_participant_id, from_ticket_id, comment_id)
                   SELECT ?4, ?5, target.id, ?6, ?6, ?7, ?8 FROM target
                   WHERE target.id != ?7"#,
                params![
                    target.owner,
                    target.tracker,
                    target.scoped_id,
                    created,
                    EventType::TICKET_MENTIONED,
                    self.submitter,
                    ticket_id,
                    comment_id,
                ],
            )?;
            if inserted == 0 {
                tracing::debug!(reference = %target, "dropping mention of unknown ticket");
            } else {
                fan_out
                    .ticket_mention_events
                    .push(self.conn.last_insert_rowid());
            }
        }

        self.conn
            .execute_batch("DROP TABLE IF EXISTS temp.event_participant")?;
        Ok(fan_out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mentions::{MentionContext, scan};
    use crate::participants::NoFederation;
    use crate::store::SqliteStore;
    use crate::store::events::subscribe;
    use crate::types::SubscriptionTarget;

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
            .connection()
            .execute_batch(
                r#"
                INSERT INTO "user" (id, created, updated, username, email) VALUES
                    (1, 'x', 'x', 'u1', 'u1@example.org'),
                    (2, 'x', 'x', 'u2', 'u2@example.org'),
                    (3, 'x', 'x', 'u3', 'u3@example.org');
                INSERT INTO tracker (id, owner_id, created, updated, name, next_ticket_id) VALUES
                    (1, 1, 'x', 'x', 'projA', 2),
                    (2, 3, 'x', 'x', 'projB', 8);
                INSERT INTO participant (id, created, participant_type, user_id) VALUES
                    (1, 'x', 'user', 1),
                    (3, 'x', 'user', 3);
                INSERT INTO participant (id, created, participant_type, email) VALUES
                    (4, 'x', 'email', 'watcher@example.org');
                INSERT INTO ticket (id, created, updated, tracker_id, scoped_id, submitter_id, subject) VALUES
                    (1, 'x', 'x', 1, 1, 1, 'a'),
                    (7, 'x', 'x', 2, 7, 3, 'b');
                "#,
            )
            .unwrap();
        store
    }

    fn resolver() -> ParticipantResolver {
        ParticipantResolver::new(Arc::new(NoFederation))
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn ctx() -> MentionContext<'static> {
        MentionContext {
            origin: "https://todo.example.org",
            author: "u1",
            tracker_owner: "u1",
            tracker: "projA",
        }
    }

    #[test]
    fn test_comment_with_mentions_fans_out() {
        let store = seeded();
        let mut conn = store.connection();
        let tx = conn.transaction().unwrap();
        subscribe(&tx, 4, SubscriptionTarget::Tracker(1)).unwrap();

        let mentions = scan("hi ~u2 and ~nobody, see ~u3/projB#7", &ctx());
        let builder = EventBuilder::new(&tx, 1, EventType::COMMENT)
            .unwrap()
            .with_ticket(1, 1)
            .unwrap()
            .add_mentions(&resolver(), &mentions)
            .unwrap()
            .insert_subscriptions()
            .unwrap();
        let event_id = insert_event(&tx, &NewEvent::new(EventType::COMMENT, 1, 1)).unwrap();
        let fan_out = builder.insert_notifications(event_id, None).unwrap();
        tx.commit().unwrap();

        assert_eq!(fan_out.mention_events.len(), 1);
        assert_eq!(fan_out.ticket_mention_events.len(), 1);
        // u1 on the primary event and u2 on the mention; the email watcher gets none.
        assert_eq!(fan_out.notifications, 2);

        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM ticket_subscription WHERE ticket_id = 1"),
            2
        );
        assert_eq!(
            count(
                &conn,
                "SELECT COUNT(*) FROM event WHERE ticket_id = 7 AND event_type = 256 AND from_ticket_id = 1"
            ),
            1
        );
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM ticket_subscription WHERE ticket_id = 7"),
            0
        );
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'event_participant'"),
            0
        );
    }

    #[test]
    fn test_existing_subscriber_is_notified_not_resubscribed() {
        let store = seeded();
        let mut conn = store.connection();
        let tx = conn.transaction().unwrap();
        subscribe(&tx, 3, SubscriptionTarget::Ticket(1)).unwrap();

        let builder = EventBuilder::new(&tx, 1, EventType::CREATED | EventType::COMMENT)
            .unwrap()
            .with_ticket(1, 1)
            .unwrap()
            .insert_subscriptions()
            .unwrap();
        let event_id = insert_event(
            &tx,
            &NewEvent::new(EventType::CREATED | EventType::COMMENT, 1, 1),
        )
        .unwrap();
        let fan_out = builder.insert_notifications(event_id, None).unwrap();
        tx.commit().unwrap();

        assert_eq!(fan_out.notifications, 2);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM ticket_subscription WHERE ticket_id = 1"),
            2
        );
    }

    #[test]
    fn test_self_mention_notifies_twice() {
        let store = seeded();
        let mut conn = store.connection();
        let tx = conn.transaction().unwrap();
        let mentions = scan("note to self ~u1", &ctx());
        let builder = EventBuilder::new(&tx, 1, EventType::COMMENT)
            .unwrap()
            .with_ticket(1, 1)
            .unwrap()
            .add_mentions(&resolver(), &mentions)
            .unwrap()
            .insert_subscriptions()
            .unwrap();
        let event_id = insert_event(&tx, &NewEvent::new(EventType::COMMENT, 1, 1)).unwrap();
        let fan_out = builder.insert_notifications(event_id, None).unwrap();
        tx.commit().unwrap();

        assert_eq!(fan_out.notifications, 2);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM event_notification WHERE user_id = 1"),
            2
        );
    }

    #[test]
    fn test_mention_of_missing_ticket_writes_nothing() {
        let store = seeded();
        let mut conn = store.connection();
        let tx = conn.transaction().unwrap();
        let mentions = scan("see ~u3/projB#99 and ~ghost/nope#1", &ctx());
        let builder = EventBuilder::new(&tx, 1, EventType::COMMENT)
            .unwrap()
            .with_ticket(1, 1)
            .unwrap()
            .add_mentions(&resolver(), &mentions)
            .unwrap()
            .insert_subscriptions()
            .unwrap();
        let event_id = insert_event(&tx, &NewEvent::new(EventType::COMMENT, 1, 1)).unwrap();
        let fan_out = builder.insert_notifications(event_id, None).unwrap();
        tx.commit().unwrap();

        assert!(fan_out.ticket_mention_events.is_empty());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM event WHERE event_type = 256"), 0);
    }

    #[test]
    fn test_rollback_discards_everything() {
        let store = seeded();
        let mut conn = store.connection();
        {
            let tx = conn.transaction().unwrap();
            let builder = EventBuilder::new(&tx, 1, EventType::COMMENT)
                .unwrap()
                .with_ticket(1, 1)
                .unwrap()
                .insert_subscriptions()
                .unwrap();
            let event_id = insert_event(&tx, &NewEvent::new(EventType::COMMENT, 1, 1)).unwrap();
            builder.insert_notifications(event_id, None).unwrap();
            // Dropped without commit.
        }
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM event"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM event_notification"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM ticket_subscription"), 0);
    }
}
