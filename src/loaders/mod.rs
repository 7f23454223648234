//! Per-request batched, permission-aware loaders.
//!
//! A fresh [`Loaders`] is built for every request and bound to its viewer.
//! Every access-checked loader filters rows in SQL with the viewer's
//! effective access, so records the viewer may not see come back as `None`
//! exactly like records that do not exist.

mod batch;

pub use batch::{BatchFn, Loader};

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::participants::ParticipantResolver;
use crate::store::{SqliteStore, events, participants, tickets, trackers, users};
use crate::types::{Comment, Event, Label, Participant, Ticket, Tracker, User};

#[derive(Clone)]
pub struct Loaders {
    pub viewer: Option<i64>,

    pub users_by_id: Loader<i64, User>,
    pub users_by_name: Loader<String, User>,

    pub trackers_by_id: Loader<i64, Tracker>,
    pub trackers_by_owner_name: Loader<(String, String), Tracker>,
    /// Skips the visibility filter. Only for trackers already authorized
    /// through another record, e.g. the tracker of a visible ticket.
    pub trackers_by_id_unsafe: Loader<i64, Tracker>,

    pub tickets_by_id: Loader<i64, Ticket>,
    pub tickets_by_scoped_id: Loader<(i64, i64), Ticket>,

    pub labels_by_id: Loader<i64, Label>,
    pub comments_by_id: Loader<i64, Comment>,
    pub events_by_id: Loader<i64, Event>,

    pub participants_by_id: Loader<i64, Participant>,
    pub participants_by_user_id: Loader<i64, Participant>,
    /// Federates usernames the local store does not know yet.
    pub participants_by_username: Loader<String, Participant>,
}

/// Wraps a connection-level batch query as a [`BatchFn`].
macro_rules! fetch {
    (|$conn:ident, $keys:ident| $body:expr) => {
        Arc::new(move |store: &SqliteStore, $keys: &[_]| {
            let $conn = store.connection();
            $body
        })
    };
}

impl Loaders {
    pub fn new(
        store: Arc<SqliteStore>,
        config: &ServerConfig,
        resolver: ParticipantResolver,
        viewer: Option<i64>,
    ) -> Self {
        let wait = config.loader_wait();
        let max = config.loader_max_batch;
        let loader = |name| LoaderFactory {
            name,
            store: Arc::clone(&store),
            wait,
            max,
        };

        let by_username = resolver.clone();
        Self {
            viewer,
            users_by_id: loader("users_by_id")
                .build(fetch!(|conn, keys| users::users_by_ids(&conn, keys))),
            users_by_name: loader("users_by_name")
                .build(fetch!(|conn, keys| users::users_by_usernames(&conn, keys))),
            trackers_by_id: loader("trackers_by_id")
                .build(fetch!(|conn, keys| trackers::trackers_by_ids(&conn, viewer, keys))),
            trackers_by_owner_name: loader("trackers_by_owner_name").build(fetch!(|conn, keys| {
                trackers::trackers_by_owner_names(&conn, viewer, keys)
            })),
            trackers_by_id_unsafe: loader("trackers_by_id_unsafe").build(fetch!(|conn, keys| {
                trackers::trackers_by_ids_unsafe(&conn, viewer, keys)
            })),
            tickets_by_id: loader("tickets_by_id")
                .build(fetch!(|conn, keys| tickets::tickets_by_ids(&conn, viewer, keys))),
            tickets_by_scoped_id: loader("tickets_by_scoped_id").build(fetch!(|conn, keys| {
                tickets::tickets_by_scoped_ids(&conn, viewer, keys)
            })),
            labels_by_id: loader("labels_by_id")
                .build(fetch!(|conn, keys| trackers::labels_by_ids(&conn, viewer, keys))),
            comments_by_id: loader("comments_by_id")
                .build(fetch!(|conn, keys| tickets::comments_by_ids(&conn, viewer, keys))),
            events_by_id: loader("events_by_id")
                .build(fetch!(|conn, keys| events::events_by_ids(&conn, viewer, keys))),
            participants_by_id: loader("participants_by_id")
                .build(fetch!(|conn, keys| participants::participants_by_ids(&conn, keys))),
            participants_by_user_id: loader("participants_by_user_id")
                .build(fetch!(|conn, keys| resolver.by_user_ids(&conn, keys))),
            participants_by_username: loader("participants_by_username")
                .build(fetch!(|conn, keys| by_username.by_usernames(&conn, keys))),
        }
    }

    /// Loads a ticket together with its tracker. The tracker is fetched
    /// without a visibility check since the ticket already passed one.
    pub async fn ticket_with_tracker(
        &self,
        ticket_id: i64,
    ) -> crate::error::Result<Option<(Ticket, Tracker)>> {
        let Some(ticket) = self.tickets_by_id.load(ticket_id).await? else {
            return Ok(None);
        };
        let tracker = self.trackers_by_id_unsafe.load(ticket.tracker_id).await?;
        Ok(tracker.map(|tracker| (ticket, tracker)))
    }
}

struct LoaderFactory {
    name: &'static str,
    store: Arc<SqliteStore>,
    wait: std::time::Duration,
    max: usize,
}

impl LoaderFactory {
    fn build<K, V>(self, fetch: BatchFn<K, V>) -> Loader<K, V>
    where
        K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + 'static,
    {
        Loader::new(self.name, self.store, self.wait, self.max, fetch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participants::NoFederation;
    use crate::store::tickets::NewTicket;
    use crate::store::trackers::NewTracker;
    use crate::store::users::NewUser;
    use crate::types::{Access, Visibility};

    struct Fixture {
        store: Arc<SqliteStore>,
        owner: i64,
        stranger: i64,
        public: i64,
        private: i64,
    }

    fn fixture() -> Fixture {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let (owner, stranger, public, private) = store
            .transaction(|tx| {
                let owner = users::create_user(
                    tx,
                    &NewUser {
                        username: "owner".into(),
                        email: "owner@example.org".into(),
                        ..NewUser::default()
                    },
                )?;
                let stranger = users::create_user(
                    tx,
                    &NewUser {
                        username: "stranger".into(),
                        email: "stranger@example.org".into(),
                        ..NewUser::default()
                    },
                )?;
                let mut public = NewTracker {
                    owner_id: owner.id,
                    name: "public".into(),
                    description: None,
                    visibility: Visibility::Public,
                    default_access: Access::BROWSE,
                    default_user_perms: Access::BROWSE.union(Access::SUBMIT).union(Access::COMMENT),
                };
                let public_id = trackers::create_tracker(tx, &public)?;
                public.name = "private".into();
                public.visibility = Visibility::Private;
                let private_id = trackers::create_tracker(tx, &public)?;
                Ok((owner.id, stranger.id, public_id, private_id))
            })
            .unwrap();
        Fixture {
            store: Arc::new(store),
            owner,
            stranger,
            public,
            private,
        }
    }

    fn loaders(fixture: &Fixture, viewer: Option<i64>) -> Loaders {
        Loaders::new(
            Arc::clone(&fixture.store),
            &ServerConfig::default(),
            ParticipantResolver::new(Arc::new(NoFederation)),
            viewer,
        )
    }

    #[tokio::test]
    async fn test_private_tracker_hidden_from_stranger() {
        let f = fixture();
        let owner = loaders(&f, Some(f.owner));
        let stranger = loaders(&f, Some(f.stranger));

        let seen = owner.trackers_by_id.load_many(&[f.public, f.private]).await.unwrap();
        assert!(seen.iter().all(Option::is_some));
        assert_eq!(seen[1].as_ref().unwrap().access, Access::ALL);

        let seen = stranger.trackers_by_id.load_many(&[f.public, f.private]).await.unwrap();
        assert!(seen[0].is_some());
        assert!(seen[1].is_none());

        let unsafe_load = stranger.trackers_by_id_unsafe.load(f.private).await.unwrap();
        assert!(unsafe_load.is_some());
    }

    #[tokio::test]
    async fn test_tracker_by_owner_and_name() {
        let f = fixture();
        let anon = loaders(&f, None);
        let found = anon
            .trackers_by_owner_name
            .load_many(&[
                ("owner".to_string(), "public".to_string()),
                ("owner".to_string(), "private".to_string()),
                ("owner".to_string(), "missing".to_string()),
            ])
            .await
            .unwrap();
        assert_eq!(found[0].as_ref().map(|t| t.id), Some(f.public));
        assert!(found[1].is_none());
        assert!(found[2].is_none());
    }

    #[tokio::test]
    async fn test_two_hundred_tickets_load_in_two_batches() {
        let f = fixture();
        f.store
            .transaction(|tx| {
                let submitter = participants::upsert_user_participant(tx, f.owner)?;
                for _ in 0..200 {
                    let scoped = trackers::allocate_ticket_id(tx, f.public)?;
                    tickets::insert_ticket(tx, &NewTicket::new(f.public, scoped, submitter.id, "t"))?;
                }
                Ok(())
            })
            .unwrap();

        let loaders = loaders(&f, Some(f.stranger));
        let keys: Vec<(i64, i64)> = (1..=200).map(|n| (f.public, n)).collect();
        let found = loaders.tickets_by_scoped_id.load_many(&keys).await.unwrap();
        assert!(found.iter().all(Option::is_some));
        assert_eq!(found[41].as_ref().unwrap().scoped_id, 42);
    }

    #[tokio::test]
    async fn test_participant_by_user_id_creates_once() {
        let f = fixture();
        let first = loaders(&f, None)
            .participants_by_user_id
            .load(f.owner)
            .await
            .unwrap()
            .unwrap();
        let second = loaders(&f, None)
            .participants_by_user_id
            .load(f.owner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.user_id(), Some(f.owner));
    }

    #[tokio::test]
    async fn test_child_records_follow_tracker_visibility() {
        let f = fixture();
        let (ticket, label, comment, event) = f
            .store
            .transaction(|tx| {
                let submitter = participants::upsert_user_participant(tx, f.owner)?;
                let scoped = trackers::allocate_ticket_id(tx, f.private)?;
                let ticket = tickets::insert_ticket(tx, &NewTicket::new(f.private, scoped, submitter.id, "t"))?;
                let label = trackers::create_label(tx, f.private, "bug", "#ff0000", "#ffffff")?;
                let comment = tickets::insert_comment(
                    tx,
                    &tickets::NewComment {
                        ticket_id: ticket,
                        submitter_id: submitter.id,
                        text: "hidden",
                        authenticity: crate::types::Authenticity::Authentic,
                        created: None,
                    },
                )?;
                let event = events::insert_event(
                    tx,
                    &events::NewEvent::new(crate::types::EventType::CREATED, ticket, submitter.id),
                )?;
                Ok((ticket, label.id, comment.id, event))
            })
            .unwrap();

        let owner = loaders(&f, Some(f.owner));
        let (loaded, tracker) = owner.ticket_with_tracker(ticket).await.unwrap().unwrap();
        assert_eq!(loaded.tracker_id, tracker.id);
        assert!(owner.labels_by_id.load(label).await.unwrap().is_some());
        assert!(owner.comments_by_id.load(comment).await.unwrap().is_some());
        assert!(owner.events_by_id.load(event).await.unwrap().is_some());

        let stranger = loaders(&f, Some(f.stranger));
        assert!(stranger.ticket_with_tracker(ticket).await.unwrap().is_none());
        assert!(stranger.tickets_by_id.load(ticket).await.unwrap().is_none());
        assert!(stranger.labels_by_id.load(label).await.unwrap().is_none());
        assert!(stranger.comments_by_id.load(comment).await.unwrap().is_none());
        assert!(stranger.events_by_id.load(event).await.unwrap().is_none());

        let anon = loaders(&f, None);
        assert!(anon.comments_by_id.load(comment).await.unwrap().is_none());
        assert!(anon.events_by_id.load(event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_and_participant_lookups() {
        let f = fixture();
        let anon = loaders(&f, None);
        let by_id = anon.users_by_id.load(f.owner).await.unwrap().unwrap();
        assert_eq!(by_id.username, "owner");
        let by_name = anon
            .users_by_name
            .load_many(&["stranger".to_string(), "nobody".to_string()])
            .await
            .unwrap();
        assert_eq!(by_name[0].as_ref().map(|u| u.id), Some(f.stranger));
        assert!(by_name[1].is_none());

        let participant = anon
            .participants_by_username
            .load("owner".to_string())
            .await
            .unwrap()
            .unwrap();
        let again = anon.participants_by_id.load(participant.id).await.unwrap().unwrap();
        assert_eq!(again.user_id(), Some(f.owner));
        assert!(anon
            .participants_by_username
            .load("nobody".to_string())
            .await
            .unwrap()
            .is_none());
    }
}
