use rusqlite::Connection;

use super::{Actor, visible_ticket, visible_tracker};
use crate::error::{Error, Result};
use crate::store::events as store;
use crate::types::{Cursor, EventNotification, Page, Subscription, SubscriptionTarget, paginate};

pub fn subscribe_tracker(conn: &Connection, actor: &Actor<'_>, tracker_id: i64) -> Result<Subscription> {
    let tracker = visible_tracker(conn, actor, tracker_id)?;
    let participant = actor.participant(conn)?;
    store::subscribe(conn, participant.id, SubscriptionTarget::Tracker(tracker.id))
}

pub fn subscribe_ticket(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
) -> Result<Subscription> {
    let (_, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    let participant = actor.participant(conn)?;
    store::subscribe(conn, participant.id, SubscriptionTarget::Ticket(ticket.id))
}

/// Removes the actor's subscription. Fails with not found when there was none.
pub fn unsubscribe(conn: &Connection, actor: &Actor<'_>, target: SubscriptionTarget) -> Result<()> {
    let participant = actor.participant(conn)?;
    if !store::unsubscribe(conn, participant.id, target)? {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn unsubscribe_ticket(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
) -> Result<()> {
    let (_, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    unsubscribe(conn, actor, SubscriptionTarget::Ticket(ticket.id))
}

pub fn list_subscriptions(
    conn: &Connection,
    actor: &Actor<'_>,
    cursor: &Cursor,
) -> Result<Page<Subscription>> {
    let participant = actor.participant(conn)?;
    let rows = store::list_subscriptions(conn, participant.id, cursor)?;
    Ok(paginate(rows, cursor, |s| s.id))
}

/// The actor's notification inbox, newest first.
pub fn inbox(conn: &Connection, actor: &Actor<'_>, cursor: &Cursor) -> Result<Page<EventNotification>> {
    let rows = store::list_notifications(conn, actor.user.id, cursor)?;
    Ok(paginate(rows, cursor, |n| n.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{ORIGIN, resolver, store, user};
    use crate::ops::tickets::{CommentInput, TicketInput, comment, submit_ticket};
    use crate::ops::trackers::{TrackerInput, create_tracker};
    use crate::types::Visibility;

    #[test]
    fn test_tracker_subscriber_reaches_inbox() {
        let store = store();
        let owner = user(&store, "u1");
        let watcher = user(&store, "u2");
        let resolver = resolver();
        let u1 = Actor::new(&owner, ORIGIN, &resolver);
        let u2 = Actor::new(&watcher, ORIGIN, &resolver);

        let tracker = store
            .transaction(|tx| {
                create_tracker(
                    tx,
                    &u1,
                    &TrackerInput {
                        name: "projA".into(),
                        description: None,
                        visibility: Visibility::Public,
                    },
                )
            })
            .unwrap();
        store
            .transaction(|tx| subscribe_tracker(tx, &u2, tracker.id))
            .unwrap();
        // Subscribing twice is a no-op.
        store
            .transaction(|tx| subscribe_tracker(tx, &u2, tracker.id))
            .unwrap();

        let ticket = store
            .transaction(|tx| {
                submit_ticket(
                    tx,
                    &u1,
                    tracker.id,
                    &TicketInput {
                        subject: "crash".into(),
                        body: None,
                    },
                )
            })
            .unwrap();
        store
            .transaction(|tx| {
                comment(
                    tx,
                    &u1,
                    tracker.id,
                    ticket.scoped_id,
                    &CommentInput {
                        text: "more detail".into(),
                        ..CommentInput::default()
                    },
                )
            })
            .unwrap();

        let cursor = Cursor::with_count(1);
        let page = store.transaction(|tx| inbox(tx, &u2, &cursor)).unwrap();
        assert_eq!(page.results.len(), 1);
        assert!(page.cursor.is_some());
        let all = store
            .transaction(|tx| inbox(tx, &u2, &Cursor::default()))
            .unwrap();
        assert_eq!(all.results.len(), 2);

        store
            .transaction(|tx| unsubscribe(tx, &u2, SubscriptionTarget::Tracker(tracker.id)))
            .unwrap();
        assert!(matches!(
            store.transaction(|tx| unsubscribe(tx, &u2, SubscriptionTarget::Tracker(tracker.id))),
            Err(Error::NotFound)
        ));
        let subs = store
            .transaction(|tx| list_subscriptions(tx, &u2, &Cursor::default()))
            .unwrap();
        assert!(subs.results.is_empty());
    }
}
