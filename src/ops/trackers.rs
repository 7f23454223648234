use rusqlite::Connection;
use serde::Deserialize;

use super::{Actor, owned_tracker};
use crate::error::{Error, Result};
use crate::store::events::subscribe;
use crate::store::trackers::{self as store, NewTracker};
use crate::store::users;
use crate::types::{Access, SubscriptionTarget, Tracker, TrackerAcl, Visibility};
use crate::validation::validate_tracker_name;
use crate::webhooks::{Subject, WebhookEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
}

/// Fields of a tracker update. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub default_access: Option<Access>,
    #[serde(default)]
    pub default_user_perms: Option<Access>,
}

fn default_access() -> Access {
    Access::BROWSE.union(Access::SUBMIT).union(Access::COMMENT)
}

fn check_mask(mask: Access) -> Result<Access> {
    Access::from_bits(mask.bits())
        .ok_or_else(|| Error::Invalid(format!("invalid access mask {}", mask.bits())))
}

fn reload(conn: &Connection, actor: &Actor<'_>, id: i64) -> Result<Tracker> {
    store::tracker_by_id_unsafe(conn, Some(actor.user.id), id)?
        .ok_or_else(|| Error::invariant(format!("tracker {id} vanished")))
}

/// Creates a tracker owned by the actor and subscribes them to it.
pub fn create_tracker(conn: &Connection, actor: &Actor<'_>, input: &TrackerInput) -> Result<Tracker> {
    validate_tracker_name(&input.name)?;
    let id = store::create_tracker(
        conn,
        &NewTracker {
            owner_id: actor.user.id,
            name: input.name.clone(),
            description: input.description.clone().filter(|d| !d.is_empty()),
            visibility: input.visibility,
            default_access: default_access(),
            default_user_perms: default_access(),
        },
    )?;

    let owner = actor.participant(conn)?;
    subscribe(conn, owner.id, SubscriptionTarget::Tracker(id))?;

    let tracker = reload(conn, actor, id)?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::TrackerCreated, &Subject::Tracker(&tracker))?;
    tracing::info!(tracker = id, name = %tracker.canonical_name(), "created tracker");
    Ok(tracker)
}

pub fn update_tracker(
    conn: &Connection,
    actor: &Actor<'_>,
    id: i64,
    update: &TrackerUpdate,
) -> Result<Tracker> {
    let tracker = owned_tracker(conn, actor, id)?;
    let description = match &update.description {
        Some(d) if d.is_empty() => None,
        Some(d) => Some(d.as_str()),
        None => tracker.description.as_deref(),
    };
    store::update_tracker(
        conn,
        id,
        description,
        update.visibility.unwrap_or(tracker.visibility),
        check_mask(update.default_access.unwrap_or(tracker.default_access))?,
        check_mask(update.default_user_perms.unwrap_or(tracker.default_user_perms))?,
    )?;

    let tracker = reload(conn, actor, id)?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::TrackerUpdate, &Subject::Tracker(&tracker))?;
    Ok(tracker)
}

/// Deletes a tracker with its tickets. Scheduled before the delete so the
/// payload still describes the tracker.
pub fn delete_tracker(conn: &Connection, actor: &Actor<'_>, id: i64) -> Result<Tracker> {
    let tracker = owned_tracker(conn, actor, id)?;
    if tracker.import_in_progress {
        return Err(Error::Conflict("an import is in progress for this tracker".into()));
    }
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::TrackerDeleted, &Subject::Tracker(&tracker))?;
    store::delete_tracker(conn, id)?;
    tracing::info!(tracker = id, name = %tracker.canonical_name(), "deleted tracker");
    Ok(tracker)
}

/// Grants `username` an explicit access mask on the tracker.
pub fn set_acl(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    username: &str,
    permissions: Access,
) -> Result<TrackerAcl> {
    let permissions = check_mask(permissions)?;
    let tracker = owned_tracker(conn, actor, tracker_id)?;
    let user = match users::get_user_by_username(conn, username)? {
        Some(user) => user,
        None => {
            // Pulls the user in from the identity service if needed.
            actor
                .resolver
                .by_username(conn, username)?
                .ok_or(Error::NotFound)?;
            users::get_user_by_username(conn, username)?.ok_or(Error::NotFound)?
        }
    };
    if user.id == tracker.owner_id {
        return Err(Error::Invalid("the owner's access cannot be changed".into()));
    }
    store::upsert_acl(conn, tracker.id, user.id, permissions)
}

pub fn delete_acl(conn: &Connection, actor: &Actor<'_>, tracker_id: i64, user_id: i64) -> Result<()> {
    let tracker = owned_tracker(conn, actor, tracker_id)?;
    if !store::delete_acl(conn, tracker.id, user_id)? {
        return Err(Error::NotFound);
    }
    Ok(())
}

/// Claims the tracker for an import. Only empty trackers can be imported
/// into; the import job clears the flag when it finishes.
pub fn begin_import(conn: &Connection, actor: &Actor<'_>, tracker_id: i64) -> Result<Tracker> {
    let tracker = owned_tracker(conn, actor, tracker_id)?;
    if tracker.next_ticket_id != 1 {
        return Err(Error::Conflict("tracker is not empty".into()));
    }
    store::mark_import_started(conn, tracker.id)?;
    reload(conn, actor, tracker.id)
}
