use rusqlite::Connection;
use serde::Deserialize;

use super::{Actor, publish_event, visible_ticket, visible_tracker};
use crate::error::{Error, Result};
use crate::store::events::{NewEvent, subscribe};
use crate::store::tickets::{self as store, NewComment, NewTicket};
use crate::store::trackers::{allocate_ticket_id, labels_by_ids};
use crate::types::{
    Authenticity, Comment, Event, EventType, Participant, SubscriptionTarget, Ticket,
    TicketResolution, TicketStatus, Tracker,
};
use crate::validation::validate_subject;
use crate::webhooks::{Subject, WebhookEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct TicketInput {
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TicketUpdate {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentInput {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default)]
    pub resolution: Option<TicketResolution>,
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

fn reload(conn: &Connection, id: i64) -> Result<Ticket> {
    store::ticket_by_id_unsafe(conn, id)?
        .ok_or_else(|| Error::invariant(format!("ticket {id} vanished")))
}

fn schedule_update(conn: &Connection, actor: &Actor<'_>, ticket: &Ticket) -> Result<()> {
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::TicketUpdate, &Subject::Ticket(ticket))?;
    Ok(())
}

fn require(allowed: bool) -> Result<()> {
    if allowed { Ok(()) } else { Err(Error::AccessDenied) }
}

/// Resolution a ticket ends up with. Resolved tickets need a real
/// resolution; every other status is unresolved.
fn resolution_for(status: TicketStatus, resolution: Option<TicketResolution>) -> Result<TicketResolution> {
    match (status, resolution) {
        (TicketStatus::Resolved, Some(r)) if r != TicketResolution::Unresolved => Ok(r),
        (TicketStatus::Resolved, _) => Err(Error::Invalid(
            "a resolution is required to resolve a ticket".into(),
        )),
        (_, None | Some(TicketResolution::Unresolved)) => Ok(TicketResolution::Unresolved),
        (_, Some(_)) => Err(Error::Invalid(
            "only resolved tickets can have a resolution".into(),
        )),
    }
}

/// Submits a ticket. A non-empty body counts as the first comment for
/// notification purposes and is scanned for mentions.
pub fn submit_ticket(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    input: &TicketInput,
) -> Result<Ticket> {
    let tracker = visible_tracker(conn, actor, tracker_id)?;
    require(tracker.can_submit())?;
    if tracker.import_in_progress {
        return Err(Error::Conflict("an import is in progress for this tracker".into()));
    }
    validate_subject(&input.subject)?;

    let submitter = actor.participant(conn)?;
    let scoped_id = allocate_ticket_id(conn, tracker.id)?;
    let body = non_empty(input.body.as_deref());
    let id = store::insert_ticket(
        conn,
        &NewTicket {
            body: body.map(str::to_string),
            ..NewTicket::new(tracker.id, scoped_id, submitter.id, input.subject.trim())
        },
    )?;
    let ticket = reload(conn, id)?;

    let mut mask = EventType::CREATED;
    if body.is_some() {
        mask = mask | EventType::COMMENT;
    }
    publish_event(
        conn,
        actor,
        &submitter,
        &tracker,
        &ticket,
        &NewEvent::new(mask, ticket.id, submitter.id),
        body,
    )?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::TicketCreated, &Subject::Ticket(&ticket))?;
    tracing::info!(reference = %ticket.reference(), "submitted ticket");
    Ok(ticket)
}

/// Edits subject and body. Allowed to the submitter and to EDIT holders.
pub fn update_ticket(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    update: &TicketUpdate,
) -> Result<Ticket> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    let submitter = actor.participant(conn)?;
    require(tracker.can_edit() || ticket.submitter_id == submitter.id)?;

    let subject = update.subject.as_deref().unwrap_or(&ticket.subject);
    validate_subject(subject)?;
    let body = match &update.body {
        Some(body) => non_empty(Some(body)),
        None => ticket.body.as_deref(),
    };
    store::update_ticket_text(conn, ticket.id, subject.trim(), body)?;

    let ticket = reload(conn, ticket.id)?;
    schedule_update(conn, actor, &ticket)?;
    Ok(ticket)
}

struct StatusChange {
    old: (TicketStatus, TicketResolution),
    new: (TicketStatus, TicketResolution),
}

impl StatusChange {
    fn apply(self, conn: &Connection, ticket: &Ticket, event: &mut NewEvent) -> Result<()> {
        store::update_ticket_status(conn, ticket.id, self.new.0, self.new.1)?;
        event.event_type = event.event_type | EventType::STATUS_CHANGE;
        event.old_status = Some(self.old.0);
        event.old_resolution = Some(self.old.1);
        event.new_status = Some(self.new.0);
        event.new_resolution = Some(self.new.1);
        Ok(())
    }
}

fn status_change(
    tracker: &Tracker,
    ticket: &Ticket,
    status: Option<TicketStatus>,
    resolution: Option<TicketResolution>,
) -> Result<Option<StatusChange>> {
    let Some(status) = status else {
        if resolution.is_some() {
            return Err(Error::Invalid("a resolution requires a status".into()));
        }
        return Ok(None);
    };
    require(tracker.can_triage())?;
    let resolution = resolution_for(status, resolution)?;
    let old = (ticket.status, ticket.resolution);
    if old == (status, resolution) {
        return Ok(None);
    }
    Ok(Some(StatusChange {
        old,
        new: (status, resolution),
    }))
}

/// Comments on a ticket, optionally changing its status in the same event.
pub fn comment(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    input: &CommentInput,
) -> Result<Event> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    require(tracker.can_comment())?;
    let text = non_empty(Some(&input.text));
    let change = status_change(&tracker, &ticket, input.status, input.resolution)?;
    if text.is_none() && change.is_none() {
        return Err(Error::Invalid("a comment or a status change is required".into()));
    }

    let submitter = actor.participant(conn)?;
    let mut event = NewEvent {
        ticket_id: ticket.id,
        participant_id: Some(submitter.id),
        ..NewEvent::default()
    };
    if let Some(text) = text {
        let stored = store::insert_comment(
            conn,
            &NewComment {
                ticket_id: ticket.id,
                submitter_id: submitter.id,
                text,
                authenticity: Authenticity::Authentic,
                created: None,
            },
        )?;
        event.event_type = EventType::COMMENT;
        event.comment_id = Some(stored.id);
    }
    let status_changed = change.is_some();
    if let Some(change) = change {
        change.apply(conn, &ticket, &mut event)?;
    }

    let ticket = reload(conn, ticket.id)?;
    let published = publish_event(conn, actor, &submitter, &tracker, &ticket, &event, text)?;
    if status_changed {
        schedule_update(conn, actor, &ticket)?;
    }
    Ok(published)
}

/// Changes status without a comment. Requires TRIAGE.
pub fn update_status(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    status: TicketStatus,
    resolution: Option<TicketResolution>,
) -> Result<Option<Event>> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    let Some(change) = status_change(&tracker, &ticket, Some(status), resolution)? else {
        return Ok(None);
    };
    let submitter = actor.participant(conn)?;
    let mut event = NewEvent {
        ticket_id: ticket.id,
        participant_id: Some(submitter.id),
        ..NewEvent::default()
    };
    change.apply(conn, &ticket, &mut event)?;

    let ticket = reload(conn, ticket.id)?;
    let published = publish_event(conn, actor, &submitter, &tracker, &ticket, &event, None)?;
    schedule_update(conn, actor, &ticket)?;
    Ok(Some(published))
}

fn triage_event(
    conn: &Connection,
    actor: &Actor<'_>,
    submitter: &Participant,
    tracker: &Tracker,
    ticket: &Ticket,
    event: NewEvent,
) -> Result<Event> {
    store::touch_ticket(conn, ticket.id)?;
    let ticket = reload(conn, ticket.id)?;
    let published = publish_event(conn, actor, submitter, tracker, &ticket, &event, None)?;
    schedule_update(conn, actor, &ticket)?;
    Ok(published)
}

fn tracker_label(conn: &Connection, actor: &Actor<'_>, tracker: &Tracker, label_id: i64) -> Result<i64> {
    labels_by_ids(conn, Some(actor.user.id), &[label_id])?
        .pop()
        .flatten()
        .filter(|label| label.tracker_id == tracker.id)
        .map(|label| label.id)
        .ok_or(Error::NotFound)
}

pub fn add_label(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    label_id: i64,
) -> Result<Event> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    require(tracker.can_triage())?;
    let label_id = tracker_label(conn, actor, &tracker, label_id)?;
    if !store::add_ticket_label(conn, ticket.id, label_id, actor.user.id)? {
        return Err(Error::Conflict("this label is already applied".into()));
    }
    let submitter = actor.participant(conn)?;
    let event = NewEvent {
        label_id: Some(label_id),
        ..NewEvent::new(EventType::LABEL_ADDED, ticket.id, submitter.id)
    };
    triage_event(conn, actor, &submitter, &tracker, &ticket, event)
}

pub fn remove_label(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    label_id: i64,
) -> Result<Event> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    require(tracker.can_triage())?;
    let label_id = tracker_label(conn, actor, &tracker, label_id)?;
    if !store::remove_ticket_label(conn, ticket.id, label_id)? {
        return Err(Error::NotFound);
    }
    let submitter = actor.participant(conn)?;
    let event = NewEvent {
        label_id: Some(label_id),
        ..NewEvent::new(EventType::LABEL_REMOVED, ticket.id, submitter.id)
    };
    triage_event(conn, actor, &submitter, &tracker, &ticket, event)
}

fn assignee(conn: &Connection, actor: &Actor<'_>, username: &str) -> Result<(Participant, i64)> {
    let participant = actor
        .resolver
        .by_username(conn, username)?
        .ok_or(Error::NotFound)?;
    let user_id = participant
        .user_id()
        .ok_or_else(|| Error::invariant(format!("participant {} is not a user", participant.id)))?;
    Ok((participant, user_id))
}

/// Assigns a user. The assignee is subscribed to the ticket.
pub fn assign(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    username: &str,
) -> Result<Event> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    require(tracker.can_triage())?;
    let (target, user_id) = assignee(conn, actor, username)?;
    if !store::assign_user(conn, ticket.id, user_id, actor.user.id)? {
        return Err(Error::Conflict(format!("{username} is already assigned")));
    }
    subscribe(conn, target.id, SubscriptionTarget::Ticket(ticket.id))?;

    let submitter = actor.participant(conn)?;
    let event = NewEvent {
        by_participant_id: Some(submitter.id),
        ..NewEvent::new(EventType::ASSIGNED_USER, ticket.id, target.id)
    };
    triage_event(conn, actor, &submitter, &tracker, &ticket, event)
}

pub fn unassign(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    username: &str,
) -> Result<Event> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    require(tracker.can_triage())?;
    let (target, user_id) = assignee(conn, actor, username)?;
    if !store::unassign_user(conn, ticket.id, user_id)? {
        return Err(Error::NotFound);
    }

    let submitter = actor.participant(conn)?;
    let event = NewEvent {
        by_participant_id: Some(submitter.id),
        ..NewEvent::new(EventType::UNASSIGNED_USER, ticket.id, target.id)
    };
    triage_event(conn, actor, &submitter, &tracker, &ticket, event)
}

/// Deletes a ticket. Only the tracker owner may; the scoped id is not reused.
pub fn delete_ticket(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
) -> Result<Ticket> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    require(tracker.owner_id == actor.user.id)?;
    actor
        .dispatcher(conn)?
        .schedule(WebhookEvent::TicketDeleted, &Subject::Ticket(&ticket))?;
    store::delete_ticket(conn, ticket.id)?;
    tracing::info!(reference = %ticket.reference(), "deleted ticket");
    Ok(ticket)
}

/// Replaces a comment's text with a new revision. Allowed to the author and
/// to TRIAGE holders.
pub fn edit_comment(
    conn: &Connection,
    actor: &Actor<'_>,
    tracker_id: i64,
    scoped_id: i64,
    comment_id: i64,
    text: &str,
) -> Result<Comment> {
    let (tracker, ticket) = visible_ticket(conn, actor, tracker_id, scoped_id)?;
    let old = store::comment_by_id_unsafe(conn, comment_id)?
        .filter(|c| c.ticket_id == ticket.id)
        .ok_or(Error::NotFound)?;
    let submitter = actor.participant(conn)?;
    require(old.submitter_id == submitter.id || tracker.can_triage())?;
    let text = non_empty(Some(text))
        .ok_or_else(|| Error::Invalid("comment text cannot be empty".into()))?;

    let revision = store::revise_comment(conn, &old, text)?;
    schedule_update(conn, actor, &reload(conn, ticket.id)?)?;
    Ok(revision)
}
