use std::collections::HashMap;
use std::io::Write;

use rusqlite::Connection;

use super::DumpContext;
use super::format::{
    CommentSignatureData, DumpComment, DumpEvent, DumpLabel, DumpParticipant, DumpTicket,
    DumpTicketRef, DumpUser, TicketSignatureData, TrackerDump, write_dump,
};
use crate::error::{Error, Result};
use crate::store::{events, participants, tickets, trackers, users};
use crate::types::{EventType, ParticipantKind, Ticket, Tracker};

/// Caches participant lookups; a tracker's history references few actors.
struct Participants<'c> {
    conn: &'c Connection,
    cache: HashMap<i64, DumpParticipant>,
}

impl<'c> Participants<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            cache: HashMap::new(),
        }
    }

    fn get(&mut self, id: i64) -> Result<DumpParticipant> {
        if let Some(p) = self.cache.get(&id) {
            return Ok(p.clone());
        }
        let participant = participants::get_participant(self.conn, id)?
            .ok_or_else(|| Error::invariant(format!("event references missing participant {id}")))?;
        let dumped = match participant.kind {
            ParticipantKind::User { user_id } => {
                let user = users::get_user(self.conn, user_id)?.ok_or_else(|| {
                    Error::invariant(format!("participant {id} references missing user {user_id}"))
                })?;
                DumpParticipant::User {
                    user_id,
                    canonical_name: user.canonical_name(),
                    name: user.username,
                }
            }
            ParticipantKind::Email { address, name } => DumpParticipant::Email { address, name },
            ParticipantKind::External {
                external_id,
                external_url,
            } => DumpParticipant::External {
                external_id,
                external_url,
            },
        };
        self.cache.insert(id, dumped.clone());
        Ok(dumped)
    }
}

fn user_id_of(p: &DumpParticipant) -> Option<i64> {
    match p {
        DumpParticipant::User { user_id, .. } => Some(*user_id),
        _ => None,
    }
}

/// The comment of a COMMENT event together with its local author, if any.
fn comment_author(
    event_type: EventType,
    comment: Option<&DumpComment>,
) -> Option<(&DumpComment, i64)> {
    if !event_type.contains(EventType::COMMENT) {
        return None;
    }
    let comment = comment?;
    user_id_of(&comment.author).map(|author_id| (comment, author_id))
}

/// Builds the dump of `tracker` as seen by `viewer`.
///
/// `tracker` must have been loaded for `viewer` so its access mask is the
/// viewer's. Viewers without BROWSE get only the tickets they submitted.
pub fn build_dump(
    conn: &Connection,
    ctx: &DumpContext,
    tracker: &Tracker,
    viewer: Option<i64>,
) -> Result<TrackerDump> {
    let owner = users::get_user(conn, tracker.owner_id)?
        .ok_or_else(|| Error::invariant(format!("tracker {} has no owner", tracker.id)))?;
    let labels = trackers::all_labels(conn, tracker.id)?;
    let label_names: HashMap<i64, String> =
        labels.iter().map(|l| (l.id, l.name.clone())).collect();

    let tickets = if tracker.can_browse() {
        tickets::all_tickets(conn, tracker.id, None)?
    } else if let Some(viewer) = viewer {
        tickets::all_tickets(conn, tracker.id, Some(viewer))?
    } else {
        Vec::new()
    };

    let mut people = Participants::new(conn);
    let mut dumped = Vec::with_capacity(tickets.len());
    for ticket in &tickets {
        dumped.push(dump_ticket(conn, ctx, tracker, ticket, &label_names, &mut people)?);
    }

    Ok(TrackerDump {
        id: tracker.id,
        owner: DumpUser::new(&owner.username),
        created: tracker.created,
        updated: tracker.updated,
        name: tracker.name.clone(),
        description: tracker.description.clone(),
        labels: labels
            .into_iter()
            .map(|l| DumpLabel {
                id: l.id,
                created: l.created,
                name: l.name,
                background_color: l.background_color,
                foreground_color: l.foreground_color,
            })
            .collect(),
        tickets: dumped,
    })
}

fn dump_ticket(
    conn: &Connection,
    ctx: &DumpContext,
    tracker: &Tracker,
    ticket: &Ticket,
    label_names: &HashMap<i64, String>,
    people: &mut Participants<'_>,
) -> Result<DumpTicket> {
    let submitter = people.get(ticket.submitter_id)?;
    let (signature, nonce) = match user_id_of(&submitter) {
        Some(user_id) => {
            let data = TicketSignatureData {
                tracker_id: tracker.id,
                ticket_id: ticket.scoped_id,
                subject: &ticket.subject,
                body: ticket.body.as_deref().unwrap_or_default(),
                submitter_id: user_id,
                upstream_origin: &ctx.origin,
            };
            let signed = ctx.signer.sign(&serde_json::to_vec(&data)?);
            (Some(signed.signature), Some(signed.nonce))
        }
        None => (None, None),
    };

    let mut events = Vec::new();
    for event in events::all_events(conn, ticket.id)? {
        let participant = event.participant_id.map(|id| people.get(id)).transpose()?;
        let by_user = event.by_participant_id.map(|id| people.get(id)).transpose()?;
        let comment = match event.comment_id {
            Some(id) => {
                let original = tickets::comment_by_id_unsafe(conn, id)?.ok_or_else(|| {
                    Error::invariant(format!("event {} references missing comment {id}", event.id))
                })?;
                let latest = tickets::latest_revision(conn, original.clone())?;
                Some(DumpComment {
                    id: original.id,
                    created: original.created,
                    author: people.get(original.submitter_id)?,
                    text: latest.text,
                })
            }
            None => None,
        };
        let from_ticket = match event.from_ticket_id {
            Some(id) => tickets::ticket_by_id_unsafe(conn, id)?.map(|t| DumpTicketRef {
                reference: t.reference().to_string(),
            }),
            None => None,
        };

        let (signature, nonce) = match comment_author(event.event_type, comment.as_ref()) {
            Some((comment, author_id)) => {
                let data = CommentSignatureData {
                    tracker_id: tracker.id,
                    ticket_id: ticket.scoped_id,
                    comment: &comment.text,
                    author_id,
                    upstream_origin: &ctx.origin,
                };
                let signed = ctx.signer.sign(&serde_json::to_vec(&data)?);
                (Some(signed.signature), Some(signed.nonce))
            }
            None => (None, None),
        };

        events.push(DumpEvent {
            id: event.id,
            created: event.created,
            event_type: event
                .event_type
                .names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            old_status: event.old_status.map(|s| s.name().to_string()),
            old_resolution: event.old_resolution.map(|r| r.name().to_string()),
            new_status: event.new_status.map(|s| s.name().to_string()),
            new_resolution: event.new_resolution.map(|r| r.name().to_string()),
            participant,
            comment,
            label: event.label_id.and_then(|id| label_names.get(&id).cloned()),
            by_user,
            from_ticket,
            upstream: ctx.origin.clone(),
            signature,
            nonce,
        });
    }

    Ok(DumpTicket {
        id: ticket.scoped_id,
        created: ticket.created,
        updated: ticket.updated,
        submitter,
        reference: ticket.reference().to_string(),
        subject: ticket.subject.clone(),
        body: ticket.body.clone(),
        status: ticket.status,
        resolution: ticket.resolution,
        labels: tickets::ticket_labels(conn, ticket.id)?
            .into_iter()
            .map(|l| l.name)
            .collect(),
        assignees: tickets::ticket_assignees(conn, ticket.id)?
            .iter()
            .map(|u| DumpUser::new(&u.username))
            .collect(),
        upstream: ctx.origin.clone(),
        signature,
        nonce,
        events,
    })
}

/// Writes the gzipped dump of `tracker` to `out`.
pub fn export_tracker<W: Write>(
    conn: &Connection,
    ctx: &DumpContext,
    tracker: &Tracker,
    viewer: Option<i64>,
    out: W,
) -> Result<()> {
    let dump = build_dump(conn, ctx, tracker, viewer)?;
    tracing::info!(
        tracker = tracker.id,
        tickets = dump.tickets.len(),
        "exported tracker"
    );
    write_dump(out, &dump)
}
