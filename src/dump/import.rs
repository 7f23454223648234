use std::collections::HashMap;
use std::time::Instant;

use rusqlite::Connection;

use super::DumpContext;
use super::format::{
    CommentSignatureData, DumpComment, DumpEvent, DumpParticipant, DumpTicket,
    TicketSignatureData, TrackerDump,
};
use crate::error::{Error, Result};
use crate::participants::ParticipantResolver;
use crate::store::events::{NewEvent, insert_event};
use crate::store::tickets::{self, NewComment, NewTicket};
use crate::store::{run_in_transaction, trackers};
use crate::types::{Authenticity, EventType, Participant, TicketResolution, TicketStatus, Tracker};

/// What an import wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub labels: usize,
    pub tickets: usize,
    pub events: usize,
    pub comments: usize,
    pub skipped_events: usize,
}

/// Imports `dump` into the empty tracker `tracker_id`.
///
/// The caller must have set the import flag with
/// [`trackers::mark_import_started`]. The flag is cleared here whatever the
/// outcome. All rows are written in one transaction: a failed import leaves
/// the tracker untouched.
pub fn import_tracker(
    conn: &mut Connection,
    ctx: &DumpContext,
    resolver: &ParticipantResolver,
    tracker_id: i64,
    dump: &TrackerDump,
    deadline: Option<Instant>,
) -> Result<ImportSummary> {
    let result = run_in_transaction(conn, |tx| {
        Importer {
            conn: tx,
            ctx,
            resolver,
            deadline,
            summary: ImportSummary::default(),
        }
        .run(tracker_id, dump)
    });

    if let Err(e) = trackers::clear_import_flag(conn, tracker_id) {
        return Err(Error::invariant(format!(
            "failed to clear import flag on tracker {tracker_id}: {e}"
        )));
    }

    match &result {
        Ok(summary) => tracing::info!(
            tracker = tracker_id,
            tickets = summary.tickets,
            events = summary.events,
            "tracker import finished"
        ),
        Err(e) => tracing::warn!(tracker = tracker_id, "tracker import failed: {e}"),
    }
    result
}

struct Importer<'a> {
    conn: &'a Connection,
    ctx: &'a DumpContext,
    resolver: &'a ParticipantResolver,
    deadline: Option<Instant>,
    summary: ImportSummary,
}

impl Importer<'_> {
    fn run(mut self, tracker_id: i64, dump: &TrackerDump) -> Result<ImportSummary> {
        let tracker =
            trackers::tracker_by_id_unsafe(self.conn, None, tracker_id)?.ok_or(Error::NotFound)?;
        if tracker.next_ticket_id != 1 {
            return Err(Error::Conflict(
                "tracker must be empty to import tickets".into(),
            ));
        }

        let mut labels = HashMap::new();
        for label in &dump.labels {
            let created = trackers::create_label(
                self.conn,
                tracker.id,
                &label.name,
                &label.background_color,
                &label.foreground_color,
            )?;
            labels.insert(label.name.clone(), created.id);
            self.summary.labels += 1;
        }

        let mut max_scoped_id = 0;
        for ticket in &dump.tickets {
            self.check_deadline()?;
            self.import_ticket(&tracker, dump.id, ticket, &labels)?;
            max_scoped_id = max_scoped_id.max(ticket.id);
        }

        trackers::set_next_ticket_id(self.conn, tracker.id, max_scoped_id + 1)?;
        Ok(self.summary)
    }

    fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout),
            _ => Ok(()),
        }
    }

    /// Resolves a dumped participant. Users of a foreign upstream become
    /// external participants.
    fn participant(&self, p: &DumpParticipant, upstream: &str) -> Result<Option<Participant>> {
        match p {
            DumpParticipant::User {
                canonical_name,
                name,
                ..
            } => {
                if upstream == self.ctx.origin {
                    self.resolver.by_username(self.conn, name)
                } else {
                    let url = format!("{}/{canonical_name}", upstream.trim_end_matches('/'));
                    self.resolver
                        .by_external(self.conn, canonical_name, &url)
                        .map(Some)
                }
            }
            DumpParticipant::Email { address, name } => self
                .resolver
                .by_email(self.conn, address, name.as_deref())
                .map(Some),
            DumpParticipant::External {
                external_id,
                external_url,
            } => self
                .resolver
                .by_external(self.conn, external_id, external_url)
                .map(Some),
        }
    }

    fn required_participant(&self, p: &DumpParticipant, upstream: &str) -> Result<Participant> {
        self.participant(p, upstream)?.ok_or_else(|| {
            let who = match p {
                DumpParticipant::User { canonical_name, .. } => canonical_name.as_str(),
                DumpParticipant::Email { address, .. } => address.as_str(),
                DumpParticipant::External { external_id, .. } => external_id.as_str(),
            };
            Error::Invalid(format!("unknown participant {who}"))
        })
    }

    fn authenticity<T: serde::Serialize>(
        &self,
        author: &DumpParticipant,
        upstream: &str,
        signed: &T,
        signature: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<Authenticity> {
        if upstream != self.ctx.origin || !matches!(author, DumpParticipant::User { .. }) {
            return Ok(Authenticity::Unauthenticated);
        }
        let (Some(signature), Some(nonce)) = (signature, nonce) else {
            return Ok(Authenticity::Tampered);
        };
        let payload = serde_json::to_vec(signed)?;
        Ok(if self.ctx.signer.verify(&payload, nonce, signature) {
            Authenticity::Authentic
        } else {
            Authenticity::Tampered
        })
    }

    fn import_ticket(
        &mut self,
        tracker: &Tracker,
        dump_tracker_id: i64,
        ticket: &DumpTicket,
        labels: &HashMap<String, i64>,
    ) -> Result<()> {
        let submitter = self.required_participant(&ticket.submitter, &ticket.upstream)?;
        let authenticity = match &ticket.submitter {
            DumpParticipant::User { user_id, .. } => self.authenticity(
                &ticket.submitter,
                &ticket.upstream,
                &TicketSignatureData {
                    tracker_id: dump_tracker_id,
                    ticket_id: ticket.id,
                    subject: &ticket.subject,
                    body: ticket.body.as_deref().unwrap_or_default(),
                    submitter_id: *user_id,
                    upstream_origin: &ticket.upstream,
                },
                ticket.signature.as_deref(),
                ticket.nonce.as_deref(),
            )?,
            _ => Authenticity::Unauthenticated,
        };
        if authenticity == Authenticity::Tampered {
            tracing::warn!(reference = %ticket.reference, "imported ticket failed verification");
        }

        let ticket_id = tickets::insert_ticket(
            self.conn,
            &NewTicket {
                body: ticket.body.clone(),
                status: ticket.status,
                resolution: ticket.resolution,
                authenticity,
                created: Some(ticket.created),
                updated: Some(ticket.updated),
                ..NewTicket::new(tracker.id, ticket.id, submitter.id, &ticket.subject)
            },
        )?;
        self.summary.tickets += 1;

        for name in &ticket.labels {
            let label_id = labels
                .get(name)
                .ok_or_else(|| Error::Invalid(format!("ticket uses unknown label {name}")))?;
            tickets::add_ticket_label(self.conn, ticket_id, *label_id, tracker.owner_id)?;
        }

        for assignee in &ticket.assignees {
            match self.resolver.by_username(self.conn, &assignee.name)? {
                Some(p) => {
                    if let Some(user_id) = p.user_id() {
                        tickets::assign_user(self.conn, ticket_id, user_id, tracker.owner_id)?;
                    }
                }
                None => tracing::debug!(username = %assignee.name, "skipping unknown assignee"),
            }
        }

        for event in &ticket.events {
            self.import_event(dump_tracker_id, ticket, ticket_id, event, labels)?;
        }
        Ok(())
    }

    fn import_event(
        &mut self,
        dump_tracker_id: i64,
        ticket: &DumpTicket,
        ticket_id: i64,
        event: &DumpEvent,
        labels: &HashMap<String, i64>,
    ) -> Result<()> {
        let event_type = EventType::parse_names(&event.event_type).ok_or_else(|| {
            Error::Invalid(format!("invalid event type {:?}", event.event_type))
        })?;
        if event_type.contains(EventType::USER_MENTIONED)
            || event_type.contains(EventType::TICKET_MENTIONED)
        {
            self.summary.skipped_events += 1;
            return Ok(());
        }

        let mut new = NewEvent {
            event_type,
            ticket_id,
            created: Some(event.created),
            ..NewEvent::default()
        };
        if let Some(p) = &event.participant {
            new.participant_id = Some(self.required_participant(p, &event.upstream)?.id);
        }
        if let Some(p) = &event.by_user {
            new.by_participant_id = Some(self.required_participant(p, &event.upstream)?.id);
        }

        // A submission's body travels on the ticket, so its COMMENT bit has no comment.
        if event_type.contains(EventType::COMMENT) {
            if let Some(comment) = &event.comment {
                let id =
                    self.import_comment(dump_tracker_id, ticket, ticket_id, event, comment)?;
                new.comment_id = Some(id);
            }
        }

        if event_type.contains(EventType::STATUS_CHANGE) {
            new.old_status = Some(parse_or(
                event.old_status.as_deref(),
                TicketStatus::parse,
                TicketStatus::Reported,
            )?);
            new.old_resolution = Some(parse_or(
                event.old_resolution.as_deref(),
                TicketResolution::parse,
                TicketResolution::Unresolved,
            )?);
            let new_status = event
                .new_status
                .as_deref()
                .ok_or_else(|| Error::Invalid("status change without new_status".into()))?;
            new.new_status = Some(parse_or(
                Some(new_status),
                TicketStatus::parse,
                TicketStatus::Reported,
            )?);
            new.new_resolution = event
                .new_resolution
                .as_deref()
                .map(|s| parse_or(Some(s), TicketResolution::parse, TicketResolution::Unresolved))
                .transpose()?;
        }

        if event_type.contains(EventType::LABEL_ADDED)
            || event_type.contains(EventType::LABEL_REMOVED)
        {
            let name = event
                .label
                .as_deref()
                .ok_or_else(|| Error::Invalid("label event without a label".into()))?;
            new.label_id = Some(
                *labels
                    .get(name)
                    .ok_or_else(|| Error::Invalid(format!("event uses unknown label {name}")))?,
            );
        }

        if (event_type.contains(EventType::ASSIGNED_USER)
            || event_type.contains(EventType::UNASSIGNED_USER))
            && new.by_participant_id.is_none()
        {
            return Err(Error::Invalid("assignment event without an actor".into()));
        }

        insert_event(self.conn, &new)?;
        self.summary.events += 1;
        Ok(())
    }
    fn import_comment(
        &mut self,
        dump_tracker_id: i64,
        ticket: &DumpTicket,
        ticket_id: i64,
        event: &DumpEvent,
        comment: &DumpComment,
    ) -> Result<i64> {
        let author = self.required_participant(&comment.author, &event.upstream)?;
        let authenticity = match &comment.author {
            DumpParticipant::User { user_id, .. } => self.authenticity(
                &comment.author,
                &event.upstream,
                &CommentSignatureData {
                    tracker_id: dump_tracker_id,
                    ticket_id: ticket.id,
                    comment: &comment.text,
                    author_id: *user_id,
                    upstream_origin: &event.upstream,
                },
                event.signature.as_deref(),
                event.nonce.as_deref(),
            )?,
            _ => Authenticity::Unauthenticated,
        };
        if authenticity == Authenticity::Tampered {
            tracing::warn!(reference = %ticket.reference, "imported comment failed verification");
        }
        // The dumped ticket already carries its final `updated` stamp.
        let stored = tickets::insert_imported_comment(
            self.conn,
            &NewComment {
                ticket_id,
                submitter_id: author.id,
                text: &comment.text,
                authenticity,
                created: Some(comment.created),
            },
        )?;
        self.summary.comments += 1;
        Ok(stored.id)
    }
}

/// Parses an enum name, using `default` when absent. Unknown names fail.
fn parse_or<T>(value: Option<&str>, parse: fn(&str) -> Option<T>, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(s) => parse(s).ok_or_else(|| Error::Invalid(format!("unknown enum value {s}"))),
    }
}
