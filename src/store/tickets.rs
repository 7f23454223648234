//! Tickets, comments, assignees and ticket labels.
//!
//! A ticket is visible when its tracker is visible and the viewer either has
//! BROWSE on the tracker or submitted the ticket.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Value};

use super::trackers::{TRACKER_ACCESS, TRACKER_FROM, tracker_visible};
use super::{align, format_datetime, now, parse_datetime, placeholders};
use crate::error::{Error, Result};
use crate::types::{
    Authenticity, Comment, Cursor, Label, Ticket, TicketResolution, TicketStatus, User,
};

const TICKET_COLUMNS: &str = "tk.id, tk.tracker_id, tk.scoped_id, o.username, t.name, \
     tk.created, tk.updated, tk.submitter_id, tk.subject, tk.body, tk.status, \
     tk.resolution, tk.authenticity, tk.comment_count";

pub(crate) fn ticket_from() -> String {
    format!(
        "{TRACKER_FROM}
        JOIN ticket tk ON tk.tracker_id = t.id
        JOIN participant sp ON sp.id = tk.submitter_id"
    )
}

pub(crate) fn ticket_visible() -> String {
    format!(
        "{} AND (({TRACKER_ACCESS} & 1) != 0 OR sp.user_id = ?1)",
        tracker_visible()
    )
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        tracker_id: row.get(1)?,
        scoped_id: row.get(2)?,
        owner_name: row.get(3)?,
        tracker_name: row.get(4)?,
        created: parse_datetime(&row.get::<_, String>(5)?),
        updated: parse_datetime(&row.get::<_, String>(6)?),
        submitter_id: row.get(7)?,
        subject: row.get(8)?,
        body: row.get(9)?,
        status: row.get(10)?,
        resolution: row.get(11)?,
        authenticity: row.get(12)?,
        comment_count: row.get(13)?,
    })
}

fn query_tickets(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<Ticket>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), ticket_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn viewer_value(viewer: Option<i64>) -> Value {
    viewer.map_or(Value::Null, Value::Integer)
}

pub fn tickets_by_ids(
    conn: &Connection,
    viewer: Option<i64>,
    ids: &[i64],
) -> Result<Vec<Option<Ticket>>> {
    let sql = format!(
        "SELECT {TICKET_COLUMNS} FROM {} WHERE tk.id IN ({}) AND {}",
        ticket_from(),
        placeholders(2, ids.len()),
        ticket_visible(),
    );
    let mut args = vec![viewer_value(viewer)];
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
    let rows = query_tickets(conn, &sql, args)?;
    Ok(align(ids, rows, |t| t.id))
}

/// Batch-loads tickets by `(tracker id, scoped id)`.
pub fn tickets_by_scoped_ids(
    conn: &Connection,
    viewer: Option<i64>,
    keys: &[(i64, i64)],
) -> Result<Vec<Option<Ticket>>> {
    let tuples = (0..keys.len())
        .map(|i| format!("(?{}, ?{})", 2 + i * 2, 3 + i * 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {TICKET_COLUMNS} FROM {} WHERE (tk.tracker_id, tk.scoped_id) IN (VALUES {tuples}) AND {}",
        ticket_from(),
        ticket_visible(),
    );
    let mut args = vec![viewer_value(viewer)];
    for (tracker_id, scoped_id) in keys {
        args.push(Value::Integer(*tracker_id));
        args.push(Value::Integer(*scoped_id));
    }
    let rows = query_tickets(conn, &sql, args)?;
    Ok(align(keys, rows, |t| (t.tracker_id, t.scoped_id)))
}

/// Loads a ticket with no access check.
pub fn ticket_by_id_unsafe(conn: &Connection, id: i64) -> Result<Option<Ticket>> {
    let sql = format!(
        "SELECT {TICKET_COLUMNS} FROM {} WHERE tk.id = ?2",
        ticket_from()
    );
    conn.query_row(&sql, params![Option::<i64>::None, id], ticket_from_row)
        .optional()
        .map_err(Error::from)
}

/// Lists a tracker's tickets newest first. `submitter_user` restricts the
/// list to tickets that user submitted.
pub fn list_tickets(
    conn: &Connection,
    viewer: Option<i64>,
    tracker_id: i64,
    submitter_user: Option<i64>,
    cursor: &Cursor,
) -> Result<Vec<Ticket>> {
    let sql = format!(
        "SELECT {TICKET_COLUMNS} FROM {}
         WHERE tk.tracker_id = ?2 AND {}
           AND (?3 IS NULL OR sp.user_id = ?3)
           AND (?4 IS NULL OR tk.id < ?4)
           AND (?5 IS NULL OR tk.subject LIKE ?5 ESCAPE '\\' OR tk.body LIKE ?5 ESCAPE '\\')
         ORDER BY tk.id DESC LIMIT ?6",
        ticket_from(),
        ticket_visible(),
    );
    let args = vec![
        viewer_value(viewer),
        Value::Integer(tracker_id),
        submitter_user.map_or(Value::Null, Value::Integer),
        cursor.next.map_or(Value::Null, Value::Integer),
        cursor.search_pattern().map_or(Value::Null, Value::Text),
        Value::Integer(cursor.fetch_limit()),
    ];
    query_tickets(conn, &sql, args)
}

/// Every ticket of a tracker in scoped id order, optionally restricted to
/// one submitting user. Used by exports, which authorize up front.
pub fn all_tickets(
    conn: &Connection,
    tracker_id: i64,
    submitter_user: Option<i64>,
) -> Result<Vec<Ticket>> {
    let sql = format!(
        "SELECT {TICKET_COLUMNS} FROM {}
         WHERE tk.tracker_id = ?2 AND (?3 IS NULL OR sp.user_id = ?3)
         ORDER BY tk.scoped_id ASC",
        ticket_from(),
    );
    query_tickets(
        conn,
        &sql,
        vec![
            Value::Null,
            Value::Integer(tracker_id),
            submitter_user.map_or(Value::Null, Value::Integer),
        ],
    )
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub tracker_id: i64,
    pub scoped_id: i64,
    pub submitter_id: i64,
    pub subject: String,
    pub body: Option<String>,
    pub status: TicketStatus,
    pub resolution: TicketResolution,
    pub authenticity: Authenticity,
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    pub updated: Option<chrono::DateTime<chrono::Utc>>,
}

impl NewTicket {
    #[must_use]
    pub fn new(tracker_id: i64, scoped_id: i64, submitter_id: i64, subject: &str) -> Self {
        Self {
            tracker_id,
            scoped_id,
            submitter_id,
            subject: subject.to_string(),
            body: None,
            status: TicketStatus::Reported,
            resolution: TicketResolution::Unresolved,
            authenticity: Authenticity::Authentic,
            created: None,
            updated: None,
        }
    }
}

pub fn insert_ticket(conn: &Connection, ticket: &NewTicket) -> Result<i64> {
    let ts = now();
    let created = ticket.created.as_ref().map_or_else(|| ts.clone(), format_datetime);
    let updated = ticket.updated.as_ref().map_or_else(|| created.clone(), format_datetime);
    let result = conn.execute(
        "INSERT INTO ticket (created, updated, tracker_id, scoped_id, submitter_id, subject,
             body, status, resolution, authenticity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            created,
            updated,
            ticket.tracker_id,
            ticket.scoped_id,
            ticket.submitter_id,
            ticket.subject,
            ticket.body,
            ticket.status,
            ticket.resolution,
            ticket.authenticity,
        ],
    );
    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::Conflict(format!(
                "ticket #{} already exists",
                ticket.scoped_id
            )))
        }
        Err(e) => Err(Error::from(e)),
    }
}

pub fn update_ticket_text(
    conn: &Connection,
    id: i64,
    subject: &str,
    body: Option<&str>,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE ticket SET updated = ?1, subject = ?2, body = ?3 WHERE id = ?4",
        params![now(), subject, body, id],
    )?;
    if rows == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn update_ticket_status(
    conn: &Connection,
    id: i64,
    status: TicketStatus,
    resolution: TicketResolution,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE ticket SET updated = ?1, status = ?2, resolution = ?3 WHERE id = ?4",
        params![now(), status, resolution, id],
    )?;
    if rows == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn touch_ticket(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE ticket SET updated = ?1 WHERE id = ?2",
        params![now(), id],
    )?;
    Ok(())
}

/// Deletes a ticket. The tracker's counter is untouched, so scoped ids
/// are never reused.
pub fn delete_ticket(conn: &Connection, id: i64) -> Result<bool> {
    let rows = conn.execute("DELETE FROM ticket WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// Comment operations

const COMMENT_COLUMNS: &str = "c.id, c.ticket_id, c.created, c.updated, c.submitter_id, \
     c.text, c.authenticity, c.superceded_by_id";

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        created: parse_datetime(&row.get::<_, String>(2)?),
        updated: parse_datetime(&row.get::<_, String>(3)?),
        submitter_id: row.get(4)?,
        text: row.get(5)?,
        authenticity: row.get(6)?,
        superceded_by_id: row.get(7)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewComment<'a> {
    pub ticket_id: i64,
    pub submitter_id: i64,
    pub text: &'a str,
    pub authenticity: Authenticity,
    pub created: Option<chrono::DateTime<chrono::Utc>>,
}

/// Inserts a comment and bumps the ticket's comment count.
pub fn insert_comment(conn: &Connection, comment: &NewComment<'_>) -> Result<Comment> {
    let inserted = insert_comment_row(conn, comment)?;
    conn.execute(
        "UPDATE ticket SET comment_count = comment_count + 1, updated = ?1 WHERE id = ?2",
        params![now(), comment.ticket_id],
    )?;
    Ok(inserted)
}

/// Inserts a comment from a tracker import. Only the comment count moves;
/// the ticket keeps its imported `updated` stamp.
pub fn insert_imported_comment(conn: &Connection, comment: &NewComment<'_>) -> Result<Comment> {
    let inserted = insert_comment_row(conn, comment)?;
    conn.execute(
        "UPDATE ticket SET comment_count = comment_count + 1 WHERE id = ?1",
        params![comment.ticket_id],
    )?;
    Ok(inserted)
}

/// Stores an edited revision of `old` and points `old` at it. The ticket's
/// comment count is unchanged.
pub fn revise_comment(conn: &Connection, old: &Comment, text: &str) -> Result<Comment> {
    let revision = insert_comment_row(
        conn,
        &NewComment {
            ticket_id: old.ticket_id,
            submitter_id: old.submitter_id,
            text,
            authenticity: old.authenticity,
            created: None,
        },
    )?;
    supercede_comment(conn, old.id, revision.id)?;
    touch_ticket(conn, old.ticket_id)?;
    Ok(revision)
}

fn insert_comment_row(conn: &Connection, comment: &NewComment<'_>) -> Result<Comment> {
    let created = comment
        .created
        .as_ref()
        .map_or_else(now, format_datetime);
    let inserted = conn.query_row(
        &format!(
            "INSERT INTO ticket_comment (created, updated, submitter_id, ticket_id, text, authenticity)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5)
             RETURNING {}",
            COMMENT_COLUMNS.replace("c.", "")
        ),
        params![
            created,
            comment.submitter_id,
            comment.ticket_id,
            comment.text,
            comment.authenticity
        ],
        comment_from_row,
    )?;
    Ok(inserted)
}

/// Points an old comment revision at its replacement.
pub fn supercede_comment(conn: &Connection, old_id: i64, new_id: i64) -> Result<()> {
    let rows = conn.execute(
        "UPDATE ticket_comment SET superceded_by_id = ?1, updated = ?2
         WHERE id = ?3 AND superceded_by_id IS NULL",
        params![new_id, now(), old_id],
    )?;
    if rows == 0 {
        return Err(Error::Conflict("comment has already been edited".into()));
    }
    Ok(())
}

/// Follows a comment's edit chain to its current revision.
pub fn latest_revision(conn: &Connection, comment: Comment) -> Result<Comment> {
    let mut current = comment;
    while let Some(next) = current.superceded_by_id {
        current = comment_by_id_unsafe(conn, next)?.ok_or_else(|| {
            Error::invariant(format!(
                "comment {} superseded by missing comment {next}",
                current.id
            ))
        })?;
    }
    Ok(current)
}

/// Batch-loads comments through their ticket's visibility.
pub fn comments_by_ids(
    conn: &Connection,
    viewer: Option<i64>,
    ids: &[i64],
) -> Result<Vec<Option<Comment>>> {
    let sql = format!(
        "SELECT {COMMENT_COLUMNS} FROM {} JOIN ticket_comment c ON c.ticket_id = tk.id
         WHERE c.id IN ({}) AND {}",
        ticket_from(),
        placeholders(2, ids.len()),
        ticket_visible(),
    );
    let mut args = vec![viewer_value(viewer)];
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), comment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(align(ids, rows, |c| c.id))
}

pub fn comment_by_id_unsafe(conn: &Connection, id: i64) -> Result<Option<Comment>> {
    conn.query_row(
        &format!("SELECT {COMMENT_COLUMNS} FROM ticket_comment c WHERE c.id = ?1"),
        params![id],
        comment_from_row,
    )
    .optional()
    .map_err(Error::from)
}

// Assignee operations

/// Returns false if the user was already assigned.
pub fn assign_user(
    conn: &Connection,
    ticket_id: i64,
    assignee_id: i64,
    assigner_id: i64,
) -> Result<bool> {
    let rows = conn.execute(
        "INSERT INTO ticket_assignee (created, ticket_id, assignee_id, assigner_id)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (ticket_id, assignee_id) DO NOTHING",
        params![now(), ticket_id, assignee_id, assigner_id],
    )?;
    Ok(rows > 0)
}

pub fn unassign_user(conn: &Connection, ticket_id: i64, assignee_id: i64) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM ticket_assignee WHERE ticket_id = ?1 AND assignee_id = ?2",
        params![ticket_id, assignee_id],
    )?;
    Ok(rows > 0)
}

pub fn ticket_assignees(conn: &Connection, ticket_id: i64) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        r#"SELECT {} FROM ticket_assignee a JOIN "user" u ON u.id = a.assignee_id
           WHERE a.ticket_id = ?1 ORDER BY a.id ASC"#,
        super::users::USER_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![ticket_id], super::users::user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// Ticket label operations

/// Returns false if the label was already applied.
pub fn add_ticket_label(
    conn: &Connection,
    ticket_id: i64,
    label_id: i64,
    user_id: i64,
) -> Result<bool> {
    let rows = conn.execute(
        "INSERT INTO ticket_label (created, ticket_id, label_id, user_id)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (ticket_id, label_id) DO NOTHING",
        params![now(), ticket_id, label_id, user_id],
    )?;
    Ok(rows > 0)
}

pub fn remove_ticket_label(conn: &Connection, ticket_id: i64, label_id: i64) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM ticket_label WHERE ticket_id = ?1 AND label_id = ?2",
        params![ticket_id, label_id],
    )?;
    Ok(rows > 0)
}

pub fn ticket_labels(conn: &Connection, ticket_id: i64) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.tracker_id, l.created, l.name, l.color, l.text_color
         FROM ticket_label tl JOIN label l ON l.id = tl.label_id
         WHERE tl.ticket_id = ?1 ORDER BY l.id ASC",
    )?;
    let rows = stmt
        .query_map(params![ticket_id], super::trackers::label_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
