//! Trackers, ACLs and labels.
//!
//! Every query that can return a tracker the viewer was not pre-authorized to
//! see joins [`TRACKER_FROM`] and filters on [`TRACKER_VISIBLE`]. Parameter
//! `?1` is always the viewer's user id (NULL for anonymous).

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Value};

use super::{align, now, parse_datetime, placeholders};
use crate::error::{Error, Result};
use crate::types::{Access, Cursor, Label, Tracker, TrackerAcl, Visibility};

pub(crate) const TRACKER_FROM: &str = r#"tracker t
    JOIN "user" o ON o.id = t.owner_id
    LEFT JOIN user_access ua ON ua.tracker_id = t.id AND ua.user_id = ?1"#;

/// Effective access: owner override, then ACL row, then tracker defaults.
pub(crate) const TRACKER_ACCESS: &str = "(CASE
        WHEN t.owner_id = ?1 THEN 31
        WHEN ua.id IS NOT NULL THEN ua.permissions
        WHEN ?1 IS NOT NULL THEN t.default_user_perms
        ELSE t.default_access
    END)";

pub(crate) fn tracker_visible() -> String {
    format!(
        "(t.owner_id = ?1 OR t.visibility != 'PRIVATE' \
         OR (ua.user_id = ?1 AND ua.permissions > 0)) AND {TRACKER_ACCESS} > 0"
    )
}

fn tracker_columns() -> String {
    format!(
        "t.id, t.owner_id, o.username, t.created, t.updated, t.name, t.description, \
         t.visibility, t.default_access, t.default_user_perms, t.next_ticket_id, \
         t.import_in_progress, {TRACKER_ACCESS}"
    )
}

fn tracker_from_row(row: &Row<'_>) -> rusqlite::Result<Tracker> {
    Ok(Tracker {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_name: row.get(2)?,
        created: parse_datetime(&row.get::<_, String>(3)?),
        updated: parse_datetime(&row.get::<_, String>(4)?),
        name: row.get(5)?,
        description: row.get(6)?,
        visibility: row.get(7)?,
        default_access: row.get(8)?,
        default_user_perms: row.get(9)?,
        next_ticket_id: row.get(10)?,
        import_in_progress: row.get(11)?,
        access: row.get(12)?,
    })
}

fn query_trackers(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<Tracker>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), tracker_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn viewer_value(viewer: Option<i64>) -> Value {
    viewer.map_or(Value::Null, Value::Integer)
}

/// Batch-loads trackers by id, filtered by the viewer's access.
pub fn trackers_by_ids(
    conn: &Connection,
    viewer: Option<i64>,
    ids: &[i64],
) -> Result<Vec<Option<Tracker>>> {
    let sql = format!(
        "SELECT {} FROM {TRACKER_FROM} WHERE t.id IN ({}) AND {}",
        tracker_columns(),
        placeholders(2, ids.len()),
        tracker_visible(),
    );
    let mut args = vec![viewer_value(viewer)];
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
    let rows = query_trackers(conn, &sql, args)?;
    Ok(align(ids, rows, |t| t.id))
}

/// Batch-loads trackers by `(owner username, tracker name)`.
pub fn trackers_by_owner_names(
    conn: &Connection,
    viewer: Option<i64>,
    keys: &[(String, String)],
) -> Result<Vec<Option<Tracker>>> {
    let tuples = (0..keys.len())
        .map(|i| format!("(?{}, ?{})", 2 + i * 2, 3 + i * 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM {TRACKER_FROM} WHERE (o.username, t.name) IN (VALUES {tuples}) AND {}",
        tracker_columns(),
        tracker_visible(),
    );
    let mut args = vec![viewer_value(viewer)];
    for (owner, name) in keys {
        args.push(Value::Text(owner.clone()));
        args.push(Value::Text(name.clone()));
    }
    let rows = query_trackers(conn, &sql, args)?;
    Ok(align(keys, rows, |t| (t.owner_name.clone(), t.name.clone())))
}

/// Loads a tracker without a visibility check. The returned record still
/// carries `viewer`'s effective access. Callers must have authorized the
/// tracker by other means.
pub fn tracker_by_id_unsafe(
    conn: &Connection,
    viewer: Option<i64>,
    id: i64,
) -> Result<Option<Tracker>> {
    let sql = format!(
        "SELECT {} FROM {TRACKER_FROM} WHERE t.id = ?2",
        tracker_columns()
    );
    conn.query_row(&sql, params![viewer, id], tracker_from_row)
        .optional()
        .map_err(Error::from)
}

/// Batch form of [`tracker_by_id_unsafe`].
pub fn trackers_by_ids_unsafe(
    conn: &Connection,
    viewer: Option<i64>,
    ids: &[i64],
) -> Result<Vec<Option<Tracker>>> {
    let sql = format!(
        "SELECT {} FROM {TRACKER_FROM} WHERE t.id IN ({})",
        tracker_columns(),
        placeholders(2, ids.len()),
    );
    let mut args = vec![viewer_value(viewer)];
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
    let rows = query_trackers(conn, &sql, args)?;
    Ok(align(ids, rows, |t| t.id))
}

/// Lists trackers visible to the viewer in ascending id order, optionally
/// restricted to one owner.
pub fn list_trackers(
    conn: &Connection,
    viewer: Option<i64>,
    owner_id: Option<i64>,
    cursor: &Cursor,
) -> Result<Vec<Tracker>> {
    let sql = format!(
        "SELECT {} FROM {TRACKER_FROM}
         WHERE {} AND (?2 IS NULL OR t.owner_id = ?2) AND (?3 IS NULL OR t.id > ?3)
           AND (t.visibility = 'PUBLIC' OR t.owner_id = ?1 OR ua.id IS NOT NULL)
           AND (?4 IS NULL OR t.name LIKE ?4 ESCAPE '\\')
         ORDER BY t.id ASC LIMIT ?5",
        tracker_columns(),
        tracker_visible(),
    );
    let args = vec![
        viewer_value(viewer),
        owner_id.map_or(Value::Null, Value::Integer),
        cursor.next.map_or(Value::Null, Value::Integer),
        cursor.search_pattern().map_or(Value::Null, Value::Text),
        Value::Integer(cursor.fetch_limit()),
    ];
    query_trackers(conn, &sql, args)
}

#[derive(Debug, Clone)]
pub struct NewTracker {
    pub owner_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub default_access: Access,
    pub default_user_perms: Access,
}

pub fn create_tracker(conn: &Connection, tracker: &NewTracker) -> Result<i64> {
    let result = conn.execute(
        "INSERT INTO tracker (owner_id, created, updated, name, description, visibility,
             default_access, default_user_perms)
         VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            tracker.owner_id,
            now(),
            tracker.name,
            tracker.description,
            tracker.visibility,
            tracker.default_access,
            tracker.default_user_perms,
        ],
    );
    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::Conflict(format!(
                "a tracker named {} already exists",
                tracker.name
            )))
        }
        Err(e) => Err(Error::from(e)),
    }
}

pub fn update_tracker(
    conn: &Connection,
    id: i64,
    description: Option<&str>,
    visibility: Visibility,
    default_access: Access,
    default_user_perms: Access,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE tracker SET updated = ?1, description = ?2, visibility = ?3,
             default_access = ?4, default_user_perms = ?5
         WHERE id = ?6",
        params![
            now(),
            description,
            visibility,
            default_access,
            default_user_perms,
            id
        ],
    )?;
    if rows == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn delete_tracker(conn: &Connection, id: i64) -> Result<bool> {
    let rows = conn.execute("DELETE FROM tracker WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Claims the next scoped ticket id for a tracker.
pub fn allocate_ticket_id(conn: &Connection, tracker_id: i64) -> Result<i64> {
    conn.query_row(
        "UPDATE tracker SET next_ticket_id = next_ticket_id + 1, updated = ?2
         WHERE id = ?1 RETURNING next_ticket_id - 1",
        params![tracker_id, now()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(Error::NotFound)
}

/// Sets the import flag. Fails with a conflict if an import is already
/// running on the tracker.
pub fn mark_import_started(conn: &Connection, tracker_id: i64) -> Result<()> {
    let rows = conn.execute(
        "UPDATE tracker SET import_in_progress = 1 WHERE id = ?1 AND import_in_progress = 0",
        params![tracker_id],
    )?;
    if rows == 0 {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tracker WHERE id = ?1)",
            params![tracker_id],
            |row| row.get(0),
        )?;
        return Err(if exists {
            Error::Conflict("an import is already in progress for this tracker".into())
        } else {
            Error::NotFound
        });
    }
    Ok(())
}

pub fn clear_import_flag(conn: &Connection, tracker_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE tracker SET import_in_progress = 0 WHERE id = ?1",
        params![tracker_id],
    )?;
    Ok(())
}

pub fn set_next_ticket_id(conn: &Connection, tracker_id: i64, next: i64) -> Result<()> {
    conn.execute(
        "UPDATE tracker SET next_ticket_id = ?1, updated = ?2 WHERE id = ?3",
        params![next, now(), tracker_id],
    )?;
    Ok(())
}

// ACL operations

pub fn upsert_acl(
    conn: &Connection,
    tracker_id: i64,
    user_id: i64,
    permissions: Access,
) -> Result<TrackerAcl> {
    conn.query_row(
        "INSERT INTO user_access (created, tracker_id, user_id, permissions)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (tracker_id, user_id) DO UPDATE SET permissions = excluded.permissions
         RETURNING id, created, tracker_id, user_id, permissions",
        params![now(), tracker_id, user_id, permissions],
        acl_from_row,
    )
    .map_err(Error::from)
}

pub fn delete_acl(conn: &Connection, tracker_id: i64, user_id: i64) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM user_access WHERE tracker_id = ?1 AND user_id = ?2",
        params![tracker_id, user_id],
    )?;
    Ok(rows > 0)
}

pub fn list_acls(conn: &Connection, tracker_id: i64, cursor: &Cursor) -> Result<Vec<TrackerAcl>> {
    let mut stmt = conn.prepare(
        "SELECT id, created, tracker_id, user_id, permissions FROM user_access
         WHERE tracker_id = ?1 AND (?2 IS NULL OR id > ?2)
         ORDER BY id ASC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            params![tracker_id, cursor.next, cursor.fetch_limit()],
            acl_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn acl_from_row(row: &Row<'_>) -> rusqlite::Result<TrackerAcl> {
    Ok(TrackerAcl {
        id: row.get(0)?,
        created: parse_datetime(&row.get::<_, String>(1)?),
        tracker_id: row.get(2)?,
        user_id: row.get(3)?,
        permissions: row.get(4)?,
    })
}

// Label operations

const LABEL_COLUMNS: &str = "l.id, l.tracker_id, l.created, l.name, l.color, l.text_color";

pub(crate) fn label_from_row(row: &Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        tracker_id: row.get(1)?,
        created: parse_datetime(&row.get::<_, String>(2)?),
        name: row.get(3)?,
        background_color: row.get(4)?,
        foreground_color: row.get(5)?,
    })
}

pub fn create_label(
    conn: &Connection,
    tracker_id: i64,
    name: &str,
    background_color: &str,
    foreground_color: &str,
) -> Result<Label> {
    let result = conn.query_row(
        "INSERT INTO label (created, tracker_id, name, color, text_color)
         VALUES (?1, ?2, ?3, ?4, ?5)
         RETURNING id, tracker_id, created, name, color, text_color",
        params![now(), tracker_id, name, background_color, foreground_color],
        label_from_row,
    );
    match result {
        Ok(label) => Ok(label),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::Conflict(format!("a label named {name} already exists")))
        }
        Err(e) => Err(Error::from(e)),
    }
}

pub fn update_label(
    conn: &Connection,
    id: i64,
    name: &str,
    background_color: &str,
    foreground_color: &str,
) -> Result<Label> {
    conn.query_row(
        "UPDATE label SET name = ?1, color = ?2, text_color = ?3 WHERE id = ?4
         RETURNING id, tracker_id, created, name, color, text_color",
        params![name, background_color, foreground_color, id],
        label_from_row,
    )
    .optional()?
    .ok_or(Error::NotFound)
}

pub fn delete_label(conn: &Connection, id: i64) -> Result<bool> {
    let rows = conn.execute("DELETE FROM label WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Batch-loads labels by id, filtered through the owning tracker's visibility.
pub fn labels_by_ids(
    conn: &Connection,
    viewer: Option<i64>,
    ids: &[i64],
) -> Result<Vec<Option<Label>>> {
    let sql = format!(
        "SELECT {LABEL_COLUMNS} FROM {TRACKER_FROM} JOIN label l ON l.tracker_id = t.id
         WHERE l.id IN ({}) AND {}",
        placeholders(2, ids.len()),
        tracker_visible(),
    );
    let mut args = vec![viewer_value(viewer)];
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), label_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(align(ids, rows, |l| l.id))
}

pub fn label_by_name(conn: &Connection, tracker_id: i64, name: &str) -> Result<Option<Label>> {
    conn.query_row(
        &format!("SELECT {LABEL_COLUMNS} FROM label l WHERE l.tracker_id = ?1 AND l.name = ?2"),
        params![tracker_id, name],
        label_from_row,
    )
    .optional()
    .map_err(Error::from)
}

pub fn list_labels(conn: &Connection, tracker_id: i64, cursor: &Cursor) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LABEL_COLUMNS} FROM label l
         WHERE l.tracker_id = ?1 AND (?2 IS NULL OR l.id > ?2)
         ORDER BY l.id ASC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![tracker_id, cursor.next, cursor.fetch_limit()],
            label_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All labels of a tracker, for dumps.
pub fn all_labels(conn: &Connection, tracker_id: i64) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LABEL_COLUMNS} FROM label l WHERE l.tracker_id = ?1 ORDER BY l.id ASC"
    ))?;
    let rows = stmt
        .query_map(params![tracker_id], label_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
