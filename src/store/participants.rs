use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{align, now, parse_datetime, placeholders};
use crate::error::{Error, Result};
use crate::types::{Participant, ParticipantKind};

const PARTICIPANT_COLUMNS: &str =
    "p.id, p.created, p.participant_type, p.user_id, p.email, p.email_name, p.external_id, p.external_url";

pub(crate) fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    let kind: String = row.get(2)?;
    let kind = match kind.as_str() {
        "user" => ParticipantKind::User {
            user_id: row.get(3)?,
        },
        "email" => ParticipantKind::Email {
            address: row.get(4)?,
            name: row.get(5)?,
        },
        "external" => ParticipantKind::External {
            external_id: row.get(6)?,
            external_url: row.get(7)?,
        },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown participant type {other}").into(),
            ));
        }
    };
    Ok(Participant {
        id: row.get(0)?,
        created: parse_datetime(&row.get::<_, String>(1)?),
        kind,
    })
}

pub fn get_participant(conn: &Connection, id: i64) -> Result<Option<Participant>> {
    conn.query_row(
        &format!("SELECT {PARTICIPANT_COLUMNS} FROM participant p WHERE p.id = ?1"),
        params![id],
        participant_from_row,
    )
    .optional()
    .map_err(Error::from)
}

pub fn participants_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<Option<Participant>>> {
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM participant p WHERE p.id IN ({})",
        placeholders(1, ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), participant_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(align(ids, rows, |p| p.id))
}

/// Upserts USER participants for a batch of user ids in one statement.
///
/// Every id that names an existing user yields a participant; ids with no
/// user row resolve to `None`. Repeated calls return the same participant ids.
pub fn upsert_user_participants(
    conn: &Connection,
    user_ids: &[i64],
) -> Result<Vec<Option<Participant>>> {
    let requested = serde_json::to_string(user_ids)?;
    let mut stmt = conn.prepare(
        r#"INSERT INTO participant (created, participant_type, user_id)
           SELECT DISTINCT ?1, 'user', u.id
           FROM json_each(?2) r JOIN "user" u ON u.id = r.value
           WHERE true
           ON CONFLICT (user_id) DO UPDATE SET user_id = excluded.user_id
           RETURNING id, created, participant_type, user_id, email, email_name,
               external_id, external_url"#,
    )?;
    let rows = stmt
        .query_map(params![now(), requested], participant_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(align(user_ids, rows, |p| p.user_id().unwrap_or_default()))
}

pub fn upsert_user_participant(conn: &Connection, user_id: i64) -> Result<Participant> {
    upsert_user_participants(conn, &[user_id])?
        .pop()
        .flatten()
        .ok_or(Error::NotFound)
}

pub fn upsert_email_participant(
    conn: &Connection,
    address: &str,
    name: Option<&str>,
) -> Result<Participant> {
    conn.query_row(
        "INSERT INTO participant (created, participant_type, email, email_name)
         VALUES (?1, 'email', ?2, ?3)
         ON CONFLICT (email) DO UPDATE SET email_name = COALESCE(excluded.email_name, email_name)
         RETURNING id, created, participant_type, user_id, email, email_name,
             external_id, external_url",
        params![now(), address, name],
        participant_from_row,
    )
    .map_err(Error::from)
}

pub fn upsert_external_participant(
    conn: &Connection,
    external_id: &str,
    external_url: &str,
) -> Result<Participant> {
    conn.query_row(
        "INSERT INTO participant (created, participant_type, external_id, external_url)
         VALUES (?1, 'external', ?2, ?3)
         ON CONFLICT (external_id) DO UPDATE SET external_url = excluded.external_url
         RETURNING id, created, participant_type, user_id, email, email_name,
             external_id, external_url",
        params![now(), external_id, external_url],
        participant_from_row,
    )
    .map_err(Error::from)
}
