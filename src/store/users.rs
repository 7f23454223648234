use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{align, format_datetime, now, parse_datetime, placeholders};
use crate::error::{Error, Result};
use crate::types::{Token, User};

pub(crate) const USER_COLUMNS: &str = "u.id, u.created, u.updated, u.username, u.email, \
     u.user_type, u.url, u.location, u.bio, u.suspension_notice";

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        created: parse_datetime(&row.get::<_, String>(1)?),
        updated: parse_datetime(&row.get::<_, String>(2)?),
        username: row.get(3)?,
        email: row.get(4)?,
        user_type: row.get(5)?,
        url: row.get(6)?,
        location: row.get(7)?,
        bio: row.get(8)?,
        suspension_notice: row.get(9)?,
    })
}

/// Profile fields as supplied by the identity service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub user_type: String,
    pub url: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub suspension_notice: Option<String>,
}

pub fn create_user(conn: &Connection, user: &NewUser) -> Result<User> {
    let ts = now();
    let result = conn.execute(
        r#"INSERT INTO "user" (created, updated, username, email, user_type, url, location, bio, suspension_notice)
           VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        params![
            ts,
            user.username,
            user.email,
            user.user_type,
            user.url,
            user.location,
            user.bio,
            user.suspension_notice,
        ],
    );

    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(Error::Conflict(format!("user {} already exists", user.username)));
        }
        Err(e) => return Err(Error::from(e)),
    }

    get_user(conn, conn.last_insert_rowid())?
        .ok_or_else(|| Error::invariant("inserted user vanished"))
}

/// Overwrites profile fields of an existing user, keyed by username.
pub fn update_user_profile(conn: &Connection, user: &NewUser) -> Result<bool> {
    let rows = conn.execute(
        r#"UPDATE "user" SET updated = ?1, email = ?2, user_type = ?3, url = ?4,
               location = ?5, bio = ?6, suspension_notice = ?7
           WHERE username = ?8"#,
        params![
            now(),
            user.email,
            user.user_type,
            user.url,
            user.location,
            user.bio,
            user.suspension_notice,
            user.username,
        ],
    )?;
    Ok(rows > 0)
}

pub fn get_user(conn: &Connection, id: i64) -> Result<Option<User>> {
    conn.query_row(
        &format!(r#"SELECT {USER_COLUMNS} FROM "user" u WHERE u.id = ?1"#),
        params![id],
        user_from_row,
    )
    .optional()
    .map_err(Error::from)
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    conn.query_row(
        &format!(r#"SELECT {USER_COLUMNS} FROM "user" u WHERE u.username = ?1"#),
        params![username],
        user_from_row,
    )
    .optional()
    .map_err(Error::from)
}

pub fn users_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<Option<User>>> {
    let sql = format!(
        r#"SELECT {USER_COLUMNS} FROM "user" u WHERE u.id IN ({})"#,
        placeholders(1, ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(align(ids, rows, |u| u.id))
}

pub fn users_by_usernames(conn: &Connection, names: &[String]) -> Result<Vec<Option<User>>> {
    let sql = format!(
        r#"SELECT {USER_COLUMNS} FROM "user" u WHERE u.username IN ({})"#,
        placeholders(1, names.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(names.iter()), user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(align(names, rows, |u| u.username.clone()))
}

// Token operations

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        token_lookup: row.get(2)?,
        user_id: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        expires_at: row.get::<_, Option<String>>(5)?.map(|s| parse_datetime(&s)),
        last_used_at: row.get::<_, Option<String>>(6)?.map(|s| parse_datetime(&s)),
    })
}

pub fn create_token(conn: &Connection, token: &Token) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO token (id, token_hash, token_lookup, user_id, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            token.id,
            token.token_hash,
            token.token_lookup,
            token.user_id,
            format_datetime(&token.created_at),
            token.expires_at.as_ref().map(format_datetime),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::TokenLookupCollision)
        }
        Err(e) => Err(Error::from(e)),
    }
}

pub fn get_token_by_lookup(conn: &Connection, lookup: &str) -> Result<Option<Token>> {
    conn.query_row(
        "SELECT id, token_hash, token_lookup, user_id, created_at, expires_at, last_used_at
         FROM token WHERE token_lookup = ?1",
        params![lookup],
        token_from_row,
    )
    .optional()
    .map_err(Error::from)
}

pub fn update_token_last_used(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE token SET last_used_at = ?1 WHERE id = ?2",
        params![format_datetime(&Utc::now()), id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.to_string(),
            email: format!("{name}@example.org"),
            user_type: "active_paying".to_string(),
            ..NewUser::default()
        }
    }

    #[test]
    fn test_user_crud() {
        let store = store();
        let conn = store.connection();

        let user = create_user(&conn, &new_user("alice")).unwrap();
        assert_eq!(user.canonical_name(), "~alice");

        let fetched = get_user_by_username(&conn, "alice").unwrap().unwrap();
        assert_eq!(fetched.id, user.id);

        let duplicate = create_user(&conn, &new_user("alice"));
        assert!(matches!(duplicate, Err(Error::Conflict(_))));

        let mut profile = new_user("alice");
        profile.bio = Some("hello".into());
        assert!(update_user_profile(&conn, &profile).unwrap());
        let fetched = get_user(&conn, user.id).unwrap().unwrap();
        assert_eq!(fetched.bio.as_deref(), Some("hello"));
    }

    #[test]
    fn test_users_by_usernames_preserves_order() {
        let store = store();
        let conn = store.connection();
        create_user(&conn, &new_user("a")).unwrap();
        create_user(&conn, &new_user("b")).unwrap();

        let names = vec!["b".to_string(), "missing".to_string(), "a".to_string()];
        let users = users_by_usernames(&conn, &names).unwrap();
        assert_eq!(users[0].as_ref().unwrap().username, "b");
        assert!(users[1].is_none());
        assert_eq!(users[2].as_ref().unwrap().username, "a");
    }

    #[test]
    fn test_token_lookup_collision() {
        let store = store();
        let conn = store.connection();
        let user = create_user(&conn, &new_user("alice")).unwrap();

        let token = Token {
            id: "token-1".to_string(),
            token_hash: "hash1".to_string(),
            token_lookup: "lookup12".to_string(),
            user_id: user.id,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        };
        create_token(&conn, &token).unwrap();

        let second = Token {
            id: "token-2".to_string(),
            ..token
        };
        assert!(matches!(
            create_token(&conn, &second),
            Err(Error::TokenLookupCollision)
        ));
    }
}
