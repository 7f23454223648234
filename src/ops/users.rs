use rusqlite::Connection;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::store::users::{self, NewUser};
use crate::types::User;

/// Body of the identity service's `profile:update` webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileUpdate {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub suspension_notice: Option<String>,
}

/// Applies a profile update to the local copy of a user. Users we never
/// imported are ignored and yield `None`.
pub fn apply_profile_update(conn: &Connection, update: &ProfileUpdate) -> Result<Option<User>> {
    let Some(existing) = users::get_user_by_username(conn, &update.name)? else {
        tracing::debug!(username = %update.name, "ignoring profile update for unknown user");
        return Ok(None);
    };
    if update.email.trim().is_empty() {
        return Err(Error::Invalid("email cannot be empty".into()));
    }
    users::update_user_profile(
        conn,
        &NewUser {
            username: existing.username.clone(),
            email: update.email.clone(),
            user_type: update
                .user_type
                .clone()
                .unwrap_or_else(|| existing.user_type.clone()),
            url: update.url.clone(),
            location: update.location.clone(),
            bio: update.bio.clone(),
            suspension_notice: update.suspension_notice.clone(),
        },
    )?;
    tracing::info!(username = %existing.username, "applied profile update");
    users::get_user(conn, existing.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{store, user};

    #[test]
    fn test_profile_update_overwrites_fields() {
        let store = store();
        user(&store, "u1");
        let update: ProfileUpdate = serde_json::from_str(
            r#"{"name": "u1", "email": "new@example.org", "bio": "hello", "user_type": "admin"}"#,
        )
        .unwrap();
        let updated = apply_profile_update(&store.connection(), &update)
            .unwrap()
            .unwrap();
        assert_eq!(updated.email, "new@example.org");
        assert_eq!(updated.bio.as_deref(), Some("hello"));
        assert_eq!(updated.user_type, "admin");

        let unknown = ProfileUpdate {
            name: "ghost".into(),
            ..update
        };
        assert!(apply_profile_update(&store.connection(), &unknown).unwrap().is_none());
    }
}
