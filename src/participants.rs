//! Participant resolution, including federated user lookup.
//!
//! Usernames that have no local user row are fetched from the identity
//! service in one query per batch. Each newly imported user gets a
//! profile-update webhook registered with the identity service so later
//! profile changes flow back to us.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::StatusCode;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::signature::{NONCE_HEADER, PayloadSigner, SIGNATURE_HEADER};
use crate::store::participants as store;
use crate::store::users::{self, NewUser};
use crate::types::Participant;

const IDENTITY_TIMEOUT: Duration = Duration::from_secs(30);

/// The identity service that owns user profiles.
///
/// Calls are blocking; they run on the same worker thread as the database
/// transaction that needs them.
pub trait IdentityService: Send + Sync {
    /// Fetches profiles for usernames. Unknown usernames are omitted.
    fn fetch_profiles(&self, usernames: &[String]) -> Result<Vec<NewUser>>;

    /// Asks the identity service to notify us of profile changes for a user.
    fn register_profile_webhook(&self, username: &str) -> Result<()>;
}

/// Usernames the identity service accepts.
fn is_sane_username(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Query alias for a username: `_` followed by the hex sha256 of the name.
#[must_use]
pub fn username_alias(name: &str) -> String {
    format!("_{}", hex::encode(Sha256::digest(name.as_bytes())))
}

fn profiles_query(usernames: &[String]) -> String {
    let fields = "username created updated email userType url location bio suspensionNotice";
    let body = usernames
        .iter()
        .map(|name| format!("  {}: userByName(username: \"{name}\") {{ {fields} }}", username_alias(name)))
        .collect::<Vec<_>>()
        .join("\n");
    format!("query {{\n{body}\n}}")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteProfile {
    username: String,
    email: String,
    #[serde(default)]
    user_type: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    bio: Option<String>,
    #[serde(default)]
    suspension_notice: Option<String>,
}

impl From<RemoteProfile> for NewUser {
    fn from(profile: RemoteProfile) -> Self {
        NewUser {
            username: profile.username,
            email: profile.email,
            user_type: profile
                .user_type
                .map(|t| t.to_lowercase())
                .unwrap_or_else(|| "active_non_paying".to_string()),
            url: profile.url,
            location: profile.location,
            bio: profile.bio,
            suspension_notice: profile.suspension_notice,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

/// The claim carried by an internal credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InternalAuth {
    /// Username the call acts as; empty for service-level calls.
    pub name: String,
    pub node_id: String,
    pub issued: i64,
}

impl InternalAuth {
    /// Builds the `Authorization` header value and its signature headers.
    pub fn header(&self, signer: &dyn PayloadSigner) -> Result<(String, String, String)> {
        let claim = serde_json::to_vec(self)?;
        let signed = signer.sign(&claim);
        Ok((
            format!("Internal {}", STANDARD.encode(&claim)),
            signed.nonce,
            signed.signature,
        ))
    }

    /// Parses and verifies an `Authorization: Internal ...` header.
    pub fn verify(
        header: &str,
        nonce: &str,
        signature: &str,
        signer: &dyn PayloadSigner,
    ) -> Result<Self> {
        let encoded = header
            .strip_prefix("Internal ")
            .ok_or(Error::AccessDenied)?;
        let claim = STANDARD.decode(encoded).map_err(|_| Error::AccessDenied)?;
        if !signer.verify(&claim, nonce, signature) {
            return Err(Error::AccessDenied);
        }
        serde_json::from_slice(&claim).map_err(|_| Error::AccessDenied)
    }
}

/// HTTP client for the identity service.
pub struct MetaClient {
    meta_origin: String,
    origin: String,
    signer: Arc<dyn PayloadSigner>,
    client: reqwest::blocking::Client,
}

impl MetaClient {
    pub fn new(meta_origin: &str, origin: &str, signer: Arc<dyn PayloadSigner>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(IDENTITY_TIMEOUT)
            .build()?;
        Ok(Self {
            meta_origin: meta_origin.trim_end_matches('/').to_string(),
            origin: origin.trim_end_matches('/').to_string(),
            signer,
            client,
        })
    }

    fn request(&self, path: &str, as_user: &str) -> Result<reqwest::blocking::RequestBuilder> {
        let auth = InternalAuth {
            name: as_user.to_string(),
            node_id: self.origin.clone(),
            issued: Utc::now().timestamp(),
        };
        let (authorization, nonce, signature) = auth.header(self.signer.as_ref())?;
        Ok(self
            .client
            .post(format!("{}{path}", self.meta_origin))
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(NONCE_HEADER, nonce)
            .header(SIGNATURE_HEADER, signature))
    }
}

impl IdentityService for MetaClient {
    fn fetch_profiles(&self, usernames: &[String]) -> Result<Vec<NewUser>> {
        let names: Vec<String> = usernames
            .iter()
            .filter(|name| is_sane_username(name))
            .cloned()
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .request("/query", "")?
            .json(&serde_json::json!({ "query": profiles_query(&names) }))
            .send()?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "identity service returned {} for profile query",
                response.status()
            )));
        }
        let body: QueryResponse = response.json()?;
        if let Some(errors) = body.errors {
            tracing::warn!(%errors, "identity service reported query errors");
        }
        let mut data = body.data.unwrap_or_default();

        let mut profiles = Vec::new();
        for name in &names {
            match data.remove(&username_alias(name)) {
                Some(serde_json::Value::Null) | None => {
                    tracing::debug!(username = %name, "no such user on identity service");
                }
                Some(value) => profiles.push(serde_json::from_value::<RemoteProfile>(value)?.into()),
            }
        }
        Ok(profiles)
    }

    fn register_profile_webhook(&self, username: &str) -> Result<()> {
        let response = self
            .request("/api/user/webhooks", username)?
            .json(&serde_json::json!({
                "url": format!("{}/webhook/profile-update", self.origin),
                "events": ["profile:update"],
            }))
            .send()?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::Upstream(format!(
                "profile webhook registration for {username} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Resolves the three participant variants, federating unknown usernames.
#[derive(Clone)]
pub struct ParticipantResolver {
    identity: Arc<dyn IdentityService>,
}

impl ParticipantResolver {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }

    pub fn by_user_ids(&self, conn: &Connection, user_ids: &[i64]) -> Result<Vec<Option<Participant>>> {
        store::upsert_user_participants(conn, user_ids)
    }

    pub fn by_email(&self, conn: &Connection, address: &str, name: Option<&str>) -> Result<Participant> {
        store::upsert_email_participant(conn, address, name)
    }

    pub fn by_external(&self, conn: &Connection, external_id: &str, external_url: &str) -> Result<Participant> {
        store::upsert_external_participant(conn, external_id, external_url)
    }

    /// Resolves usernames to USER participants in input order.
    ///
    /// Missing local users are fetched from the identity service and stored.
    /// Usernames unknown there too resolve to `None`.
    pub fn by_usernames(&self, conn: &Connection, usernames: &[String]) -> Result<Vec<Option<Participant>>> {
        let local = users::users_by_usernames(conn, usernames)?;

        let mut seen = HashSet::new();
        let missing: Vec<String> = usernames
            .iter()
            .zip(&local)
            .filter(|(_, user)| user.is_none())
            .map(|(name, _)| name.clone())
            .filter(|name| seen.insert(name.clone()))
            .collect();

        if !missing.is_empty() {
            let profiles = self.identity.fetch_profiles(&missing)?;
            for profile in &profiles {
                // The identity service is authoritative for the spelling.
                if !missing.contains(&profile.username) {
                    tracing::warn!(username = %profile.username, "identity service returned an unrequested user");
                    continue;
                }
                users::create_user(conn, profile)?;
                self.identity.register_profile_webhook(&profile.username)?;
                tracing::info!(username = %profile.username, "imported user from identity service");
            }
        }

        let resolved = if missing.is_empty() {
            local
        } else {
            users::users_by_usernames(conn, usernames)?
        };
        let user_ids: Vec<i64> = resolved.iter().flatten().map(|u| u.id).collect();
        let mut participants = store::upsert_user_participants(conn, &user_ids)?.into_iter();

        Ok(resolved
            .into_iter()
            .map(|user| user.and_then(|_| participants.next().flatten()))
            .collect())
    }

    pub fn by_username(&self, conn: &Connection, username: &str) -> Result<Option<Participant>> {
        Ok(self
            .by_usernames(conn, &[username.to_string()])?
            .pop()
            .flatten())
    }
}

/// Identity service for deployments and tests that never federate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFederation;

impl IdentityService for NoFederation {
    fn fetch_profiles(&self, _usernames: &[String]) -> Result<Vec<NewUser>> {
        Ok(Vec::new())
    }

    fn register_profile_webhook(&self, _username: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::signature::HmacSigner;
    use crate::store::SqliteStore;
    use crate::types::ParticipantKind;

    #[derive(Default)]
    struct FakeIdentity {
        known: Vec<String>,
        registered: Mutex<Vec<String>>,
        fail_registration: bool,
    }

    impl IdentityService for FakeIdentity {
        fn fetch_profiles(&self, usernames: &[String]) -> Result<Vec<NewUser>> {
            Ok(usernames
                .iter()
                .filter(|name| self.known.contains(name))
                .map(|name| NewUser {
                    username: name.clone(),
                    email: format!("{name}@meta.example.org"),
                    user_type: "active_paying".into(),
                    ..NewUser::default()
                })
                .collect())
        }

        fn register_profile_webhook(&self, username: &str) -> Result<()> {
            if self.fail_registration {
                return Err(Error::Upstream("status 500".into()));
            }
            self.registered.lock().unwrap().push(username.to_string());
            Ok(())
        }
    }

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn test_alias_is_prefixed_sha256() {
        let alias = username_alias("alice");
        assert!(alias.starts_with('_'));
        assert_eq!(alias.len(), 65);
        assert!(profiles_query(&["alice".into()]).contains(&alias));
    }

    #[test]
    fn test_federates_missing_users_once() {
        let store = store();
        let identity = Arc::new(FakeIdentity {
            known: vec!["remote".into()],
            ..FakeIdentity::default()
        });
        let resolver = ParticipantResolver::new(identity.clone());
        let conn = store.connection();
        users::create_user(
            &conn,
            &NewUser {
                username: "local".into(),
                email: "local@example.org".into(),
                ..NewUser::default()
            },
        )
        .unwrap();

        let names = vec!["remote".to_string(), "ghost".to_string(), "local".to_string()];
        let resolved = resolver.by_usernames(&conn, &names).unwrap();
        assert!(resolved[0].is_some());
        assert!(resolved[1].is_none());
        assert!(resolved[2].is_some());
        assert_eq!(*identity.registered.lock().unwrap(), vec!["remote".to_string()]);

        let again = resolver.by_usernames(&conn, &names[..1]).unwrap();
        assert_eq!(again[0].as_ref().unwrap().id, resolved[0].as_ref().unwrap().id);
        assert_eq!(identity.registered.lock().unwrap().len(), 1);

        let remote = users::get_user_by_username(&conn, "remote").unwrap().unwrap();
        assert_eq!(
            again[0].as_ref().unwrap().kind,
            ParticipantKind::User { user_id: remote.id }
        );
    }

    #[test]
    fn test_registration_failure_is_fatal() {
        let store = store();
        let resolver = ParticipantResolver::new(Arc::new(FakeIdentity {
            known: vec!["remote".into()],
            fail_registration: true,
            ..FakeIdentity::default()
        }));
        let conn = store.connection();
        let result = resolver.by_usernames(&conn, &["remote".to_string()]);
        assert!(matches!(result, Err(Error::Upstream(_))));
    }

    #[test]
    fn test_internal_auth_round_trip() {
        let signer = HmacSigner::new(b"internal-key-for-tests");
        let auth = InternalAuth {
            name: "alice".into(),
            node_id: "https://todo.example.org".into(),
            issued: 1,
        };
        let (header, nonce, signature) = auth.header(&signer).unwrap();
        let verified = InternalAuth::verify(&header, &nonce, &signature, &signer).unwrap();
        assert_eq!(verified, auth);

        let other = HmacSigner::new(b"another-key");
        assert!(InternalAuth::verify(&header, &nonce, &signature, &other).is_err());
    }
}
