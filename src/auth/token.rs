use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::Utc;
use rand::Rng;
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::store::users;
use crate::types::Token;

const ARGON2_MEMORY: u32 = 64 * 1024; // 64KB
const ARGON2_ITERATIONS: u32 = 1;
const ARGON2_PARALLELISM: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

const TOKEN_PREFIX: &str = "bugnest";
const LOOKUP_LENGTH: usize = 8;
const SECRET_LENGTH: usize = 24;
const SECRET_BYTES: usize = 12;

pub struct TokenGenerator {
    argon2: Argon2<'static>,
}

impl TokenGenerator {
    pub fn new() -> Result<Self> {
        let params = Params::new(
            ARGON2_MEMORY,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .map_err(|e| Error::Config(format!("invalid argon2 params: {e}")))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Generates a new token with the format: bugnest_<lookup>_<secret>
    /// Returns (raw_token, lookup, hash)
    pub fn generate(&self) -> Result<(String, String, String)> {
        let lookup = generate_lookup();
        let secret = generate_secret();
        let raw_token = format!("{TOKEN_PREFIX}_{lookup}_{secret}");
        let hash = self.hash(&raw_token)?;
        Ok((raw_token, lookup, hash))
    }

    pub fn hash(&self, token: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(token.as_bytes(), &salt)
            .map_err(|e| Error::Config(format!("failed to hash token: {e}")))?;
        Ok(hash.to_string())
    }

    pub fn verify(&self, token: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| Error::Config(format!("invalid hash format: {e}")))?;

        match self.argon2.verify_password(token.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Config(format!("failed to verify token: {e}"))),
        }
    }
}

/// First 8 chars of a UUID.
fn generate_lookup() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.to_string()[..LOOKUP_LENGTH].to_string()
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)[..SECRET_LENGTH].to_string()
}

/// Parses a token string into its components (lookup, secret)
pub fn parse_token(token: &str) -> Result<(String, String)> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or(Error::InvalidTokenFormat)?;
    let (lookup, secret) = rest.split_once('_').ok_or(Error::InvalidTokenFormat)?;

    if lookup.len() != LOOKUP_LENGTH || secret.len() != SECRET_LENGTH || secret.contains('_') {
        return Err(Error::InvalidTokenFormat);
    }

    Ok((lookup.to_string(), secret.to_string()))
}

/// Issues a token bound to `user_id` and returns the raw token. Only the
/// hash is stored.
pub fn issue_token(conn: &Connection, user_id: i64) -> Result<String> {
    let generator = TokenGenerator::new()?;
    let (raw_token, lookup, hash) = generator.generate()?;
    users::create_token(
        conn,
        &Token {
            id: uuid::Uuid::new_v4().to_string(),
            token_hash: hash,
            token_lookup: lookup,
            user_id,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        },
    )?;
    tracing::info!(user = user_id, "issued api token");
    Ok(raw_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::store::users::NewUser;

    #[test]
    fn test_token_generation_format() {
        let generator = TokenGenerator::new().unwrap();
        let (token, lookup, _hash) = generator.generate().unwrap();

        assert!(token.starts_with("bugnest_"));
        assert_eq!(lookup.len(), 8);

        let parts: Vec<&str> = token.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "bugnest");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 24);
    }

    #[test]
    fn test_token_verification() {
        let generator = TokenGenerator::new().unwrap();
        let (token, _, hash) = generator.generate().unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(generator.verify(&token, &hash).unwrap());

        let wrong_token = format!("{}_wrong", &token[..token.len() - 5]);
        assert!(!generator.verify(&wrong_token, &hash).unwrap());
    }

    #[test]
    fn test_parse_token() {
        let (lookup, secret) = parse_token("bugnest_12345678_123456789012345678901234").unwrap();
        assert_eq!(lookup, "12345678");
        assert_eq!(secret, "123456789012345678901234");

        assert!(parse_token("invalid_12345678_123456789012345678901234").is_err());
        assert!(parse_token("bugnest_12345678").is_err());
        assert!(parse_token("bugnest_1234_123456789012345678901234").is_err());
    }

    #[test]
    fn test_issue_token_stores_hash_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let conn = store.connection();
        let user = users::create_user(
            &conn,
            &NewUser {
                username: "u1".into(),
                email: "u1@example.org".into(),
                ..NewUser::default()
            },
        )
        .unwrap();

        let raw = issue_token(&conn, user.id).unwrap();
        let (lookup, _) = parse_token(&raw).unwrap();
        let stored = users::get_token_by_lookup(&conn, &lookup).unwrap().unwrap();
        assert_eq!(stored.user_id, user.id);
        assert_ne!(stored.token_hash, raw);
        assert!(TokenGenerator::new().unwrap().verify(&raw, &stored.token_hash).unwrap());
    }
}
