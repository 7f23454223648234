use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_PAGE_SIZE: i64 = 25;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Keyset pagination state handed to clients as an opaque string.
///
/// `next` is the id of the last row the client has already seen; list
/// queries continue strictly after it in their own id order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            count: DEFAULT_PAGE_SIZE,
            next: None,
            search: None,
        }
    }
}

impl Cursor {
    #[must_use]
    pub fn with_count(count: i64) -> Self {
        Self {
            count: count.clamp(1, MAX_PAGE_SIZE),
            ..Self::default()
        }
    }

    /// Decodes a client-supplied cursor; `None` starts from the beginning.
    pub fn from_param(param: Option<&str>) -> Result<Self> {
        let Some(encoded) = param.filter(|s| !s.is_empty()) else {
            return Ok(Self::default());
        };
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| Error::Invalid("malformed cursor".into()))?;
        let mut cursor: Cursor =
            serde_json::from_slice(&raw).map_err(|_| Error::Invalid("malformed cursor".into()))?;
        cursor.count = cursor.count.clamp(1, MAX_PAGE_SIZE);
        Ok(cursor)
    }

    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a struct of integers and strings cannot fail.
        let raw = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Row limit to request from the database: one extra row detects more pages.
    #[must_use]
    pub fn fetch_limit(&self) -> i64 {
        self.count + 1
    }

    /// LIKE pattern for the search term, if any.
    #[must_use]
    pub fn search_pattern(&self) -> Option<String> {
        self.search
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.replace('%', "\\%").replace('_', "\\_")))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T: Serialize> {
    pub results: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Trims a `count + 1` result set and computes the continuation cursor.
pub fn paginate<T, F>(mut rows: Vec<T>, cursor: &Cursor, get_id: F) -> Page<T>
where
    T: Serialize,
    F: Fn(&T) -> i64,
{
    let limit = usize::try_from(cursor.count).unwrap_or(0);
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next = if has_more {
        rows.last().map(|row| {
            Cursor {
                count: cursor.count,
                next: Some(get_id(row)),
                search: cursor.search.clone(),
            }
            .encode()
        })
    } else {
        None
    };
    Page {
        results: rows,
        cursor: next,
    }
}
