use std::fmt;

use serde::{Deserialize, Serialize};

/// Access represents a bitmask of capabilities on a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Access(u32);

impl Access {
    pub const NONE: Access = Access(0);
    pub const BROWSE: Access = Access(1 << 0); // 1
    pub const SUBMIT: Access = Access(1 << 1); // 2
    pub const COMMENT: Access = Access(1 << 2); // 4
    pub const EDIT: Access = Access(1 << 3); // 8
    pub const TRIAGE: Access = Access(1 << 4); // 16
    pub const ALL: Access = Access(0b1_1111);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds a mask, rejecting bits outside [`Access::ALL`].
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL.0 != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    /// Returns true if this bitmask contains every bit of `required`.
    #[must_use]
    pub const fn has(self, required: Access) -> bool {
        self.0 & required.0 == required.0
    }

    #[must_use]
    pub const fn union(self, other: Access) -> Access {
        Access(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Access) -> Access {
        Access(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn parse(s: &str) -> Option<Access> {
        match s {
            "browse" => Some(Self::BROWSE),
            "submit" => Some(Self::SUBMIT),
            "comment" => Some(Self::COMMENT),
            "edit" => Some(Self::EDIT),
            "triage" => Some(Self::TRIAGE),
            _ => None,
        }
    }

    pub fn parse_many<S: AsRef<str>>(strs: &[S]) -> Option<Access> {
        let mut result = Access::NONE;
        for s in strs {
            result = result.union(Self::parse(s.as_ref())?);
        }
        Some(result)
    }

    #[must_use]
    pub fn to_strings(self) -> Vec<&'static str> {
        let mut perms = Vec::new();
        if self.has(Self::BROWSE) {
            perms.push("browse");
        }
        if self.has(Self::SUBMIT) {
            perms.push("submit");
        }
        if self.has(Self::COMMENT) {
            perms.push("comment");
        }
        if self.has(Self::EDIT) {
            perms.push("edit");
        }
        if self.has(Self::TRIAGE) {
            perms.push("triage");
        }
        perms
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_strings().join(", "))
    }
}

impl From<Access> for i64 {
    fn from(a: Access) -> Self {
        i64::from(a.0)
    }
}

impl rusqlite::types::FromSql for Access {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let bits = i64::column_result(value)?;
        u32::try_from(bits)
            .ok()
            .and_then(Access::from_bits)
            .ok_or(rusqlite::types::FromSqlError::OutOfRange(bits))
    }
}

impl rusqlite::types::ToSql for Access {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(i64::from(self.0)))
    }
}

/// Computes a user's effective access on a tracker.
///
/// The owner always has [`Access::ALL`]. Otherwise an ACL row wins over the
/// tracker defaults, which differ for logged-in and anonymous viewers.
#[must_use]
pub fn effective_access(
    viewer_id: Option<i64>,
    owner_id: i64,
    acl: Option<Access>,
    default_user_perms: Access,
    default_access: Access,
) -> Access {
    match viewer_id {
        Some(id) if id == owner_id => Access::ALL,
        Some(_) => acl.unwrap_or(default_user_perms),
        None => default_access,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_has() {
        let a = Access::BROWSE.union(Access::COMMENT);
        assert!(a.has(Access::BROWSE));
        assert!(a.has(Access::COMMENT));
        assert!(!a.has(Access::TRIAGE));
        assert!(Access::ALL.has(a));
    }

    #[test]
    fn test_from_bits_rejects_unknown() {
        assert_eq!(Access::from_bits(31), Some(Access::ALL));
        assert_eq!(Access::from_bits(32), None);
    }

    #[test]
    fn test_parse_many() {
        let a = Access::parse_many(&["browse", "submit"]).unwrap();
        assert_eq!(a.bits(), 3);
        assert_eq!(Access::parse_many(&["browse", "admin"]), None);
        assert_eq!(a.to_strings(), vec!["browse", "submit"]);
    }

    #[test]
    fn test_effective_access() {
        let defaults = Access::BROWSE.union(Access::SUBMIT).union(Access::COMMENT);
        assert_eq!(
            effective_access(Some(1), 1, Some(Access::BROWSE), defaults, Access::BROWSE),
            Access::ALL
        );
        assert_eq!(
            effective_access(Some(2), 1, Some(Access::TRIAGE), defaults, Access::BROWSE),
            Access::TRIAGE
        );
        assert_eq!(
            effective_access(Some(2), 1, None, defaults, Access::BROWSE),
            defaults
        );
        assert_eq!(
            effective_access(None, 1, None, defaults, Access::BROWSE),
            Access::BROWSE
        );
    }
}
