use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Implements integer-coded SQL conversion for a fieldless enum.
macro_rules! int_coded {
    ($ty:ident { $($variant:ident = $code:literal => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            #[must_use]
            pub const fn code(self) -> i64 {
                match self {
                    $($ty::$variant => $code),+
                }
            }

            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some($ty::$variant),)+
                    _ => None,
                }
            }

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($name => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let code = i64::column_result(value)?;
                $ty::from_code(code).ok_or(FromSqlError::OutOfRange(code))
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.code()))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    #[default]
    Reported,
    Confirmed,
    InProgress,
    Pending,
    Resolved,
}

int_coded!(TicketStatus {
    Reported = 0 => "REPORTED",
    Confirmed = 1 => "CONFIRMED",
    InProgress = 2 => "IN_PROGRESS",
    Pending = 4 => "PENDING",
    Resolved = 8 => "RESOLVED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketResolution {
    #[default]
    Unresolved,
    Fixed,
    Implemented,
    WontFix,
    ByDesign,
    Invalid,
    Duplicate,
    NotOurBug,
}

int_coded!(TicketResolution {
    Unresolved = 0 => "UNRESOLVED",
    Fixed = 1 => "FIXED",
    Implemented = 2 => "IMPLEMENTED",
    WontFix = 4 => "WONT_FIX",
    ByDesign = 8 => "BY_DESIGN",
    Invalid = 16 => "INVALID",
    Duplicate = 32 => "DUPLICATE",
    NotOurBug = 64 => "NOT_OUR_BUG",
});

/// Verification state of signed user-authored content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authenticity {
    #[default]
    Authentic,
    Unauthenticated,
    Tampered,
}

int_coded!(Authenticity {
    Authentic = 0 => "AUTHENTIC",
    Unauthenticated = 1 => "UNAUTHENTICATED",
    Tampered = 2 => "TAMPERED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

impl Visibility {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Visibility::Public => "PUBLIC",
            Visibility::Unlisted => "UNLISTED",
            Visibility::Private => "PRIVATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUBLIC" => Some(Visibility::Public),
            "UNLISTED" => Some(Visibility::Unlisted),
            "PRIVATE" => Some(Visibility::Private),
            _ => None,
        }
    }
}

impl FromSql for Visibility {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Visibility::parse(s).ok_or_else(|| FromSqlError::Other(format!("visibility {s}").into()))
    }
}

impl ToSql for Visibility {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.name()))
    }
}

/// Bitmask of event kinds recorded on a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(u32);

impl EventType {
    pub const CREATED: EventType = EventType(1);
    pub const COMMENT: EventType = EventType(2);
    pub const STATUS_CHANGE: EventType = EventType(4);
    pub const LABEL_ADDED: EventType = EventType(8);
    pub const LABEL_REMOVED: EventType = EventType(16);
    pub const ASSIGNED_USER: EventType = EventType(32);
    pub const UNASSIGNED_USER: EventType = EventType(64);
    pub const USER_MENTIONED: EventType = EventType(128);
    pub const TICKET_MENTIONED: EventType = EventType(256);

    const NAMES: [(EventType, &'static str); 9] = [
        (Self::CREATED, "created"),
        (Self::COMMENT, "comment"),
        (Self::STATUS_CHANGE, "status_change"),
        (Self::LABEL_ADDED, "label_added"),
        (Self::LABEL_REMOVED, "label_removed"),
        (Self::ASSIGNED_USER, "assigned_user"),
        (Self::UNASSIGNED_USER, "unassigned_user"),
        (Self::USER_MENTIONED, "user_mentioned"),
        (Self::TICKET_MENTIONED, "ticket_mentioned"),
    ];

    const KNOWN: u32 = 0b1_1111_1111;

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits == 0 || bits & !Self::KNOWN != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    #[must_use]
    pub const fn contains(self, other: EventType) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: EventType) -> EventType {
        EventType(self.0 | other.0)
    }

    /// Parses the named forms used in tracker dumps. Any unknown name fails.
    pub fn parse_names<S: AsRef<str>>(names: &[S]) -> Option<EventType> {
        let mut bits = 0;
        for name in names {
            let (ty, _) = Self::NAMES.iter().find(|(_, n)| *n == name.as_ref())?;
            bits |= ty.0;
        }
        Self::from_bits(bits)
    }

    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(ty, _)| self.contains(*ty))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for EventType {
    type Output = EventType;

    fn bitor(self, rhs: EventType) -> EventType {
        self.union(rhs)
    }
}

impl FromSql for EventType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let bits = i64::column_result(value)?;
        u32::try_from(bits)
            .ok()
            .and_then(EventType::from_bits)
            .ok_or(FromSqlError::OutOfRange(bits))
    }
}

impl ToSql for EventType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in TicketStatus::ALL {
            assert_eq!(TicketStatus::from_code(status.code()), Some(*status));
            assert_eq!(TicketStatus::parse(status.name()), Some(*status));
        }
        for resolution in TicketResolution::ALL {
            assert_eq!(TicketResolution::from_code(resolution.code()), Some(*resolution));
        }
        assert_eq!(TicketStatus::from_code(3), None);
    }

    #[test]
    fn test_serde_names_match_codes() {
        let json = serde_json::to_string(&TicketResolution::WontFix).unwrap();
        assert_eq!(json, "\"WONT_FIX\"");
        let status: TicketStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(status, TicketStatus::InProgress);
    }

    #[test]
    fn test_event_type_names() {
        let ty = EventType::parse_names(&["created", "comment"]).unwrap();
        assert_eq!(ty, EventType::CREATED | EventType::COMMENT);
        assert_eq!(ty.names(), vec!["created", "comment"]);
        assert_eq!(EventType::parse_names(&["created", "bogus"]), None);
        let empty: [&str; 0] = [];
        assert_eq!(EventType::parse_names(&empty), None);
    }

    #[test]
    fn test_event_type_rejects_zero() {
        assert_eq!(EventType::from_bits(0), None);
        assert_eq!(EventType::from_bits(512), None);
    }
}
