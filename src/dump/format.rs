//! The tracker dump file: gzipped JSON.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{TicketResolution, TicketStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpUser {
    pub canonical_name: String,
    pub name: String,
}

impl DumpUser {
    pub fn new(username: &str) -> Self {
        Self {
            canonical_name: format!("~{username}"),
            name: username.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DumpParticipant {
    User {
        user_id: i64,
        canonical_name: String,
        name: String,
    },
    Email {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    External {
        external_id: String,
        external_url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpLabel {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub name: String,
    pub background_color: String,
    pub foreground_color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpComment {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub author: DumpParticipant,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpTicketRef {
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpEvent {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub event_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<DumpParticipant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<DumpComment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_user: Option<DumpParticipant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_ticket: Option<DumpTicketRef>,
    pub upstream: String,
    #[serde(
        rename = "X-Payload-Signature",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signature: Option<String>,
    #[serde(rename = "X-Payload-Nonce", default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpTicket {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub submitter: DumpParticipant,
    #[serde(rename = "ref")]
    pub reference: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub status: TicketStatus,
    pub resolution: TicketResolution,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<DumpUser>,
    pub upstream: String,
    #[serde(
        rename = "X-Payload-Signature",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signature: Option<String>,
    #[serde(rename = "X-Payload-Nonce", default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<DumpEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerDump {
    pub id: i64,
    pub owner: DumpUser,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<DumpLabel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tickets: Vec<DumpTicket>,
}

/// Signed fields of a user-submitted ticket, in signing order.
#[derive(Debug, Serialize)]
pub struct TicketSignatureData<'a> {
    pub tracker_id: i64,
    pub ticket_id: i64,
    pub subject: &'a str,
    pub body: &'a str,
    pub submitter_id: i64,
    pub upstream_origin: &'a str,
}

/// Signed fields of a user-authored comment, in signing order.
#[derive(Debug, Serialize)]
pub struct CommentSignatureData<'a> {
    pub tracker_id: i64,
    pub ticket_id: i64,
    pub comment: &'a str,
    pub author_id: i64,
    pub upstream_origin: &'a str,
}

pub fn write_dump<W: Write>(out: W, dump: &TrackerDump) -> Result<()> {
    let mut encoder = GzEncoder::new(out, Compression::default());
    serde_json::to_writer(&mut encoder, dump)?;
    encoder.finish()?;
    Ok(())
}

pub fn read_dump<R: Read>(input: R) -> Result<TrackerDump> {
    Ok(serde_json::from_reader(GzDecoder::new(input))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_json_is_tagged() {
        let user = DumpParticipant::User {
            user_id: 3,
            canonical_name: "~u1".into(),
            name: "u1".into(),
        };
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["canonical_name"], "~u1");

        let email: DumpParticipant =
            serde_json::from_str(r#"{"type":"email","address":"a@b.c"}"#).unwrap();
        assert_eq!(
            email,
            DumpParticipant::Email {
                address: "a@b.c".into(),
                name: None
            }
        );
        assert!(serde_json::from_str::<DumpParticipant>(r#"{"type":"robot"}"#).is_err());
    }

    #[test]
    fn test_signature_fields_keep_declared_order() {
        let data = TicketSignatureData {
            tracker_id: 1,
            ticket_id: 2,
            subject: "s",
            body: "b",
            submitter_id: 3,
            upstream_origin: "https://todo.example.org",
        };
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"tracker_id":1,"ticket_id":2,"subject":"s","body":"b","submitter_id":3,"upstream_origin":"https://todo.example.org"}"#
        );
    }

    #[test]
    fn test_ticket_uses_header_style_signature_keys() {
        let json = r#"{
            "id": 1, "created": "2024-01-01T00:00:00Z", "updated": "2024-01-01T00:00:00Z",
            "submitter": {"type": "email", "address": "x@y.z"},
            "ref": "~u1/bugs#1", "subject": "s", "status": "RESOLVED",
            "resolution": "WONT_FIX", "upstream": "https://todo.example.org",
            "X-Payload-Signature": "c2ln", "X-Payload-Nonce": "00ff"
        }"#;
        let ticket: DumpTicket = serde_json::from_str(json).unwrap();
        assert_eq!(ticket.status, TicketStatus::Resolved);
        assert_eq!(ticket.resolution, TicketResolution::WontFix);
        assert_eq!(ticket.signature.as_deref(), Some("c2ln"));
        assert!(ticket.events.is_empty());
    }
}
