use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ops::webhooks::WebhookInput;
use crate::types::{
    Cursor, Event, Label, Participant, Ticket, TicketResolution, TicketStatus, User,
};

/// Query parameters shared by list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub search: Option<String>,
}

impl ListParams {
    /// A client cursor wins over `count` and `search`, which only shape the
    /// first page.
    pub fn cursor(&self) -> Result<Cursor> {
        if self.cursor.as_deref().is_some_and(|c| !c.is_empty()) {
            return Cursor::from_param(self.cursor.as_deref());
        }
        let mut cursor = self.count.map(Cursor::with_count).unwrap_or_default();
        cursor.search = self.search.clone().filter(|s| !s.is_empty());
        Ok(cursor)
    }
}

#[derive(Debug, Deserialize)]
pub struct AclRequest {
    pub username: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: TicketStatus,
    #[serde(default)]
    pub resolution: Option<TicketResolution>,
}

#[derive(Debug, Deserialize)]
pub struct AssigneeRequest {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct TicketLabelRequest {
    pub label_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CommentEditRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    #[serde(flatten)]
    pub webhook: WebhookInput,
    #[serde(default)]
    pub tracker_id: Option<i64>,
}

/// Flattening breaks numeric fields in query strings, so the list fields
/// are repeated here.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookListParams {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub tracker_id: Option<i64>,
}

impl WebhookListParams {
    pub fn cursor(&self) -> Result<Cursor> {
        ListParams {
            cursor: self.cursor.clone(),
            count: self.count,
            search: None,
        }
        .cursor()
    }
}

/// A ticket with the records a client renders next to it.
#[derive(Debug, Serialize)]
pub struct TicketView {
    #[serde(flatten)]
    pub ticket: Ticket,
    #[serde(rename = "ref")]
    pub reference: String,
    pub submitter: Option<Participant>,
    pub labels: Vec<Label>,
    pub assignees: Vec<User>,
}

/// The event returned by a mutation. Status changes that changed nothing
/// produce no event.
#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub event: Option<Event>,
}

#[derive(Debug, Serialize)]
pub struct ImportAccepted {
    pub tracker_id: i64,
    pub tickets: usize,
}
