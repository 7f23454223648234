use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Access, Authenticity, EventType, TicketResolution, TicketStatus, Visibility};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub username: String,
    pub email: String,
    pub user_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension_notice: Option<String>,
}

impl User {
    #[must_use]
    pub fn canonical_name(&self) -> String {
        format!("~{}", self.username)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracker {
    pub id: i64,
    pub owner_id: i64,
    pub owner_name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub visibility: Visibility,
    pub default_access: Access,
    pub default_user_perms: Access,
    pub next_ticket_id: i64,
    pub import_in_progress: bool,
    /// Effective access of the viewer that loaded this record.
    pub access: Access,
}

impl Tracker {
    #[must_use]
    pub fn canonical_name(&self) -> String {
        format!("~{}/{}", self.owner_name, self.name)
    }

    #[must_use]
    pub fn can_browse(&self) -> bool {
        self.access.has(Access::BROWSE)
    }

    #[must_use]
    pub fn can_submit(&self) -> bool {
        self.access.has(Access::SUBMIT)
    }

    #[must_use]
    pub fn can_comment(&self) -> bool {
        self.access.has(Access::COMMENT)
    }

    #[must_use]
    pub fn can_edit(&self) -> bool {
        self.access.has(Access::EDIT)
    }

    #[must_use]
    pub fn can_triage(&self) -> bool {
        self.access.has(Access::TRIAGE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerAcl {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub tracker_id: i64,
    pub user_id: i64,
    pub permissions: Access,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub tracker_id: i64,
    pub created: DateTime<Utc>,
    pub name: String,
    pub background_color: String,
    pub foreground_color: String,
}

/// Human-facing reference to a ticket: `~owner/tracker#id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketRef {
    pub owner: String,
    pub tracker: String,
    pub scoped_id: i64,
}

impl fmt::Display for TicketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~{}/{}#{}", self.owner, self.tracker, self.scoped_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub tracker_id: i64,
    pub scoped_id: i64,
    pub owner_name: String,
    pub tracker_name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub submitter_id: i64,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub status: TicketStatus,
    pub resolution: TicketResolution,
    pub authenticity: Authenticity,
    pub comment_count: i64,
}

impl Ticket {
    #[must_use]
    pub fn reference(&self) -> TicketRef {
        TicketRef {
            owner: self.owner_name.clone(),
            tracker: self.tracker_name.clone(),
            scoped_id: self.scoped_id,
        }
    }
}

/// The three kinds of actor an event can reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParticipantKind {
    User {
        user_id: i64,
    },
    Email {
        address: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    External {
        external_id: String,
        external_url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ParticipantKind,
}

impl Participant {
    #[must_use]
    pub fn user_id(&self) -> Option<i64> {
        match self.kind {
            ParticipantKind::User { user_id } => Some(user_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub ticket_id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub submitter_id: i64,
    pub text: String,
    pub authenticity: Authenticity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superceded_by_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub event_type: EventType,
    pub ticket_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_participant_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_ticket_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_status: Option<TicketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<TicketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_resolution: Option<TicketResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_resolution: Option<TicketResolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum SubscriptionTarget {
    Ticket(i64),
    Tracker(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub participant_id: i64,
    pub target: SubscriptionTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventNotification {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub event_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_lookup: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Which subscription table a webhook subscription lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    /// `user_webhook_subscription`
    LegacyUser,
    /// `tracker_webhook_subscription`
    LegacyTracker,
    /// `gql_user_wh_sub`
    User,
    /// `gql_tracker_wh_sub`
    Tracker,
}

impl WebhookKind {
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            WebhookKind::LegacyUser => "user_webhook_subscription",
            WebhookKind::LegacyTracker => "tracker_webhook_subscription",
            WebhookKind::User => "gql_user_wh_sub",
            WebhookKind::Tracker => "gql_tracker_wh_sub",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            WebhookKind::LegacyUser => "legacy_user",
            WebhookKind::LegacyTracker => "legacy_tracker",
            WebhookKind::User => "user",
            WebhookKind::Tracker => "tracker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "legacy_user" => Some(WebhookKind::LegacyUser),
            "legacy_tracker" => Some(WebhookKind::LegacyTracker),
            "user" => Some(WebhookKind::User),
            "tracker" => Some(WebhookKind::Tracker),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_legacy(self) -> bool {
        matches!(self, WebhookKind::LegacyUser | WebhookKind::LegacyTracker)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: i64,
    pub kind: WebhookKind,
    pub created: DateTime<Utc>,
    pub url: String,
    pub events: Vec<String>,
    /// Query document forwarded to the delivery queue (modern subscriptions only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<i64>,
}

/// A scheduled webhook delivery from the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub uuid: String,
    pub created: DateTime<Utc>,
    pub kind: WebhookKind,
    pub subscription_id: i64,
    pub event: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub payload: String,
    pub attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}
