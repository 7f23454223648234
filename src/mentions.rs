//! Extraction of user and ticket references from markdown bodies.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::TicketRef;

static USER_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[\s(])?~([A-Za-z0-9_]+)\b([^/]|$)").expect("valid regex")
});

static TICKET_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[\s(])?(~([A-Za-z0-9_]+)/)?([A-Za-z0-9_.-]+)?#(\d+)\b")
        .expect("valid regex")
});

static TICKET_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[\s(])?(https?://[A-Za-z0-9.]+)/(~([A-Za-z0-9_]+))/([A-Za-z0-9_.-]+)/(\d+)\b")
        .expect("valid regex")
});

/// Where a body was written, used to complete partial references.
#[derive(Debug, Clone, Copy)]
pub struct MentionContext<'a> {
    /// This service's origin; ticket URLs on other hosts are ignored.
    pub origin: &'a str,
    /// Username of the author. Owner of `tracker#N` references.
    pub author: &'a str,
    /// The tracker the body belongs to. `#N` references point here.
    pub tracker_owner: &'a str,
    pub tracker: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    pub users: BTreeSet<String>,
    /// Keyed by canonical reference, so each ticket appears once.
    pub tickets: BTreeSet<TicketRef>,
}

impl Mentions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.tickets.is_empty()
    }
}

/// Scans a body for `~user`, `~owner/tracker#N`, `tracker#N`, `#N` and
/// ticket URLs on this service.
#[must_use]
pub fn scan(body: &str, ctx: &MentionContext<'_>) -> Mentions {
    let mut mentions = Mentions::default();
    let origin = ctx.origin.trim_end_matches('/');

    for caps in USER_MENTION.captures_iter(body) {
        if let Some(name) = caps.get(2) {
            mentions.users.insert(name.as_str().to_string());
        }
    }

    for caps in TICKET_MENTION.captures_iter(body) {
        let Some(scoped_id) = caps.get(5).and_then(|m| m.as_str().parse::<i64>().ok()) else {
            continue;
        };
        let owner = caps.get(3).map(|m| m.as_str());
        let tracker = caps.get(4).map(|m| m.as_str());
        let (owner, tracker) = match (owner, tracker) {
            (Some(owner), Some(tracker)) => (owner, tracker),
            (None, Some(tracker)) => (ctx.author, tracker),
            (None, None) => (ctx.tracker_owner, ctx.tracker),
            // `~owner/#N` names no tracker.
            (Some(_), None) => continue,
        };
        mentions.tickets.insert(TicketRef {
            owner: owner.to_string(),
            tracker: tracker.to_string(),
            scoped_id,
        });
    }

    for caps in TICKET_URL.captures_iter(body) {
        if caps.get(2).map(|m| m.as_str()) != Some(origin) {
            continue;
        }
        let (Some(owner), Some(tracker), Some(scoped_id)) = (
            caps.get(4),
            caps.get(5),
            caps.get(6).and_then(|m| m.as_str().parse::<i64>().ok()),
        ) else {
            continue;
        };
        mentions.tickets.insert(TicketRef {
            owner: owner.as_str().to_string(),
            tracker: tracker.as_str().to_string(),
            scoped_id,
        });
    }

    mentions
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: MentionContext<'static> = MentionContext {
        origin: "https://todo.example.org",
        author: "u1",
        tracker_owner: "boss",
        tracker: "projA",
    };

    fn tref(owner: &str, tracker: &str, id: i64) -> TicketRef {
        TicketRef {
            owner: owner.into(),
            tracker: tracker.into(),
            scoped_id: id,
        }
    }

    #[test]
    fn test_user_mentions_are_deduped() {
        let m = scan("hi ~u2 please look, ~u2 and (~u3)", &CTX);
        assert_eq!(
            m.users.into_iter().collect::<Vec<_>>(),
            vec!["u2".to_string(), "u3".to_string()]
        );
        assert!(m.tickets.is_empty());
    }

    #[test]
    fn test_mention_at_end_of_body() {
        let m = scan("thanks ~u9", &CTX);
        assert!(m.users.contains("u9"));
    }

    #[test]
    fn test_qualified_ticket_is_not_a_user_mention() {
        let m = scan("see ~u3/projB#7", &CTX);
        assert!(m.users.is_empty());
        assert_eq!(m.tickets.into_iter().collect::<Vec<_>>(), vec![tref("u3", "projB", 7)]);
    }

    #[test]
    fn test_partial_references_are_completed() {
        let m = scan("dup of #4 and other#5", &CTX);
        assert!(m.tickets.contains(&tref("boss", "projA", 4)));
        assert!(m.tickets.contains(&tref("u1", "other", 5)));
    }

    #[test]
    fn test_ticket_urls_require_our_origin() {
        let m = scan(
            "https://todo.example.org/~u3/projB/7 and https://evil.example.com/~u3/projB/8",
            &CTX,
        );
        assert_eq!(m.tickets.into_iter().collect::<Vec<_>>(), vec![tref("u3", "projB", 7)]);
    }

    #[test]
    fn test_duplicate_tickets_collapse() {
        let m = scan("~u3/projB#7 ~u3/projB#7 https://todo.example.org/~u3/projB/7", &CTX);
        assert_eq!(m.tickets.len(), 1);
    }

    #[test]
    fn test_plain_text_has_no_mentions() {
        assert!(scan("nothing to see here", &CTX).is_empty());
    }
}
