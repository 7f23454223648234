pub const SCHEMA: &str = r#"
-- Local copies of identity-service user profiles
CREATE TABLE IF NOT EXISTS "user" (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    user_type TEXT NOT NULL DEFAULT 'active_non_paying',
    url TEXT,
    location TEXT,
    bio TEXT,
    suspension_notice TEXT
);

-- Auth credentials; always bound to a user
CREATE TABLE IF NOT EXISTS token (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,          -- argon2id hash with embedded salt
    token_lookup TEXT NOT NULL,        -- lookup segment of the raw token
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    expires_at TEXT,                   -- NULL = never
    last_used_at TEXT
);

CREATE TABLE IF NOT EXISTS tracker (
    id INTEGER PRIMARY KEY,
    owner_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    visibility TEXT NOT NULL DEFAULT 'PUBLIC'
        CHECK (visibility IN ('PUBLIC', 'UNLISTED', 'PRIVATE')),
    default_access INTEGER NOT NULL DEFAULT 7 CHECK (default_access & ~31 = 0),
    default_user_perms INTEGER NOT NULL DEFAULT 7 CHECK (default_user_perms & ~31 = 0),
    next_ticket_id INTEGER NOT NULL DEFAULT 1 CHECK (next_ticket_id >= 1),
    import_in_progress INTEGER NOT NULL DEFAULT 0,

    UNIQUE(owner_id, name)
);

-- Per-user overrides of a tracker's default access
CREATE TABLE IF NOT EXISTS user_access (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    tracker_id INTEGER NOT NULL REFERENCES tracker(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    permissions INTEGER NOT NULL CHECK (permissions & ~31 = 0),

    UNIQUE(tracker_id, user_id)
);

CREATE TABLE IF NOT EXISTS label (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    tracker_id INTEGER NOT NULL REFERENCES tracker(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    color TEXT NOT NULL,
    text_color TEXT NOT NULL,

    UNIQUE(tracker_id, name)
);

-- Actors referenced by events; exactly one variant is populated
CREATE TABLE IF NOT EXISTS participant (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    participant_type TEXT NOT NULL CHECK (participant_type IN ('user', 'email', 'external')),
    user_id INTEGER REFERENCES "user"(id) ON DELETE CASCADE,
    email TEXT,
    email_name TEXT,
    external_id TEXT,
    external_url TEXT,

    CONSTRAINT participant_user_id_key UNIQUE (user_id),
    CONSTRAINT participant_email_key UNIQUE (email),
    CONSTRAINT participant_external_id_key UNIQUE (external_id),
    CHECK (
        (participant_type = 'user' AND user_id IS NOT NULL
            AND email IS NULL AND external_id IS NULL)
        OR (participant_type = 'email' AND email IS NOT NULL
            AND user_id IS NULL AND external_id IS NULL)
        OR (participant_type = 'external' AND external_id IS NOT NULL
            AND external_url IS NOT NULL AND user_id IS NULL AND email IS NULL)
    )
);

CREATE TABLE IF NOT EXISTS ticket (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    tracker_id INTEGER NOT NULL REFERENCES tracker(id) ON DELETE CASCADE,
    scoped_id INTEGER NOT NULL CHECK (scoped_id >= 1),
    submitter_id INTEGER NOT NULL REFERENCES participant(id),
    subject TEXT NOT NULL,
    body TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    resolution INTEGER NOT NULL DEFAULT 0,
    authenticity INTEGER NOT NULL DEFAULT 0,
    comment_count INTEGER NOT NULL DEFAULT 0,

    UNIQUE(tracker_id, scoped_id)
);

CREATE TABLE IF NOT EXISTS ticket_assignee (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    ticket_id INTEGER NOT NULL REFERENCES ticket(id) ON DELETE CASCADE,
    assignee_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    assigner_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,

    UNIQUE(ticket_id, assignee_id)
);

CREATE TABLE IF NOT EXISTS ticket_label (
    created TEXT NOT NULL,
    ticket_id INTEGER NOT NULL REFERENCES ticket(id) ON DELETE CASCADE,
    label_id INTEGER NOT NULL REFERENCES label(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,

    PRIMARY KEY (ticket_id, label_id)
);

CREATE TABLE IF NOT EXISTS ticket_comment (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    submitter_id INTEGER NOT NULL REFERENCES participant(id),
    ticket_id INTEGER NOT NULL REFERENCES ticket(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    authenticity INTEGER NOT NULL DEFAULT 0,
    superceded_by_id INTEGER REFERENCES ticket_comment(id) ON DELETE SET NULL
);

-- Append-only ticket history
CREATE TABLE IF NOT EXISTS event (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    event_type INTEGER NOT NULL CHECK (event_type <> 0),
    ticket_id INTEGER NOT NULL REFERENCES ticket(id) ON DELETE CASCADE,
    participant_id INTEGER REFERENCES participant(id),
    by_participant_id INTEGER REFERENCES participant(id),
    comment_id INTEGER REFERENCES ticket_comment(id) ON DELETE CASCADE,
    label_id INTEGER REFERENCES label(id) ON DELETE CASCADE,
    from_ticket_id INTEGER REFERENCES ticket(id) ON DELETE CASCADE,
    old_status INTEGER,
    new_status INTEGER,
    old_resolution INTEGER,
    new_resolution INTEGER,

    CHECK (event_type & 4 = 0 OR (old_status IS NOT NULL AND new_status IS NOT NULL))
);

-- Exactly one of ticket_id / tracker_id is set
CREATE TABLE IF NOT EXISTS ticket_subscription (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    participant_id INTEGER NOT NULL REFERENCES participant(id) ON DELETE CASCADE,
    ticket_id INTEGER REFERENCES ticket(id) ON DELETE CASCADE,
    tracker_id INTEGER REFERENCES tracker(id) ON DELETE CASCADE,

    CONSTRAINT subscription_ticket_participant_uq UNIQUE (participant_id, ticket_id),
    CONSTRAINT subscription_tracker_participant_uq UNIQUE (participant_id, tracker_id),
    CHECK ((ticket_id IS NULL) <> (tracker_id IS NULL))
);

-- Per-user inbox
CREATE TABLE IF NOT EXISTS event_notification (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    event_id INTEGER NOT NULL REFERENCES event(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,

    UNIQUE(event_id, user_id)
);

-- Legacy webhook subscriptions
CREATE TABLE IF NOT EXISTS user_webhook_subscription (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    url TEXT NOT NULL,
    events TEXT NOT NULL,
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS tracker_webhook_subscription (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    url TEXT NOT NULL,
    events TEXT NOT NULL,
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    tracker_id INTEGER NOT NULL REFERENCES tracker(id) ON DELETE CASCADE
);

-- Per-subscription webhooks
CREATE TABLE IF NOT EXISTS gql_user_wh_sub (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    url TEXT NOT NULL,
    events TEXT NOT NULL,
    query TEXT NOT NULL,
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS gql_tracker_wh_sub (
    id INTEGER PRIMARY KEY,
    created TEXT NOT NULL,
    url TEXT NOT NULL,
    events TEXT NOT NULL,
    query TEXT NOT NULL,
    user_id INTEGER NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    tracker_id INTEGER NOT NULL REFERENCES tracker(id) ON DELETE CASCADE
);

-- Outbox of scheduled deliveries; rows become visible to the worker on commit
CREATE TABLE IF NOT EXISTS webhook_delivery (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    created TEXT NOT NULL,
    kind TEXT NOT NULL,
    subscription_id INTEGER NOT NULL,
    event TEXT NOT NULL,
    url TEXT NOT NULL,
    query TEXT,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    response_status INTEGER,
    delivered_at TEXT,
    next_attempt_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tracker_owner ON tracker(owner_id);
CREATE INDEX IF NOT EXISTS idx_user_access_user ON user_access(user_id);
CREATE INDEX IF NOT EXISTS idx_ticket_tracker ON ticket(tracker_id);
CREATE INDEX IF NOT EXISTS idx_comment_ticket ON ticket_comment(ticket_id);
CREATE INDEX IF NOT EXISTS idx_event_ticket ON event(ticket_id);
CREATE INDEX IF NOT EXISTS idx_subscription_ticket ON ticket_subscription(ticket_id);
CREATE INDEX IF NOT EXISTS idx_subscription_tracker ON ticket_subscription(tracker_id);
CREATE INDEX IF NOT EXISTS idx_notification_user ON event_notification(user_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_token_lookup ON token(token_lookup);
CREATE INDEX IF NOT EXISTS idx_delivery_pending ON webhook_delivery(delivered_at, next_attempt_at);
"#;
