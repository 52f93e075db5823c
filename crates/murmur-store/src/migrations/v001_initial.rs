//! v001 -- Initial schema creation.
//!
//! Every collection keeps its documents as JSON in a `doc` column, next to
//! the few fields it is queried or ordered by.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats (two members each)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id        TEXT PRIMARY KEY NOT NULL,
    last_time TEXT NOT NULL,               -- RFC-3339, microsecond precision
    doc       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_members (
    chat_id TEXT NOT NULL,
    uid     TEXT NOT NULL,

    PRIMARY KEY (chat_id, uid),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chat_members_uid ON chat_members(uid);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,
    chat_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    doc        TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_created
    ON messages(chat_id, created_at DESC);

-- ----------------------------------------------------------------
-- Users: profile + settings
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profiles (
    uid      TEXT PRIMARY KEY NOT NULL,
    username TEXT,
    doc      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_profiles_username ON profiles(username);

CREATE TABLE IF NOT EXISTS settings (
    uid TEXT PRIMARY KEY NOT NULL,
    doc TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Stories
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS stories (
    id        TEXT PRIMARY KEY NOT NULL,
    expire_at TEXT NOT NULL,
    doc       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stories_expire_at ON stories(expire_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
