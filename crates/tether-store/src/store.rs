use std::sync::Mutex;

use rusqlite::Connection;
use tracing::warn;

use tether_core::{ContentBlock, Message, Role};

use crate::db::init_db;
use crate::error::Result;

/// Persistent message store.
///
/// Thread-safe: the SQLite connection lives behind a mutex, matching the
/// single-writer usage of the orchestrator.
pub struct MessageStore {
    db: Mutex<Connection>,
}

impl MessageStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    /// Append one message. Content blocks are stored verbatim, including
    /// tool ids and cache markers.
    pub fn append(&self, role: Role, content: &[ContentBlock]) -> Result<()> {
        let db = self.db.lock().unwrap();
        let body = serde_json::to_string(content)?;
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO messages (role, content, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![role.to_string(), body, now],
        )?;
        Ok(())
    }

    /// Load the most recent `limit` messages in ascending time order. When
    /// `truncate_chars` is set, text bodies longer than the limit are cut
    /// and the truncation suffix appended.
    pub fn load_recent(
        &self,
        limit: usize,
        truncate_chars: Option<usize>,
    ) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT role, content FROM messages
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut messages: Vec<Message> = rows
            .filter_map(|r| r.ok())
            .filter_map(|(role_str, body)| {
                let role: Role = match role_str.parse() {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(role = %role_str, "skipping row with unknown role");
                        return None;
                    }
                };
                let content: Vec<ContentBlock> = match serde_json::from_str(&body) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("skipping undecodable message row: {e}");
                        return None;
                    }
                };
                Some(Message {
                    role,
                    content,
                    synthetic: false,
                })
            })
            .collect();
        // Query returns newest first; callers want ascending time.
        messages.reverse();

        if let Some(max) = truncate_chars {
            for msg in &mut messages {
                for block in &mut msg.content {
                    block.truncate_text(max);
                }
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::TRUNCATION_SUFFIX;

    fn store() -> MessageStore {
        MessageStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn append_and_load_ascending() {
        let store = store();
        store
            .append(Role::User, &[ContentBlock::text("first")])
            .unwrap();
        store
            .append(Role::Assistant, &[ContentBlock::text("second")])
            .unwrap();

        let messages = store.load_recent(10, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].first_text(), Some("first"));
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].first_text(), Some("second"));
    }

    #[test]
    fn limit_keeps_the_newest_rows() {
        let store = store();
        for i in 0..5 {
            store
                .append(Role::User, &[ContentBlock::text(format!("m{i}"))])
                .unwrap();
        }
        let messages = store.load_recent(2, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].first_text(), Some("m3"));
        assert_eq!(messages[1].first_text(), Some("m4"));
    }

    #[test]
    fn tool_blocks_round_trip() {
        let store = store();
        let blocks = vec![
            ContentBlock::text("working"),
            ContentBlock::tool_use("t1", "demo", serde_json::json!({"sample_data": "x"})),
        ];
        store.append(Role::Assistant, &blocks).unwrap();

        let messages = store.load_recent(1, None).unwrap();
        assert_eq!(messages[0].tool_use_ids(), vec!["t1"]);
        assert_eq!(messages[0].content[1].tool_name(), Some("demo"));
    }

    #[test]
    fn truncation_appends_suffix() {
        let store = store();
        store
            .append(Role::User, &[ContentBlock::text("abcdefghij")])
            .unwrap();
        let messages = store.load_recent(1, Some(4)).unwrap();
        assert_eq!(
            messages[0].first_text(),
            Some(format!("abcd{TRUNCATION_SUFFIX}").as_str())
        );

        // Short bodies are left alone.
        let untouched = store.load_recent(1, Some(100)).unwrap();
        assert_eq!(untouched[0].first_text(), Some("abcdefghij"));
    }

    #[test]
    fn truncation_reaches_nested_tool_results() {
        let store = store();
        store
            .append(
                Role::User,
                &[
                    ContentBlock::text("lead"),
                    ContentBlock::tool_result(
                        "t1",
                        vec![ContentBlock::text("0123456789")],
                        false,
                    ),
                ],
            )
            .unwrap();
        let messages = store.load_recent(1, Some(6)).unwrap();
        let ContentBlock::ToolResult { content, .. } = &messages[0].content[1] else {
            panic!("expected tool result");
        };
        assert_eq!(
            content[0].as_text(),
            Some(format!("012345{TRUNCATION_SUFFIX}").as_str())
        );
    }
}
