//! SQLite store backend.
//!
//! One shared connection behind a mutex; every call runs on the blocking
//! pool so the async workers never stall on disk I/O.

use super::{Conversation, ConversationId, Identity, IdentityId, Store, StoredMessage};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Schema migrations, applied in order. `PRAGMA user_version` records how
/// many have run.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        login VARCHAR(50) UNIQUE NOT NULL,
        password TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        online INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user1_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        user2_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
        UNIQUE (user1_id, user2_id),
        CHECK (user1_id <= user2_id)
    );",
    "CREATE TABLE messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sender_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        body TEXT NOT NULL,
        sent_at INTEGER NOT NULL
    );
    CREATE INDEX messages_by_conversation ON messages (conversation_id, sent_at);",
];

fn store_err(e: rusqlite::Error) -> CourierError {
    CourierError::Store(e.to_string())
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        login: row.get(1)?,
        credential_hash: row.get(2)?,
        created_at: row.get(3)?,
        online: row.get(4)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        first: row.get(1)?,
        second: row.get(2)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        sent_at: row.get(4)?,
    })
}

/// Store backed by a single SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring the schema up to date.
    pub fn open(path: &Path) -> CourierResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(store_err)?;
        debug!(mode = %mode, "journal mode");
        info!(path = %path.display(), "opened sqlite store");
        Self::with_connection(conn)
    }

    /// A private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> CourierResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn with_connection(conn: Connection) -> CourierResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(store_err)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<F, T>(&self, f: F) -> CourierResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| CourierError::Store("sqlite connection poisoned".into()))?;
            f(&guard).map_err(store_err)
        })
        .await
        .map_err(|e| CourierError::Store(format!("sqlite task failed: {e}")))?
    }
}

fn migrate(conn: &Connection) -> CourierResult<()> {
    let current: usize = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .map_err(store_err)?
        .try_into()
        .unwrap_or(0);

    for (version, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        conn.execute_batch(sql).map_err(store_err)?;
        conn.pragma_update(None, "user_version", (version + 1) as i64)
            .map_err(store_err)?;
        debug!(version = version + 1, "applied migration");
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_identity(
        &self,
        login: &str,
        credential_hash: &str,
        created_at: i64,
    ) -> CourierResult<Identity> {
        let login = login.to_string();
        let credential_hash = credential_hash.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (login, password, created_at, online) VALUES (?1, ?2, ?3, 0)",
                params![login, credential_hash, created_at],
            )?;
            Ok(Identity {
                id: conn.last_insert_rowid(),
                login,
                credential_hash,
                created_at,
                online: false,
            })
        })
        .await
    }

    async fn get_identity_by_login(&self, login: &str) -> CourierResult<Option<Identity>> {
        let login = login.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, login, password, created_at, online FROM users WHERE login = ?1",
                params![login],
                identity_from_row,
            )
            .optional()
        })
        .await
    }

    async fn get_identity_by_id(&self, id: IdentityId) -> CourierResult<Option<Identity>> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, login, password, created_at, online FROM users WHERE id = ?1",
                params![id],
                identity_from_row,
            )
            .optional()
        })
        .await
    }

    async fn set_online(&self, id: IdentityId, online: bool) -> CourierResult<()> {
        let updated = self
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET online = ?1 WHERE id = ?2",
                    params![online, id],
                )
            })
            .await?;
        if updated == 0 {
            return Err(CourierError::Store(format!("no identity with id {id}")));
        }
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        a: IdentityId,
        b: IdentityId,
    ) -> CourierResult<Conversation> {
        let (first, second) = Conversation::pair(a, b);
        self.call(move |conn| {
            // The unique pair constraint makes a concurrent insert a no-op.
            conn.execute(
                "INSERT OR IGNORE INTO conversations (user1_id, user2_id) VALUES (?1, ?2)",
                params![first, second],
            )?;
            conn.query_row(
                "SELECT id, user1_id, user2_id FROM conversations
                 WHERE user1_id = ?1 AND user2_id = ?2",
                params![first, second],
                conversation_from_row,
            )
        })
        .await
    }

    async fn get_conversation(&self, id: ConversationId) -> CourierResult<Option<Conversation>> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, user1_id, user2_id FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .optional()
        })
        .await
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: IdentityId,
        body: &str,
        sent_at: i64,
    ) -> CourierResult<StoredMessage> {
        let body = body.to_string();
        let inserted = self
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO messages (conversation_id, sender_id, body, sent_at)
                     SELECT id, ?2, ?3, ?4 FROM conversations
                     WHERE id = ?1 AND (user1_id = ?2 OR user2_id = ?2)",
                    params![conversation_id, sender_id, body, sent_at],
                )?;
                Ok((inserted == 1).then(|| StoredMessage {
                    id: conn.last_insert_rowid(),
                    conversation_id,
                    sender_id,
                    body,
                    sent_at,
                }))
            })
            .await?;
        inserted.ok_or_else(|| {
            CourierError::Store(format!(
                "identity {sender_id} is not part of conversation {conversation_id}"
            ))
        })
    }

    async fn list_messages_for_identity(
        &self,
        id: IdentityId,
    ) -> CourierResult<Vec<StoredMessage>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, m.body, m.sent_at
                 FROM messages m JOIN conversations c ON c.id = m.conversation_id
                 WHERE c.user1_id = ?1 OR c.user2_id = ?1
                 ORDER BY m.sent_at ASC, m.id ASC",
            )?;
            let rows = stmt.query_map(params![id], message_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn reset_presence(&self) -> CourierResult<u64> {
        let flipped = self
            .call(|conn| conn.execute("UPDATE users SET online = 0 WHERE online != 0", []))
            .await?;
        Ok(flipped as u64)
    }

    async fn close(&self) -> CourierResult<()> {
        self.call(|conn| conn.execute_batch("PRAGMA optimize;")).await?;
        info!("sqlite store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_and_identities() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.create_identity("alice", "aa", 10).await.unwrap();
        assert!(!alice.online);
        assert!(store.create_identity("alice", "bb", 11).await.is_err());

        store.set_online(alice.id, true).await.unwrap();
        let found = store.get_identity_by_login("alice").await.unwrap().unwrap();
        assert!(found.online);
        assert_eq!(found.credential_hash, "aa");
        assert_eq!(found.created_at, 10);
        assert!(store.get_identity_by_login("bob").await.unwrap().is_none());
        assert!(store.set_online(999, true).await.is_err());
    }

    #[tokio::test]
    async fn conversations_and_history() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.create_identity("alice", "aa", 0).await.unwrap();
        let b = store.create_identity("bob", "bb", 0).await.unwrap();
        let c = store.create_identity("carol", "cc", 0).await.unwrap();

        let ab = store.get_or_create_conversation(b.id, a.id).await.unwrap();
        assert_eq!(store.get_or_create_conversation(a.id, b.id).await.unwrap(), ab);
        assert_eq!(ab.counterpart(b.id), a.id);
        let ac = store.get_or_create_conversation(a.id, c.id).await.unwrap();

        store.append_message(ab.id, b.id, "late", 300).await.unwrap();
        store.append_message(ac.id, c.id, "early", 100).await.unwrap();
        store.append_message(ab.id, a.id, "middle", 200).await.unwrap();
        assert!(store.append_message(ac.id, b.id, "intruder", 150).await.is_err());

        let bodies: Vec<String> = store
            .list_messages_for_identity(a.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["early", "middle", "late"]);
        assert_eq!(store.list_messages_for_identity(b.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reopen_keeps_data_and_reset_presence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let alice = store.create_identity("alice", "aa", 0).await.unwrap();
            store.set_online(alice.id, true).await.unwrap();
            store.close().await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.reset_presence().await.unwrap(), 1);
        let alice = store.get_identity_by_login("alice").await.unwrap().unwrap();
        assert!(!alice.online);
    }
}
