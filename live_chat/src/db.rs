use std::ops::Range;
use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Conversation, ConversationUpdate, Message, NewConversation, NewMessage, UserRecord};
use crate::store::{ConversationStore, UserStore};

pub type DbPool = Pool<SqliteConnectionManager>;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  username TEXT UNIQUE NOT NULL,
  email TEXT UNIQUE,
  password_hash TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  is_group INTEGER NOT NULL DEFAULT 0,
  group_name TEXT,
  group_admin TEXT,
  message_count INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS participants (
  conversation_id TEXT NOT NULL REFERENCES conversations(id),
  user_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (conversation_id, user_id)
);
CREATE INDEX IF NOT EXISTS participants_by_user ON participants(user_id);

CREATE TABLE IF NOT EXISTS messages (
  conversation_id TEXT NOT NULL REFERENCES conversations(id),
  seq INTEGER NOT NULL,
  sender_id TEXT NOT NULL,
  content TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  PRIMARY KEY (conversation_id, seq)
);
"#;

const CONVERSATION_COLUMNS: &str =
    "c.id, c.is_group, c.group_name, c.group_admin, c.message_count, c.created_at, c.updated_at";

/// SQLite-backed implementation of both stores.
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch(
                "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
            )
        });
        Self::from_pool(Pool::new(manager)?)
    }

    /// Private in-memory database. A single pooled connection that is never
    /// recycled keeps every caller on the same database.
    pub fn memory() -> Result<Self, StoreError> {
        let manager =
            SqliteConnectionManager::memory().with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self, StoreError> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_col(row, 0)?,
        participants: Vec::new(),
        is_group: row.get(1)?,
        group_name: row.get(2)?,
        group_admin: opt_uuid_col(row, 3)?,
        message_count: row.get::<_, i64>(4)? as u64,
        last_message: None,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_message(conversation_id: Uuid, row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        conversation_id,
        seq: row.get::<_, i64>(0)? as u64,
        sender_id: uuid_col(row, 1)?,
        content: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: uuid_col(row, 0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn exists(conn: &Connection, id: &Uuid) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Fill participants and the newest message into a bare conversation row.
/// Column named by a failed unique constraint on `users`.
fn conflicting_user_field(err: &rusqlite::Error) -> &'static str {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("users.email") => "email",
        _ => "username",
    }
}

fn hydrate(conn: &Connection, mut conv: Conversation) -> Result<Conversation, StoreError> {
    let key = conv.id.to_string();
    let mut stmt = conn.prepare(
        "SELECT user_id FROM participants WHERE conversation_id = ?1 ORDER BY position",
    )?;
    conv.participants = stmt
        .query_map([&key], |row| uuid_col(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare(
        "SELECT seq, sender_id, content, timestamp FROM messages WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT 1",
    )?;
    let id = conv.id;
    conv.last_message = stmt
        .query_row([&key], |row| row_to_message(id, row))
        .optional()?;
    Ok(conv)
}

fn load_conversation(conn: &Connection, id: &Uuid) -> Result<Conversation, StoreError> {
    let sql = format!(
        "SELECT {} FROM conversations c WHERE c.id = ?1",
        CONVERSATION_COLUMNS
    );
    let conv = conn
        .query_row(&sql, [id.to_string()], row_to_conversation)
        .optional()?
        .ok_or(StoreError::NotFound)?;
    hydrate(conn, conv)
}

impl ConversationStore for SqliteStore {
    fn create(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO conversations (id, is_group, group_name, group_admin, message_count, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![
                id.to_string(),
                new.is_group,
                new.group_name,
                new.group_admin.map(|a| a.to_string()),
                new.created_at
            ],
        )?;
        for (position, user_id) in new.participants.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO participants (conversation_id, user_id, position) VALUES (?1, ?2, ?3)",
                params![id.to_string(), user_id.to_string(), position as i64],
            )?;
        }
        let conv = load_conversation(&tx, &id)?;
        tx.commit()?;
        Ok(conv)
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Conversation, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let conv = load_conversation(&tx, id)?;
        tx.commit()?;
        Ok(conv)
    }

    /// Every row and its hydration come from one read snapshot.
    fn find_by_participant(&self, user_id: &Uuid) -> Result<Vec<Conversation>, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let sql = format!(
            "SELECT {} FROM conversations c JOIN participants p ON p.conversation_id = c.id WHERE p.user_id = ?1 ORDER BY c.updated_at DESC, c.rowid DESC",
            CONVERSATION_COLUMNS
        );
        let convs = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], row_to_conversation)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|c| hydrate(&tx, c))
                .collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;
        Ok(convs)
    }

    fn append_message_atomic(&self, id: &Uuid, message: NewMessage) -> Result<Message, StoreError> {
        let key = id.to_string();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let count: i64 = tx
            .query_row(
                "SELECT message_count FROM conversations WHERE id = ?1",
                [&key],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        let member: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                params![key, message.sender_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if member.is_none() {
            return Err(StoreError::NotParticipant);
        }
        let previous: Option<i64> = tx
            .query_row(
                "SELECT timestamp FROM messages WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT 1",
                [&key],
                |row| row.get(0),
            )
            .optional()?;
        let timestamp = previous.map_or(message.timestamp, |p| p.max(message.timestamp));
        tx.execute(
            "INSERT INTO messages (conversation_id, seq, sender_id, content, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, count, message.sender_id.to_string(), message.content, timestamp],
        )?;
        tx.execute(
            "UPDATE conversations SET message_count = ?2, updated_at = MAX(updated_at, ?3) WHERE id = ?1",
            params![key, count + 1, timestamp],
        )?;
        tx.commit()?;
        Ok(Message {
            conversation_id: *id,
            seq: count as u64,
            sender_id: message.sender_id,
            content: message.content,
            timestamp,
        })
    }

    fn messages(&self, id: &Uuid, range: Range<u64>) -> Result<Vec<Message>, StoreError> {
        let conn = self.pool.get()?;
        if !exists(&conn, id)? {
            return Err(StoreError::NotFound);
        }
        let mut stmt = conn.prepare(
            "SELECT seq, sender_id, content, timestamp FROM messages WHERE conversation_id = ?1 AND seq >= ?2 AND seq < ?3 ORDER BY seq",
        )?;
        let conv_id = *id;
        let msgs = stmt
            .query_map(
                params![id.to_string(), range.start as i64, range.end as i64],
                |row| row_to_message(conv_id, row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(msgs)
    }

    fn update_fields(
        &self,
        id: &Uuid,
        update: ConversationUpdate,
        at: i64,
    ) -> Result<Conversation, StoreError> {
        let key = id.to_string();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !exists(&tx, id)? {
            return Err(StoreError::NotFound);
        }
        match &update {
            ConversationUpdate::Rename(name) => {
                tx.execute(
                    "UPDATE conversations SET group_name = ?2 WHERE id = ?1",
                    params![key, name],
                )?;
            }
            ConversationUpdate::AddParticipant(user_id) => {
                tx.execute(
                    "INSERT OR IGNORE INTO participants (conversation_id, user_id, position) \
                     VALUES (?1, ?2, (SELECT COALESCE(MAX(position), -1) + 1 FROM participants WHERE conversation_id = ?1))",
                    params![key, user_id.to_string()],
                )?;
            }
            ConversationUpdate::RemoveParticipant(user_id) => {
                tx.execute(
                    "DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                    params![key, user_id.to_string()],
                )?;
            }
        }
        tx.execute(
            "UPDATE conversations SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
            params![key, at],
        )?;
        let conv = load_conversation(&tx, id)?;
        tx.commit()?;
        Ok(conv)
    }
}

impl UserStore for SqliteStore {
    fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let taken: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                [&user.username],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StoreError::Duplicate("username"));
        }
        if let Some(email) = &user.email {
            let taken: Option<i64> = tx
                .query_row("SELECT 1 FROM users WHERE email = ?1", [email], |row| {
                    row.get(0)
                })
                .optional()?;
            if taken.is_some() {
                return Err(StoreError::Duplicate("email"));
            }
        }
        let res = tx.execute(
            "INSERT INTO users (id, username, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.to_string(),
                user.username,
                user.email,
                user.password_hash,
                user.created_at
            ],
        );
        match res {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.sqlite_error_code(),
                    Some(rusqlite::ErrorCode::ConstraintViolation)
                ) =>
            {
                return Err(StoreError::Duplicate(conflicting_user_field(&e)));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;
        Ok(())
    }

    fn find_user(&self, id: &Uuid) -> Result<UserRecord, StoreError> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE id = ?1",
            [id.to_string()],
            row_to_user,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    fn find_user_by_login(&self, login: &str) -> Result<UserRecord, StoreError> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE email = lower(?1) OR username = ?1 LIMIT 1",
            [login],
            row_to_user,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    fn search_users(
        &self,
        exclude: &Uuid,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, username, email, password_hash, created_at FROM users \
             WHERE id <> ?1 AND (?2 IS NULL OR instr(lower(username), lower(?2)) > 0) \
             ORDER BY username LIMIT ?3",
        )?;
        let users = stmt
            .query_map(
                params![exclude.to_string(), query, limit as i64],
                row_to_user,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }
}
