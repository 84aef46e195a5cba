use chrono::Utc;
use tracing::instrument;

use chatline_core::ids::{MessageId, RoomId, UserId};
use chatline_core::{Message, NewMessage, Recipient};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp};
use crate::store::{MessageStore, StoreHealth};

const TABLE: &str = "messages";

const SELECT_COLUMNS: &str = "SELECT id, sender_id, receiver_id, chatroom_id, content, created_at FROM messages";

/// SQLite-backed [`MessageStore`].
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: Database,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Total number of stored messages.
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
        })
    }

    /// Fetch a single message by id.
    #[instrument(skip_all, fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            let row = rows.next()?;
            match row {
                Some(row) => map_row(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map_row(row)?);
            }
            Ok(out)
        })
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let sender: String = row_helpers::get(row, 1, TABLE, "sender_id")?;
    let receiver = row_helpers::get_opt(row, 2, TABLE, "receiver_id")?;
    let room = row_helpers::get_opt(row, 3, TABLE, "chatroom_id")?;
    let content: String = row_helpers::get(row, 4, TABLE, "content")?;
    let created_at: String = row_helpers::get(row, 5, TABLE, "created_at")?;

    Ok(Message {
        id: MessageId::from_raw(id),
        sender_id: UserId::from_raw(sender),
        recipient: row_helpers::parse_recipient(receiver, room, TABLE)?,
        content,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
    })
}

impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self, message), fields(sender_id = %message.sender_id))]
    fn create(&self, message: &NewMessage) -> Result<Message, StoreError> {
        if message.sender_id.is_empty() {
            return Err(chatline_core::ValidationError::MissingSender.into());
        }
        let (receiver, room) = match &message.recipient {
            Recipient::User(user) => (Some(user.as_str()), None),
            Recipient::Room(room) => (None, Some(room.as_str())),
        };

        let stored = Message {
            id: MessageId::new(),
            sender_id: message.sender_id.clone(),
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            created_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, chatroom_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    stored.id.as_str(),
                    stored.sender_id.as_str(),
                    receiver,
                    room,
                    stored.content,
                    format_timestamp(&stored.created_at),
                ],
            )?;
            Ok(())
        })?;

        Ok(stored)
    }

    #[instrument(skip_all, fields(a = %a, b = %b))]
    fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, seq ASC"
        );
        self.query(&sql, &[&a.as_str(), &b.as_str()])
    }

    #[instrument(skip_all, fields(room_id = %room))]
    fn room_messages(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE chatroom_id = ?1 ORDER BY created_at ASC, seq ASC");
        self.query(&sql, &[&room.as_str()])
    }

    fn health(&self) -> StoreHealth {
        match self.db.ping().and_then(|()| self.count()) {
            Ok(count) => StoreHealth::up(count),
            Err(e) => StoreHealth::down(format!("db down: {e}")),
        }
    }
}
