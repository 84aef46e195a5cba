//! Fakes shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use chatline_core::ids::{MessageId, RoomId, UserId};
use chatline_core::{Message, NewMessage, Recipient};
use chatline_store::{Database, MessageStore, SqliteMessageStore, StoreError, StoreHealth};

use crate::registry::{Connection, ConnectionRegistry};
use crate::transport::memory::{self, MemorySource, RemotePeer};

/// In-memory SQLite store whose writes and reads can be switched off.
pub struct FlakyStore {
    inner: SqliteMessageStore,
    fail_create: AtomicBool,
    fail_query: AtomicBool,
    creates: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteMessageStore::new(Database::in_memory().unwrap()),
            fail_create: AtomicBool::new(false),
            fail_query: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
        })
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

impl MessageStore for FlakyStore {
    fn create(&self, message: &NewMessage) -> Result<Message, StoreError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StoreError::Database("simulated outage".into()));
        }
        self.inner.create(message)
    }

    fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError> {
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(StoreError::Database("simulated outage".into()));
        }
        self.inner.conversation(a, b)
    }

    fn room_messages(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(StoreError::Database("simulated outage".into()));
        }
        self.inner.room_messages(room)
    }

    fn health(&self) -> StoreHealth {
        if self.fail_query.load(Ordering::SeqCst) {
            return StoreHealth::down("simulated outage");
        }
        self.inner.health()
    }
}

/// A connection registered in `registry`, plus its read half and client end.
pub fn attach(
    registry: &ConnectionRegistry,
    user: Option<&str>,
) -> (Arc<Connection>, MemorySource, RemotePeer) {
    let (source, sink, peer) = memory::pair();
    let conn = Arc::new(Connection::new(
        user.map(UserId::from_raw),
        Box::new(sink),
        CancellationToken::new(),
    ));
    registry.register(Arc::clone(&conn));
    (conn, source, peer)
}

pub fn direct(sender: &str, receiver: &str, content: &str) -> Message {
    Message {
        id: MessageId::new(),
        sender_id: UserId::from_raw(sender),
        recipient: Recipient::User(UserId::from_raw(receiver)),
        content: content.into(),
        created_at: Utc::now(),
    }
}

pub fn in_room(sender: &str, room: &str, content: &str) -> Message {
    Message {
        id: MessageId::new(),
        sender_id: UserId::from_raw(sender),
        recipient: Recipient::Room(RoomId::from_raw(room)),
        content: content.into(),
        created_at: Utc::now(),
    }
}
