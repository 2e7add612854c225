use std::ops::Range;

use uuid::Uuid;

use crate::error::{ChatError, ChatResult, StoreError};
use crate::model::{Conversation, ConversationUpdate, Message, NewConversation, NewMessage, UserRecord};

/// Durable conversation documents. Every method is a single atomic operation
/// against the backing store.
pub trait ConversationStore: Send + Sync {
    fn create(&self, new: NewConversation) -> Result<Conversation, StoreError>;

    fn find_by_id(&self, id: &Uuid) -> Result<Conversation, StoreError>;

    /// Conversations containing `user_id`, most recently updated first.
    fn find_by_participant(&self, user_id: &Uuid) -> Result<Vec<Conversation>, StoreError>;

    /// Push one message onto the log. Fails with `NotFound` for an unknown
    /// conversation and `NotParticipant` when the sender is not a member at
    /// the moment of the append. The stored timestamp never precedes the
    /// previous entry's.
    fn append_message_atomic(&self, id: &Uuid, message: NewMessage) -> Result<Message, StoreError>;

    /// Log entries whose `seq` lies in `range`, in order.
    fn messages(&self, id: &Uuid, range: Range<u64>) -> Result<Vec<Message>, StoreError>;

    fn update_fields(
        &self,
        id: &Uuid,
        update: ConversationUpdate,
        at: i64,
    ) -> Result<Conversation, StoreError>;
}

/// Durable user accounts.
pub trait UserStore: Send + Sync {
    /// Insert a new account; `Duplicate("username")` or `Duplicate("email")`
    /// when either is taken.
    fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    fn find_user(&self, id: &Uuid) -> Result<UserRecord, StoreError>;

    /// Look up by email or username.
    fn find_user_by_login(&self, login: &str) -> Result<UserRecord, StoreError>;

    fn search_users(
        &self,
        exclude: &Uuid,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UserRecord>, StoreError>;
}

/// Run blocking store work off the async executor.
pub async fn run_blocking<T, F>(f: F) -> ChatResult<T>
where
    F: FnOnce() -> ChatResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Internal(format!("blocking task failed: {}", e)))?
}
