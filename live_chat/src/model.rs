use chat_protocol::{PublicUser, UserProfile};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Current server time in unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Stored account. The password hash has no outward view.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: i64,
}

impl UserRecord {
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }

    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            id: self.id,
            username: self.username.clone(),
        }
    }
}

/// Verified identity bound to a request or a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: Uuid,
    pub username: String,
}

impl From<&UserIdentity> for PublicUser {
    fn from(identity: &UserIdentity) -> Self {
        PublicUser {
            id: identity.id,
            username: identity.username.clone(),
        }
    }
}

/// One entry of a conversation log.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub conversation_id: Uuid,
    pub seq: u64,
    pub sender_id: Uuid,
    pub content: String,
    pub timestamp: i64,
}

/// Conversation metadata. The log itself stays in the store; only its length
/// and newest entry travel with the record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub group_admin: Option<Uuid>,
    pub message_count: u64,
    pub last_message: Option<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &Uuid) -> bool {
        self.participants.contains(user_id)
    }

    pub fn is_admin(&self, user_id: &Uuid) -> bool {
        self.is_group && self.group_admin.as_ref() == Some(user_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub participants: Vec<Uuid>,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub group_admin: Option<Uuid>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub content: String,
    pub timestamp: i64,
}

/// Field-level mutation applied atomically by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationUpdate {
    Rename(String),
    AddParticipant(Uuid),
    RemoveParticipant(Uuid),
}
