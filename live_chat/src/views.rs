use std::collections::HashMap;
use std::sync::Arc;

use chat_protocol::{ChatSummary, ChatView, MessagePage, MessageView, PublicUser};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult, StoreError};
use crate::ledger::LedgerPage;
use crate::model::{Conversation, Message};
use crate::store::UserStore;

/// Builds outward views, resolving user ids to their public form. Lookups are
/// cached for the lifetime of the resolver, so create one per request.
pub struct Resolver {
    users: Arc<dyn UserStore>,
    cache: HashMap<Uuid, PublicUser>,
}

impl Resolver {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self {
            users,
            cache: HashMap::new(),
        }
    }

    pub fn user(&mut self, id: &Uuid) -> ChatResult<PublicUser> {
        if let Some(user) = self.cache.get(id) {
            return Ok(user.clone());
        }
        let user = match self.users.find_user(id) {
            Ok(record) => record.public(),
            Err(StoreError::NotFound) => {
                return Err(ChatError::Internal(format!("dangling user reference {}", id)))
            }
            Err(e) => return Err(e.into()),
        };
        self.cache.insert(*id, user.clone());
        Ok(user)
    }

    pub fn chat(&mut self, conv: &Conversation) -> ChatResult<ChatView> {
        let participants = conv
            .participants
            .iter()
            .map(|id| self.user(id))
            .collect::<ChatResult<Vec<_>>>()?;
        let group_admin = conv.group_admin.as_ref().map(|id| self.user(id)).transpose()?;
        Ok(ChatView {
            id: conv.id,
            participants,
            is_group: conv.is_group,
            group_name: conv.group_name.clone(),
            group_admin,
            created_at: conv.created_at,
            updated_at: conv.updated_at,
        })
    }

    pub fn summary(&mut self, conv: &Conversation) -> ChatResult<ChatSummary> {
        let last_message = conv.last_message.as_ref().map(|m| self.message(m)).transpose()?;
        Ok(ChatSummary {
            chat: self.chat(conv)?,
            message_count: conv.message_count,
            last_message,
        })
    }

    pub fn message(&mut self, msg: &Message) -> ChatResult<MessageView> {
        Ok(MessageView {
            seq: msg.seq,
            sender: self.user(&msg.sender_id)?,
            content: msg.content.clone(),
            timestamp: msg.timestamp,
        })
    }

    pub fn page(&mut self, page: LedgerPage) -> ChatResult<MessagePage> {
        let messages = page
            .messages
            .iter()
            .map(|m| self.message(m))
            .collect::<ChatResult<Vec<_>>>()?;
        Ok(MessagePage {
            messages,
            pagination: page.pagination,
        })
    }
}

/// Render a message whose sender is already known, without a store lookup.
pub fn message_from(msg: &Message, sender: PublicUser) -> MessageView {
    MessageView {
        seq: msg.seq,
        sender,
        content: msg.content.clone(),
        timestamp: msg.timestamp,
    }
}
