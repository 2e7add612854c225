use std::sync::Arc;

use uuid::Uuid;

use crate::error::{ChatError, ChatResult, StoreError};
use crate::model::{now_millis, Conversation, ConversationUpdate, NewConversation};
use crate::store::{ConversationStore, UserStore};

/// Parameters for a new conversation, as requested by its creator.
#[derive(Debug, Clone, Default)]
pub struct CreateConversation {
    pub participants: Vec<Uuid>,
    pub is_group: bool,
    pub group_name: Option<String>,
}

/// Result of an add/remove call; `changed` is false for the idempotent no-op.
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub conversation: Conversation,
    pub changed: bool,
}

/// Membership queries and the group administration rules.
#[derive(Clone)]
pub struct Directory {
    conversations: Arc<dyn ConversationStore>,
    users: Arc<dyn UserStore>,
}

impl Directory {
    pub fn new(conversations: Arc<dyn ConversationStore>, users: Arc<dyn UserStore>) -> Self {
        Self {
            conversations,
            users,
        }
    }

    pub fn create_conversation(
        &self,
        creator: &Uuid,
        req: CreateConversation,
    ) -> ChatResult<Conversation> {
        let mut participants: Vec<Uuid> = Vec::with_capacity(req.participants.len() + 1);
        for id in req.participants {
            if !participants.contains(&id) {
                participants.push(id);
            }
        }
        if !participants.iter().any(|p| p != creator) {
            return Err(ChatError::invalid(
                "participants must include at least one other user",
            ));
        }
        if !participants.contains(creator) {
            participants.push(*creator);
        }
        for id in &participants {
            self.ensure_user(id)?;
        }
        let group_name = if req.is_group {
            let name = req
                .group_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| ChatError::invalid("groupName is required for a group"))?;
            Some(name.to_string())
        } else {
            None
        };
        let conv = self.conversations.create(NewConversation {
            participants,
            is_group: req.is_group,
            group_name,
            group_admin: req.is_group.then_some(*creator),
            created_at: now_millis(),
        })?;
        tracing::info!(
            conversation_id = %conv.id,
            creator = %creator,
            is_group = conv.is_group,
            members = conv.participants.len(),
            "conversation created"
        );
        Ok(conv)
    }

    /// Summaries for every conversation the user belongs to, most recently
    /// updated first.
    pub fn list_for_user(&self, user_id: &Uuid) -> ChatResult<Vec<Conversation>> {
        Ok(self.conversations.find_by_participant(user_id)?)
    }

    pub fn is_participant(&self, conversation_id: &Uuid, user_id: &Uuid) -> ChatResult<bool> {
        match self.conversations.find_by_id(conversation_id) {
            Ok(conv) => Ok(conv.has_participant(user_id)),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn rename_group(
        &self,
        conversation_id: &Uuid,
        actor: &Uuid,
        new_name: &str,
    ) -> ChatResult<Conversation> {
        self.admin_gate(conversation_id, actor)?;
        let name = new_name.trim();
        if name.is_empty() {
            return Err(ChatError::invalid("groupName must not be empty"));
        }
        let conv = self.conversations.update_fields(
            conversation_id,
            ConversationUpdate::Rename(name.to_string()),
            now_millis(),
        )?;
        tracing::info!(conversation_id = %conv.id, "group renamed");
        Ok(conv)
    }

    pub fn add_member(
        &self,
        conversation_id: &Uuid,
        actor: &Uuid,
        member: &Uuid,
    ) -> ChatResult<MembershipChange> {
        let conv = self.admin_gate(conversation_id, actor)?;
        if conv.has_participant(member) {
            return Ok(MembershipChange {
                conversation: conv,
                changed: false,
            });
        }
        self.ensure_user(member)?;
        let conv = self.conversations.update_fields(
            conversation_id,
            ConversationUpdate::AddParticipant(*member),
            now_millis(),
        )?;
        tracing::info!(conversation_id = %conv.id, member = %member, "member added");
        Ok(MembershipChange {
            conversation: conv,
            changed: true,
        })
    }

    /// The admin can never be removed, so `group_admin` always names a member.
    pub fn remove_member(
        &self,
        conversation_id: &Uuid,
        actor: &Uuid,
        member: &Uuid,
    ) -> ChatResult<MembershipChange> {
        let conv = self.admin_gate(conversation_id, actor)?;
        if !conv.has_participant(member) {
            return Ok(MembershipChange {
                conversation: conv,
                changed: false,
            });
        }
        if conv.group_admin.as_ref() == Some(member) {
            return Err(ChatError::invalid("the group admin cannot be removed"));
        }
        let conv = self.conversations.update_fields(
            conversation_id,
            ConversationUpdate::RemoveParticipant(*member),
            now_millis(),
        )?;
        tracing::info!(conversation_id = %conv.id, member = %member, "member removed");
        Ok(MembershipChange {
            conversation: conv,
            changed: true,
        })
    }

    fn admin_gate(&self, conversation_id: &Uuid, actor: &Uuid) -> ChatResult<Conversation> {
        let conv = self.conversations.find_by_id(conversation_id)?;
        if !conv.is_admin(actor) {
            return Err(ChatError::Unauthorized);
        }
        Ok(conv)
    }

    fn ensure_user(&self, id: &Uuid) -> ChatResult<()> {
        match self.users.find_user(id) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound) => Err(ChatError::invalid(format!("unknown participant {}", id))),
            Err(e) => Err(e.into()),
        }
    }
}
