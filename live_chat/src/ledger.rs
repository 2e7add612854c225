use std::ops::Range;
use std::sync::Arc;

use chat_protocol::Pagination;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::model::{now_millis, Message, NewMessage};
use crate::store::ConversationStore;

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

/// A clamped page request. Page numbers start at 1 with the newest messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub size: u64,
}

impl PageRequest {
    pub fn new(page: i64, size: i64) -> Self {
        Self {
            page: page.max(1) as u64,
            size: size.clamp(1, MAX_PAGE_SIZE as i64) as u64,
        }
    }

    /// Seq range covered by this page in a log of `total` entries.
    pub fn window(&self, total: u64) -> Range<u64> {
        let skip = (self.page - 1).saturating_mul(self.size);
        let end = total.saturating_sub(skip);
        let start = end.saturating_sub(self.size);
        start..end
    }

    pub fn pagination(&self, total: u64) -> Pagination {
        let window = self.window(total);
        Pagination {
            page: self.page,
            limit: self.size,
            total,
            total_pages: (total + self.size - 1) / self.size,
            has_more: window.start > 0,
            has_previous: self.page > 1,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Messages of one page in chronological order.
#[derive(Debug, Clone)]
pub struct LedgerPage {
    pub messages: Vec<Message>,
    pub pagination: Pagination,
}

/// Append-only message logs, one per conversation.
#[derive(Clone)]
pub struct Ledger {
    conversations: Arc<dyn ConversationStore>,
}

impl Ledger {
    pub fn new(conversations: Arc<dyn ConversationStore>) -> Self {
        Self { conversations }
    }

    pub fn append_message(
        &self,
        conversation_id: &Uuid,
        sender_id: &Uuid,
        content: &str,
    ) -> ChatResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::invalid("Message content is required"));
        }
        let msg = self.conversations.append_message_atomic(
            conversation_id,
            NewMessage {
                sender_id: *sender_id,
                content: content.to_string(),
                timestamp: now_millis(),
            },
        )?;
        tracing::debug!(conversation_id = %conversation_id, seq = msg.seq, "message appended");
        Ok(msg)
    }

    /// Readable only by participants. Outsiders get `NotFound` so the
    /// conversation's existence is not revealed.
    pub fn get_messages(
        &self,
        conversation_id: &Uuid,
        requester: &Uuid,
        req: PageRequest,
    ) -> ChatResult<LedgerPage> {
        let conv = self.conversations.find_by_id(conversation_id)?;
        if !conv.has_participant(requester) {
            return Err(ChatError::NotFound);
        }
        let window = req.window(conv.message_count);
        let messages = if window.is_empty() {
            Vec::new()
        } else {
            self.conversations.messages(conversation_id, window)?
        };
        Ok(LedgerPage {
            messages,
            pagination: req.pagination(conv.message_count),
        })
    }
}
