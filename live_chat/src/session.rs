use std::sync::Arc;

use chat_protocol::{
    ChatAdded, ChatRemoved, ChatsJoined, ClientEvent, NewMessage, PublicUser, SendMessage,
    ServerEvent, Typing, UserTyping,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::accounts::Authenticator;
use crate::directory::Directory;
use crate::error::{ChatError, ChatResult};
use crate::hub::{Channel, ConnectionId, Frame, Hub};
use crate::ledger::Ledger;
use crate::model::{Conversation, UserIdentity};
use crate::store::run_blocking;
use crate::views;

pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Shared entry point for live connections and for notifications raised by
/// the HTTP handlers.
#[derive(Clone)]
pub struct SessionRouter {
    hub: Arc<Hub>,
    directory: Directory,
    ledger: Ledger,
    auth: Arc<dyn Authenticator>,
    outbound_buffer: usize,
}

impl SessionRouter {
    pub fn new(
        directory: Directory,
        ledger: Ledger,
        auth: Arc<dyn Authenticator>,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            hub: Arc::new(Hub::new()),
            directory,
            ledger,
            auth,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Open a session together with the receiving end of its outbound queue.
    pub fn connect(&self) -> (Session, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let session = Session {
            router: self.clone(),
            tx,
            state: SessionState::Unauthenticated,
        };
        (session, rx)
    }

    /// Subscribe the participants' live connections to a new conversation and
    /// tell each of them about it.
    pub fn notify_added(&self, conv: &Conversation, users: &[Uuid]) {
        let event = ServerEvent::ChatAdded(ChatAdded {
            chat_id: conv.id,
            is_group: conv.is_group,
            group_name: conv.group_name.clone(),
        });
        let channel = Channel::Conversation(conv.id);
        for user in users {
            self.hub.subscribe_user(*user, channel);
            self.hub.publish(Channel::User(*user), &event, None);
        }
    }

    pub fn notify_removed(&self, conversation_id: Uuid, user: Uuid) {
        self.hub
            .unsubscribe_user(user, Channel::Conversation(conversation_id));
        self.hub.publish(
            Channel::User(user),
            &ServerEvent::ChatRemoved(ChatRemoved {
                chat_id: conversation_id,
            }),
            None,
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated {
        identity: UserIdentity,
        connection: ConnectionId,
    },
    Closed,
}

/// One live connection. Dropping it releases every subscription.
pub struct Session {
    router: SessionRouter,
    tx: mpsc::Sender<Frame>,
    state: SessionState,
}

impl Session {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        match &self.state {
            SessionState::Authenticated { identity, .. } => Some(identity),
            _ => None,
        }
    }

    /// Verify the handshake credential. Only valid once: any failure closes
    /// the session for good.
    pub async fn authenticate(&mut self, credential: Option<&str>) -> ChatResult<UserIdentity> {
        if self.state != SessionState::Unauthenticated {
            return Err(ChatError::invalid("session already authenticated"));
        }
        let Some(credential) = credential.map(str::to_owned) else {
            self.state = SessionState::Closed;
            tracing::warn!("socket rejected: no credential");
            return Err(ChatError::Unauthenticated);
        };
        let auth = self.router.auth.clone();
        match run_blocking(move || auth.verify(&credential)).await {
            Ok(identity) => {
                let connection = self.router.hub.register(identity.id, self.tx.clone());
                tracing::info!(user_id = %identity.id, %connection, "socket authenticated");
                self.state = SessionState::Authenticated {
                    identity: identity.clone(),
                    connection,
                };
                Ok(identity)
            }
            Err(e) => {
                self.state = SessionState::Closed;
                tracing::warn!(error = %e, "socket rejected");
                Err(e)
            }
        }
    }

    /// Handle one inbound event. The returned event, if any, is a reply for
    /// this connection only.
    pub async fn handle(&mut self, event: ClientEvent) -> Option<ServerEvent> {
        let (identity, connection) = match &self.state {
            SessionState::Authenticated {
                identity,
                connection,
            } => (identity.clone(), *connection),
            _ => return Some(ServerEvent::error("Not authenticated", None)),
        };
        match event {
            ClientEvent::JoinChats => Some(self.join_chats(&identity, connection).await),
            ClientEvent::SendMessage(req) => self.send_message(identity, req).await,
            ClientEvent::Typing(req) => self.typing(identity, connection, req).await,
        }
    }

    /// Subscribe first, then confirm membership. A removal committed before
    /// the check is undone here; one committed after it is followed by its
    /// own `notify_removed`.
    async fn join_chats(&self, identity: &UserIdentity, connection: ConnectionId) -> ServerEvent {
        let hub = &self.router.hub;
        let directory = self.router.directory.clone();
        let user_id = identity.id;
        let listed: Vec<Uuid> = match run_blocking(move || directory.list_for_user(&user_id)).await {
            Ok(convs) => convs.iter().map(|c| c.id).collect(),
            Err(e) => return ServerEvent::error(e.client_message(), None),
        };
        for id in &listed {
            hub.subscribe(connection, Channel::Conversation(*id));
        }

        let directory = self.router.directory.clone();
        let ids = listed.clone();
        let checked = run_blocking(move || {
            ids.into_iter()
                .map(|id| directory.is_participant(&id, &user_id).map(|member| (id, member)))
                .collect::<ChatResult<Vec<_>>>()
        })
        .await;
        let checked = match checked {
            Ok(checked) => checked,
            Err(e) => {
                for id in &listed {
                    hub.unsubscribe(connection, Channel::Conversation(*id));
                }
                return ServerEvent::error(e.client_message(), None);
            }
        };
        let mut chat_ids = Vec::with_capacity(checked.len());
        for (id, member) in checked {
            if member {
                chat_ids.push(id);
            } else {
                hub.unsubscribe(connection, Channel::Conversation(id));
            }
        }
        tracing::debug!(user_id = %user_id, chats = chat_ids.len(), "joined chats");
        ServerEvent::ChatsJoined(ChatsJoined { chat_ids })
    }

    /// The append and its broadcast share one blocking task, so a committed
    /// message is broadcast even if this connection goes away meanwhile.
    async fn send_message(&self, identity: UserIdentity, req: SendMessage) -> Option<ServerEvent> {
        let ledger = self.router.ledger.clone();
        let hub = self.router.hub.clone();
        let chat_id = req.chat_id;
        let res = run_blocking(move || {
            let msg = ledger.append_message(&chat_id, &identity.id, &req.content)?;
            let event = ServerEvent::NewMessage(NewMessage {
                chat_id,
                message: views::message_from(&msg, PublicUser::from(&identity)),
            });
            hub.publish(Channel::Conversation(chat_id), &event, None);
            Ok(())
        })
        .await;
        match res {
            Ok(()) => None,
            Err(e) => Some(ServerEvent::error(e.client_message(), Some(chat_id))),
        }
    }

    async fn typing(
        &self,
        identity: UserIdentity,
        connection: ConnectionId,
        req: Typing,
    ) -> Option<ServerEvent> {
        let channel = Channel::Conversation(req.chat_id);
        let allowed = if self.router.hub.is_subscribed(connection, channel) {
            true
        } else {
            let directory = self.router.directory.clone();
            let (chat_id, user_id) = (req.chat_id, identity.id);
            run_blocking(move || directory.is_participant(&chat_id, &user_id))
                .await
                .unwrap_or(false)
        };
        if !allowed {
            return Some(ServerEvent::error(
                ChatError::Unauthorized.client_message(),
                Some(req.chat_id),
            ));
        }
        self.router.hub.publish(
            channel,
            &ServerEvent::UserTyping(UserTyping {
                chat_id: req.chat_id,
                user_id: identity.id,
                username: identity.username,
                is_typing: req.is_typing,
            }),
            Some(connection),
        );
        None
    }

    /// Terminal. Releases the hub registration, if any.
    pub fn close(&mut self) {
        if let SessionState::Authenticated { connection, .. } = &self.state {
            self.router.hub.release(*connection);
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::JwtAuthenticator;
    use crate::db::SqliteStore;
    use crate::directory::tests::add_user;
    use crate::directory::CreateConversation;
    use crate::model::UserRecord;
    use crate::store::{ConversationStore, UserStore};

    struct Harness {
        store: Arc<SqliteStore>,
        router: SessionRouter,
        tokens: JwtAuthenticator,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(SqliteStore::memory().unwrap());
            let tokens = JwtAuthenticator::new(b"test", time::Duration::hours(1), store.clone());
            let directory = Directory::new(store.clone(), store.clone());
            let ledger = Ledger::new(store.clone());
            let router = SessionRouter::new(directory, ledger, Arc::new(tokens.clone()), 16);
            Self {
                store,
                router,
                tokens,
            }
        }

        fn token(&self, id: Uuid) -> String {
            let user: UserRecord = self.store.find_user(&id).unwrap();
            self.tokens.issue(&user).unwrap()
        }

        async fn session(&self, id: Uuid) -> (Session, mpsc::Receiver<Frame>) {
            let (mut session, rx) = self.router.connect();
            session.authenticate(Some(&self.token(id))).await.unwrap();
            (session, rx)
        }

        fn group(&self, admin: Uuid, others: Vec<Uuid>) -> Conversation {
            Directory::new(self.store.clone(), self.store.clone())
                .create_conversation(
                    &admin,
                    CreateConversation {
                        participants: others,
                        is_group: true,
                        group_name: Some("Team".into()),
                    },
                )
                .unwrap()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn bad_credentials_close_the_session() {
        let h = Harness::new();
        let (mut session, _rx) = h.router.connect();
        assert_eq!(
            session.authenticate(Some("garbage")).await.unwrap_err(),
            ChatError::Unauthenticated
        );
        assert_eq!(session.state(), &SessionState::Closed);
        assert!(session.authenticate(Some("again")).await.is_err());

        let (mut session, _rx) = h.router.connect();
        assert!(session.authenticate(None).await.is_err());
        assert_eq!(session.state(), &SessionState::Closed);
        assert!(matches!(
            session.handle(ClientEvent::JoinChats).await,
            Some(ServerEvent::Error(_))
        ));
        assert_eq!(h.router.hub().connection_count(), 0);
    }

    #[tokio::test]
    async fn authentication_happens_once() {
        let h = Harness::new();
        let a = add_user(&h.store, "alice");
        let (mut session, _rx) = h.session(a).await;
        assert_eq!(session.identity().unwrap().username, "alice");
        let token = h.token(a);
        assert!(matches!(
            session.authenticate(Some(&token)).await,
            Err(ChatError::InvalidRequest(_))
        ));
        assert_eq!(h.router.hub().connection_count(), 1);
    }

    #[tokio::test]
    async fn join_then_broadcast_reaches_every_member() {
        let h = Harness::new();
        let (a, b, c) = (
            add_user(&h.store, "A"),
            add_user(&h.store, "B"),
            add_user(&h.store, "C"),
        );
        let conv = h.group(a, vec![b, c]);
        let (mut sa, mut ra) = h.session(a).await;
        let (mut sb, mut rb) = h.session(b).await;
        let (mut sc, mut rc) = h.session(c).await;
        for s in [&mut sa, &mut sb, &mut sc] {
            match s.handle(ClientEvent::JoinChats).await {
                Some(ServerEvent::ChatsJoined(j)) => assert_eq!(j.chat_ids, vec![conv.id]),
                other => panic!("unexpected {:?}", other),
            }
        }
        let reply = sa
            .handle(ClientEvent::SendMessage(SendMessage {
                chat_id: conv.id,
                content: "hi".into(),
            }))
            .await;
        assert!(reply.is_none());
        for rx in [&mut ra, &mut rb, &mut rc] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::NewMessage(m) => {
                    assert_eq!(m.chat_id, conv.id);
                    assert_eq!(m.message.sender.username, "A");
                    assert_eq!(m.message.content, "hi");
                    assert_eq!(m.message.seq, 0);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn outsider_send_is_denied_quietly() {
        let h = Harness::new();
        let (a, b, d) = (
            add_user(&h.store, "A"),
            add_user(&h.store, "B"),
            add_user(&h.store, "D"),
        );
        let conv = h.group(a, vec![b]);
        let (mut sa, mut ra) = h.session(a).await;
        sa.handle(ClientEvent::JoinChats).await;
        let (mut sd, _rd) = h.session(d).await;
        let denied = sd
            .handle(ClientEvent::SendMessage(SendMessage {
                chat_id: conv.id,
                content: "let me in".into(),
            }))
            .await;
        let missing = sd
            .handle(ClientEvent::SendMessage(SendMessage {
                chat_id: Uuid::new_v4(),
                content: "anyone?".into(),
            }))
            .await;
        let (Some(ServerEvent::Error(denied)), Some(ServerEvent::Error(missing))) = (denied, missing)
        else {
            panic!("expected errors");
        };
        assert_eq!(denied.message, missing.message);
        assert_eq!(denied.chat_id, Some(conv.id));
        assert!(drain(&mut ra).is_empty());
        assert_eq!(h.store.find_by_id(&conv.id).unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn typing_skips_sender_and_checks_membership() {
        let h = Harness::new();
        let (a, b, d) = (
            add_user(&h.store, "A"),
            add_user(&h.store, "B"),
            add_user(&h.store, "D"),
        );
        let conv = h.group(a, vec![b]);
        let (mut sa, mut ra) = h.session(a).await;
        let (mut sb, mut rb) = h.session(b).await;
        sb.handle(ClientEvent::JoinChats).await;
        drain(&mut rb);

        // not joined, but a participant
        let typing = Typing {
            chat_id: conv.id,
            is_typing: true,
        };
        assert!(sa.handle(ClientEvent::Typing(typing.clone())).await.is_none());
        assert!(drain(&mut ra).is_empty());
        match drain(&mut rb).as_slice() {
            [ServerEvent::UserTyping(t)] => {
                assert_eq!(t.user_id, a);
                assert_eq!(t.username, "A");
                assert!(t.is_typing);
            }
            other => panic!("unexpected {:?}", other),
        }

        let (mut sd, _rd) = h.session(d).await;
        assert!(matches!(
            sd.handle(ClientEvent::Typing(typing)).await,
            Some(ServerEvent::Error(_))
        ));
        assert!(drain(&mut rb).is_empty());
    }

    #[tokio::test]
    async fn directory_notifications_follow_membership() {
        let h = Harness::new();
        let (a, b) = (add_user(&h.store, "A"), add_user(&h.store, "B"));
        let (sb, mut rb) = h.session(b).await;
        let conv = h.group(a, vec![b]);
        h.router.notify_added(&conv, &conv.participants);
        let SessionState::Authenticated { connection, .. } = sb.state().clone() else {
            panic!("not authenticated");
        };
        let channel = Channel::Conversation(conv.id);
        assert!(h.router.hub().is_subscribed(connection, channel));
        assert!(matches!(
            drain(&mut rb).as_slice(),
            [ServerEvent::ChatAdded(added)] if added.chat_id == conv.id
        ));

        h.router.notify_removed(conv.id, b);
        assert!(!h.router.hub().is_subscribed(connection, channel));
        assert!(matches!(
            drain(&mut rb).as_slice(),
            [ServerEvent::ChatRemoved(removed)] if removed.chat_id == conv.id
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_racing_a_removal_leaves_no_subscription() {
        let h = Harness::new();
        let (a, b) = (add_user(&h.store, "A"), add_user(&h.store, "B"));
        let directory = Directory::new(h.store.clone(), h.store.clone());
        for _ in 0..100 {
            let conv = h.group(a, vec![b]);
            let (mut sb, _rb) = h.session(b).await;
            let SessionState::Authenticated { connection, .. } = sb.state().clone() else {
                panic!("not authenticated");
            };
            let remover = {
                let (directory, router, id) = (directory.clone(), h.router.clone(), conv.id);
                tokio::task::spawn_blocking(move || {
                    assert!(directory.remove_member(&id, &a, &b).unwrap().changed);
                    router.notify_removed(id, b);
                })
            };
            sb.handle(ClientEvent::JoinChats).await;
            remover.await.unwrap();
            assert!(!h.store.find_by_id(&conv.id).unwrap().has_participant(&b));
            assert!(!h
                .router
                .hub()
                .is_subscribed(connection, Channel::Conversation(conv.id)));
        }
    }

    #[tokio::test]
    async fn committed_message_outlives_its_sender() {
        let h = Harness::new();
        let (a, b) = (add_user(&h.store, "A"), add_user(&h.store, "B"));
        let conv = h.group(a, vec![b]);
        let (mut sa, _ra) = h.session(a).await;
        let (mut sb, mut rb) = h.session(b).await;
        sb.handle(ClientEvent::JoinChats).await;
        drain(&mut rb);

        // one poll starts the append, then the sender goes away
        let send = sa.handle(ClientEvent::SendMessage(SendMessage {
            chat_id: conv.id,
            content: "still here".into(),
        }));
        let _ = tokio::time::timeout(std::time::Duration::ZERO, send).await;
        drop(sa);

        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), rb.recv())
            .await
            .unwrap()
            .unwrap();
        match serde_json::from_str::<ServerEvent>(&frame).unwrap() {
            ServerEvent::NewMessage(m) => {
                assert_eq!(m.chat_id, conv.id);
                assert_eq!(m.message.content, "still here");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.router.hub().subscriber_count(Channel::User(a)), 0);
    }

    #[tokio::test]
    async fn dropping_a_session_releases_it() {
        let h = Harness::new();
        let a = add_user(&h.store, "A");
        let (session, _rx) = h.session(a).await;
        assert_eq!(h.router.hub().subscriber_count(Channel::User(a)), 1);
        drop(session);
        assert_eq!(h.router.hub().connection_count(), 0);
        assert_eq!(h.router.hub().subscriber_count(Channel::User(a)), 0);
    }
}
