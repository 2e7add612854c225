use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    async_trait,
    extract::{Extension, FromRequest, Path, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chat_protocol::{
    ChatSummary, ClientEvent, CreateChatRequest, MemberRequest, ProfileResponse,
    RenameGroupRequest, ServerEvent, SigninRequest, SigninResponse, SignupRequest,
    SignupResponse, StatusMessage, UserList,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::accounts::{Accounts, Authenticator, JwtAuthenticator};
use crate::config::Config;
use crate::db::SqliteStore;
use crate::directory::{CreateConversation, Directory};
use crate::error::{ChatError, ChatResult};
use crate::ledger::{Ledger, PageRequest, DEFAULT_PAGE_SIZE};
use crate::model::UserIdentity;
use crate::session::SessionRouter;
use crate::store::run_blocking;
use crate::views::Resolver;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub accounts: Accounts,
    pub directory: Directory,
    pub ledger: Ledger,
    pub router: SessionRouter,
    pub config: Config,
}

impl AppState {
    /// Open the configured database and wire every component onto it.
    pub async fn new(config: Config) -> Result<Self> {
        let store = match config.database_path.clone() {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .with_context(|| format!("creating {}", dir.display()))?;
                }
                tokio::task::spawn_blocking(move || SqliteStore::open(path)).await??
            }
            None => SqliteStore::memory()?,
        };
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: Config, store: Arc<SqliteStore>) -> Self {
        let tokens = JwtAuthenticator::new(&config.jwt_secret, config.token_ttl(), store.clone());
        let accounts = Accounts::new(store.clone(), tokens.clone());
        let directory = Directory::new(store.clone(), store.clone());
        let ledger = Ledger::new(store.clone());
        let router = SessionRouter::new(
            directory.clone(),
            ledger.clone(),
            Arc::new(tokens),
            config.outbound_buffer,
        );
        Self {
            store,
            accounts,
            directory,
            ledger,
            router,
            config,
        }
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(self.store.clone())
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/user/profile", get(profile))
        .route("/api/user/getAllUsers", get(all_users))
        .route("/api/chat/chats", post(create_chat).get(list_chats))
        .route("/api/chat/chats/:chat_id/messages", get(chat_messages))
        .route("/api/chat/chats/:chat_id/group-name", put(rename_group))
        .route(
            "/api/chat/chats/:chat_id/members",
            post(add_member).delete(remove_member),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/user/signup", post(signup))
        .route("/api/user/signin", post(signin))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, ChatError> {
    let token = bearer(req.headers()).ok_or(ChatError::Unauthenticated)?;
    let tokens = state.accounts.authenticator().clone();
    let identity = run_blocking(move || tokens.verify(&token)).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// JSON body whose rejections use the common error shape.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, B, T> FromRequest<S, B> for JsonBody<T>
where
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    S: Send + Sync,
    B: Send + 'static,
{
    type Rejection = ChatError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ChatError::invalid(rejection.body_text())),
        }
    }
}

/// Malformed ids read like any other missing conversation.
fn chat_id(raw: &str) -> ChatResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ChatError::NotFound)
}

async fn signup(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<SignupRequest>,
) -> ChatResult<impl IntoResponse> {
    let accounts = state.accounts.clone();
    let user = run_blocking(move || accounts.signup(&req)).await?;
    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            success: "User created successfully".into(),
            user: user.public(),
        }),
    ))
}

async fn signin(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<SigninRequest>,
) -> ChatResult<impl IntoResponse> {
    let accounts = state.accounts.clone();
    let (token, user) = run_blocking(move || accounts.signin(&req)).await?;
    Ok(Json(SigninResponse {
        message: "Login successful".into(),
        token,
        user: user.profile(),
    }))
}

async fn profile(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
) -> ChatResult<impl IntoResponse> {
    let accounts = state.accounts.clone();
    let user = run_blocking(move || accounts.profile(&me.id)).await?;
    Ok(Json(ProfileResponse {
        user: user.profile(),
    }))
}

#[derive(Deserialize)]
struct SearchQuery {
    search: Option<String>,
}

async fn all_users(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
    Query(q): Query<SearchQuery>,
) -> ChatResult<impl IntoResponse> {
    let accounts = state.accounts.clone();
    let users = run_blocking(move || accounts.search(&me.id, q.search.as_deref())).await?;
    Ok(Json(UserList {
        users: users.iter().map(|u| u.profile()).collect(),
    }))
}

async fn create_chat(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
    JsonBody(req): JsonBody<CreateChatRequest>,
) -> ChatResult<impl IntoResponse> {
    let directory = state.directory.clone();
    let mut resolver = state.resolver();
    let (conv, view) = run_blocking(move || {
        let conv = directory.create_conversation(
            &me.id,
            CreateConversation {
                participants: req.participants,
                is_group: req.is_group,
                group_name: req.group_name,
            },
        )?;
        let view = resolver.chat(&conv)?;
        Ok((conv, view))
    })
    .await?;
    state.router.notify_added(&conv, &conv.participants);
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_chats(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
) -> ChatResult<Json<Vec<ChatSummary>>> {
    let directory = state.directory.clone();
    let mut resolver = state.resolver();
    let summaries = run_blocking(move || {
        let convs = directory.list_for_user(&me.id)?;
        convs
            .iter()
            .map(|c| resolver.summary(c))
            .collect::<ChatResult<Vec<_>>>()
    })
    .await?;
    Ok(Json(summaries))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<String>,
    limit: Option<String>,
}

impl PageQuery {
    fn request(&self) -> PageRequest {
        let parse = |v: &Option<String>, default: i64| {
            v.as_deref()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .unwrap_or(default)
        };
        PageRequest::new(
            parse(&self.page, 1),
            parse(&self.limit, DEFAULT_PAGE_SIZE as i64),
        )
    }
}

async fn chat_messages(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
    Path(raw): Path<String>,
    Query(q): Query<PageQuery>,
) -> ChatResult<impl IntoResponse> {
    let id = chat_id(&raw)?;
    let ledger = state.ledger.clone();
    let mut resolver = state.resolver();
    let page = run_blocking(move || {
        let page = ledger.get_messages(&id, &me.id, q.request())?;
        resolver.page(page)
    })
    .await?;
    Ok(Json(page))
}

async fn rename_group(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
    Path(raw): Path<String>,
    JsonBody(req): JsonBody<RenameGroupRequest>,
) -> ChatResult<impl IntoResponse> {
    let id = chat_id(&raw)?;
    let directory = state.directory.clone();
    run_blocking(move || directory.rename_group(&id, &me.id, &req.group_name)).await?;
    Ok(Json(StatusMessage {
        message: "Group name updated successfully".into(),
    }))
}

async fn add_member(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
    Path(raw): Path<String>,
    JsonBody(req): JsonBody<MemberRequest>,
) -> ChatResult<impl IntoResponse> {
    let id = chat_id(&raw)?;
    let directory = state.directory.clone();
    let member = req.user_id;
    let change = run_blocking(move || directory.add_member(&id, &me.id, &member)).await?;
    if change.changed {
        state.router.notify_added(&change.conversation, &[member]);
    }
    Ok(Json(StatusMessage {
        message: "Member added successfully".into(),
    }))
}

async fn remove_member(
    State(state): State<AppState>,
    Extension(me): Extension<UserIdentity>,
    Path(raw): Path<String>,
    JsonBody(req): JsonBody<MemberRequest>,
) -> ChatResult<impl IntoResponse> {
    let id = chat_id(&raw)?;
    let directory = state.directory.clone();
    let member = req.user_id;
    let change = run_blocking(move || directory.remove_member(&id, &me.id, &member)).await?;
    if change.changed {
        state.router.notify_removed(id, member);
    }
    Ok(Json(StatusMessage {
        message: "Member removed successfully".into(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let credential = bearer(&headers).or_else(|| params.get("token").cloned());
    ws.on_upgrade(move |socket| handle_socket(socket, state, credential))
}

type WsSink = SplitSink<WebSocket, WsMessage>;

/// Write one frame, giving up on peers that stall past `timeout`.
async fn write_frame(sink: &mut WsSink, frame: String, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, sink.send(WsMessage::Text(frame))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "socket write failed");
            false
        }
        Err(_) => {
            tracing::warn!("socket write timed out, disconnecting");
            false
        }
    }
}

async fn write_event(sink: &mut WsSink, event: &ServerEvent, timeout: Duration) -> bool {
    match serde_json::to_string(event) {
        Ok(frame) => write_frame(sink, frame, timeout).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode event");
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, credential: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let timeout = state.config.write_timeout();
    let (mut session, mut rx) = state.router.connect();

    if let Err(e) = session.authenticate(credential.as_deref()).await {
        let event = ServerEvent::error(e.client_message(), None);
        if write_event(&mut sink, &event, timeout).await {
            let _ = tokio::time::timeout(timeout, sink.send(WsMessage::Close(None))).await;
        }
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if !write_frame(&mut sink, frame.to_string(), timeout).await {
                    break;
                }
            }
            inbound = stream.next() => {
                let text = match inbound {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let reply = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => session.handle(event).await,
                    Err(_) => Some(ServerEvent::error("Invalid event format", None)),
                };
                if let Some(reply) = reply {
                    if !write_event(&mut sink, &reply, timeout).await {
                        break;
                    }
                }
            }
        }
    }
    session.close();
    tracing::debug!("socket closed");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    let state = AppState::new(config).await?;
    let server = axum::Server::try_bind(&addr).with_context(|| format!("binding {}", addr))?;
    tracing::info!(%addr, "listening");
    server
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(SqliteStore::memory().unwrap());
        build_router(AppState::with_store(Config::default(), store))
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let resp = app()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_reject_missing_token() {
        for uri in ["/api/chat/chats", "/api/user/profile", "/api/user/getAllUsers"] {
            let resp = app()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
        let resp = app()
            .oneshot(
                Request::get("/api/chat/chats")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let resp = app()
            .oneshot(
                Request::post("/api/user/signup")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["error"], "invalid_request");
    }

    #[test]
    fn page_query_falls_back_to_defaults() {
        let q = PageQuery {
            page: Some("abc".into()),
            limit: Some("1000".into()),
        };
        assert_eq!(q.request(), PageRequest { page: 1, size: 100 });
        let q = PageQuery {
            page: None,
            limit: Some("x".into()),
        };
        assert_eq!(q.request(), PageRequest { page: 1, size: 20 });
        let q = PageQuery {
            page: Some(" 3 ".into()),
            limit: Some("5".into()),
        };
        assert_eq!(q.request(), PageRequest { page: 3, size: 5 });
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        assert_eq!(bearer(&headers).as_deref(), Some("tok"));
    }
}
