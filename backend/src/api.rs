use crate::auth::Claims;
use crate::config::Config;
use crate::db::Database;
use crate::housekeeping;
use crate::service::Service;
use crate::storage::ObjectStore;
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    body::{Bytes, StreamBody},
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use platform_api::{
    ChannelScope, ChatMessage, Conversation, Filter, LikeState, NewPost, PlatformError, PollOption,
    Post, PostOrder, PublicProfile, Session, Subscription, Table, User,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Largest request body accepted by the storage routes. Bucket policies
/// apply their own, smaller limits.
const MAX_OBJECT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Service,
}

impl AppState {
    /// Open the database and object store under the configured data directory.
    pub async fn new(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(config.storage_dir()).await?;
        let db = Database::open(config.database_path())?;
        let store = ObjectStore::new(config.storage_dir(), &config.public_url)?;
        Ok(Self {
            service: Service::new(db, store)?,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/session", get(current_session))
        .route("/api/posts", post(create_post))
        .route("/api/posts/:id/like", put(set_like))
        .route("/api/poll_options/:id/vote", post(cast_vote))
        .route("/api/profiles", get(search_profiles).put(update_profile))
        .route(
            "/api/conversations",
            get(list_conversations).post(open_conversation),
        )
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/touch", post(touch_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/messages/read", post(mark_read))
        .route("/realtime", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    let uploads = Router::new()
        .route("/storage/:bucket/*path", put(upload_object))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(MAX_OBJECT_BYTES));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/signup", post(sign_up))
        .route("/api/auth/signin", post(sign_in))
        .route("/api/posts", get(list_posts))
        .route("/api/poll_options", get(poll_options))
        .route("/storage/:bucket/*path", get(download_object))
        .merge(protected)
        .merge(uploads)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(PlatformError::Unauthorized)?;
    let claims = state.service.verify(token)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

fn err(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorResp>) {
    (status, Json(ErrorResp { error: msg.into() }))
}

/// Platform error rendered as a status code and `{"error": code}` body.
#[derive(Debug)]
pub struct ApiError(PlatformError);

impl From<PlatformError> for ApiError {
    fn from(e: PlatformError) -> Self {
        Self(e)
    }
}

fn status_for(e: &PlatformError) -> StatusCode {
    match e {
        PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
        PlatformError::Unauthorized | PlatformError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        PlatformError::UsernameTaken | PlatformError::EmailTaken | PlatformError::AlreadyVoted => {
            StatusCode::CONFLICT
        }
        PlatformError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        PlatformError::Invalid(_) | PlatformError::Decode(_) => StatusCode::BAD_REQUEST,
        PlatformError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PlatformError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, "request rejected");
        }
        err(status, self.0.code()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn viewer(claims: &Claims) -> ApiResult<Uuid> {
    Ok(claims.user_id()?)
}

// -- Auth --

#[derive(Deserialize)]
struct SignUpReq {
    email: String,
    password: String,
    username: String,
}

#[derive(Deserialize)]
struct SignInReq {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResp {
    session: Session,
    user: User,
}

async fn sign_up(
    State(state): State<AppState>,
    Json(req): Json<SignUpReq>,
) -> ApiResult<impl IntoResponse> {
    let (user, session) = state
        .service
        .sign_up(&req.email, &req.password, &req.username)
        .await?;
    Ok((StatusCode::CREATED, Json(AuthResp { session, user })))
}

async fn sign_in(
    State(state): State<AppState>,
    Json(req): Json<SignInReq>,
) -> ApiResult<Json<AuthResp>> {
    let (user, session) = state.service.sign_in(&req.email, &req.password).await?;
    Ok(Json(AuthResp { session, user }))
}

async fn current_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.service.profile(&viewer(&claims)?)?))
}

// -- Profiles --

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    5
}

async fn search_profiles(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<PublicProfile>>> {
    let me = viewer(&claims)?;
    Ok(Json(state.service.search_profiles(
        &query.q,
        Some(&me),
        query.limit,
    )?))
}

#[derive(Deserialize)]
struct ProfileReq {
    username: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ProfileReq>,
) -> ApiResult<Json<User>> {
    let me = viewer(&claims)?;
    Ok(Json(state.service.update_profile(
        &me,
        &req.username,
        req.avatar_url.as_deref(),
    )?))
}

// -- Posts --

#[derive(Deserialize)]
struct PostsQuery {
    #[serde(default)]
    order: PostOrder,
}

async fn list_posts(
    State(state): State<AppState>,
    Query(query): Query<PostsQuery>,
) -> ApiResult<Json<Vec<Post>>> {
    Ok(Json(state.service.list_posts(query.order)?))
}

#[derive(Serialize)]
struct CreatedPost {
    post: Post,
    options: Vec<PollOption>,
}

async fn create_post(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    Json(req): Json<NewPost>,
) -> ApiResult<impl IntoResponse> {
    let (post, options) = state.service.create_post(&req)?;
    Ok((StatusCode::CREATED, Json(CreatedPost { post, options })))
}

#[derive(Deserialize)]
struct LikeReq {
    liked: bool,
}

async fn set_like(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<LikeReq>,
) -> ApiResult<Json<LikeState>> {
    let me = viewer(&claims)?;
    Ok(Json(state.service.set_like(&id, &me, req.liked)?))
}

#[derive(Deserialize)]
struct OptionsQuery {
    post_ids: String,
}

fn parse_ids(raw: &str) -> ApiResult<Vec<Uuid>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(s)
                .map_err(|_| ApiError::from(PlatformError::Invalid("invalid_id".into())))
        })
        .collect()
}

async fn poll_options(
    State(state): State<AppState>,
    Query(query): Query<OptionsQuery>,
) -> ApiResult<Json<Vec<PollOption>>> {
    let ids = parse_ids(&query.post_ids)?;
    Ok(Json(state.service.poll_options(&ids)?))
}

async fn cast_vote(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PollOption>> {
    let me = viewer(&claims)?;
    Ok(Json(state.service.cast_vote(&id, &me)?))
}

// -- Conversations --

async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let me = viewer(&claims)?;
    Ok(Json(state.service.conversations(&me)?))
}

async fn get_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    let me = viewer(&claims)?;
    Ok(Json(state.service.conversation(&id, &me)?))
}

#[derive(Deserialize)]
struct OpenReq {
    user_id: Uuid,
}

#[derive(Serialize)]
struct OpenResp {
    conversation: Conversation,
    created: bool,
}

async fn open_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenReq>,
) -> ApiResult<impl IntoResponse> {
    let me = viewer(&claims)?;
    let (conversation, created) = state.service.open_direct_conversation(&me, &req.user_id)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(OpenResp {
            conversation,
            created,
        }),
    ))
}

async fn touch_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let me = viewer(&claims)?;
    state.service.touch_conversation(&id, &me)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Messages --

async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    let me = viewer(&claims)?;
    Ok(Json(state.service.messages(&id, &me)?))
}

#[derive(Deserialize)]
struct SendReq {
    content: String,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendReq>,
) -> ApiResult<impl IntoResponse> {
    let me = viewer(&claims)?;
    let msg = state.service.send_message(&id, &me, &req.content)?;
    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Deserialize)]
struct ReadReq {
    ids: Vec<Uuid>,
}

#[derive(Serialize)]
struct ReadResp {
    updated: usize,
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReadReq>,
) -> ApiResult<Json<ReadResp>> {
    let me = viewer(&claims)?;
    let updated = state.service.mark_read(&req.ids, &me)?;
    Ok(Json(ReadResp { updated }))
}

// -- Storage --

async fn upload_object(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((bucket, path)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let me = viewer(&claims)?;
    let obj = state.service.upload(&me, &bucket, &path, body).await?;
    Ok((StatusCode::CREATED, Json(obj)))
}

async fn download_object(
    State(state): State<AppState>,
    Path((bucket, path)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let (file_path, content_type) = state
        .service
        .store()
        .locate(&bucket, &path)
        .await
        .map_err(crate::db::to_platform)?;
    let file = tokio::fs::File::open(file_path)
        .await
        .map_err(|_| PlatformError::NotFound("object".into()))?;
    let body = StreamBody::new(ReaderStream::new(file));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok((headers, body))
}

// -- Realtime --

#[derive(Deserialize)]
struct RealtimeQuery {
    table: String,
    #[serde(default)]
    filter: Option<String>,
    /// Comma separated change kinds, empty for all.
    #[serde(default)]
    events: Option<String>,
}

fn parse_scope(query: &RealtimeQuery) -> ApiResult<ChannelScope> {
    let table: Table = query.table.parse()?;
    let mut scope = ChannelScope::table(table);
    if let Some(raw) = query.filter.as_deref().filter(|f| !f.is_empty()) {
        scope = scope.with_filter(raw.parse::<Filter>()?);
    }
    if let Some(raw) = query.events.as_deref() {
        for kind in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = serde_json::from_value(serde_json::Value::String(kind.to_string()))
                .map_err(|_| PlatformError::Invalid("unknown_event".into()))?;
            scope.kinds.push(kind);
        }
    }
    Ok(scope)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<RealtimeQuery>,
) -> ApiResult<impl IntoResponse> {
    let me = viewer(&claims)?;
    let scope = parse_scope(&query)?;
    // subscribe before the upgrade so nothing published in between is lost
    let sub = state.service.subscribe_as(Some(me), scope);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, sub, me)))
}

async fn handle_socket(stream: WebSocket, mut sub: Subscription, me: Uuid) {
    let (mut sender, mut receiver) = stream.split();
    info!(user = %me, table = sub.scope().table.name(), "realtime channel opened");
    let _ = sender.send(Message::Text("subscribed".into())).await;
    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {},
            },
        }
    }
    debug!(user = %me, "realtime channel closed");
}

/// Run the HTTP server and its housekeeping job until shutdown.
pub async fn run_http_server(config: Config) -> Result<()> {
    let state = AppState::new(&config).await?;
    housekeeping::run_housekeeping(state.service.clone());
    let addr: SocketAddr = config.bind.parse()?;
    info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform_api::ChangeKind;

    #[test]
    fn realtime_scope_from_query() {
        let q = RealtimeQuery {
            table: "messages".into(),
            filter: Some("conversation_id=eq.abc".into()),
            events: Some("insert".into()),
        };
        let scope = parse_scope(&q).unwrap();
        assert_eq!(scope.table, Table::Messages);
        assert_eq!(scope.kinds, vec![ChangeKind::Insert]);
        assert_eq!(scope.filter, Some(Filter::eq("conversation_id", "abc")));

        let bad = RealtimeQuery {
            table: "nope".into(),
            filter: None,
            events: None,
        };
        assert!(parse_scope(&bad).is_err());
    }

    #[test]
    fn error_statuses() {
        assert_eq!(status_for(&PlatformError::AlreadyVoted), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&PlatformError::TooLarge { limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&PlatformError::Backend("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn id_lists() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(parse_ids(&format!("{a}, {b},")).unwrap(), vec![a, b]);
        assert!(parse_ids("nope").is_err());
    }
}
