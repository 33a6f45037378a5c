//! Cinedex REST server.
//!
//! A small HTTP/1 server over the movie store. Single-movie reads go through
//! the batched loader, so concurrent requests for movies in the same tick
//! share one read of the data file. Mutations check a [`Policy`] against the
//! caller's bearer token before touching the store.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use url::form_urlencoded;

use cinedex_auth::{AuthError, Identity, Policy, Role, UserDirectory};
use cinedex_loader::{LoadError, Loader, LoaderConfig};
use cinedex_storage::{
    Movie, MovieDraft, MoviePatch, MovieStore, ReviewDraft, ReviewPatch, StoreConfig, StoreError,
};

#[derive(Debug, Clone)]
pub(crate) struct ServerConfig {
    pub listen: SocketAddr,
    pub data_path: PathBuf,
    pub loader: LoaderConfig,
    pub ready_file: Option<PathBuf>,
    /// Admin account created at startup, as `(email, password)`
    pub admin: Option<(String, String)>,
    pub session_ttl: Duration,
}

struct ServerState {
    store: MovieStore,
    loader: Loader<MovieStore>,
    users: UserDirectory,
}

// ============================================================================
// Errors
// ============================================================================

/// A failure already mapped onto an HTTP status.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::MovieNotFound(_) | StoreError::ReviewNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Io { .. } | StoreError::Corrupt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match &err {
            AuthError::AuthenticationRequired | AuthError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AuthError::AlreadyExists(_) => StatusCode::CONFLICT,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

impl From<LoadError> for ApiError {
    fn from(err: LoadError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

type ApiResult = std::result::Result<Response<Full<Bytes>>, ApiError>;

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReviewBody {
    rating: f64,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    email: String,
    password: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user_id: String,
    role: Role,
    email: Option<String>,
    name: Option<String>,
}

// ============================================================================
// Server loop
// ============================================================================

pub(crate) fn cmd_serve(config: ServerConfig) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;

    rt.block_on(async move { serve_async(config).await })
}

async fn serve_async(config: ServerConfig) -> Result<()> {
    let store = MovieStore::new(StoreConfig {
        data_path: config.data_path.clone(),
        ..Default::default()
    });

    // Fail fast on an unreadable data file instead of on the first request.
    let initial = tokio::task::spawn_blocking({
        let store = store.clone();
        move || store.all()
    })
    .await
    .map_err(|e| anyhow!("serve: failed to join loader task: {e}"))??;
    tracing::info!(
        path = %config.data_path.display(),
        movies = initial.len(),
        "movie file loaded"
    );

    let users = UserDirectory::with_session_ttl(config.session_ttl);
    if let Some((email, password)) = config.admin.as_ref() {
        users
            .register_with_role(email, password, "admin", Role::Admin)
            .map_err(|e| anyhow!("serve: failed to create admin account: {e}"))?;
    }

    let state = Arc::new(ServerState {
        loader: Loader::with_config(store.clone(), config.loader.clone()),
        store,
        users,
    });

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| anyhow!("serve: failed to bind {}: {e}", config.listen))?;
    let bound = listener
        .local_addr()
        .map_err(|e| anyhow!("serve: failed to read bound addr: {e}"))?;

    tracing::info!("listening on http://{bound}");
    if let Some(path) = config.ready_file.as_ref() {
        let payload = serde_json::json!({
            "addr": bound.to_string(),
            "pid": std::process::id(),
        });
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    }

    loop {
        let (stream, _peer) = listener
            .accept()
            .await
            .map_err(|e| anyhow!("serve: accept failed: {e}"))?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::warn!("connection error: {e}");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let params = parse_query_params(req.uri().query());
    let token = bearer_token(&req);
    let caller = token.as_deref().and_then(|t| state.users.identify(t));
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    tracing::debug!(
        %method,
        %path,
        user = caller.as_ref().map(|c| c.user_id.as_str()),
        "request"
    );

    let body = if matches!(method, Method::POST | Method::PUT) {
        req.into_body().collect().await?.to_bytes()
    } else {
        Bytes::new()
    };

    let result = route(
        &state,
        &method,
        &segments,
        &params,
        caller.as_ref(),
        token.as_deref(),
        &body,
    )
    .await;

    Ok(result.unwrap_or_else(|e| {
        if e.status.is_server_error() {
            tracing::error!(%method, %path, error = %e.message, "request failed");
        }
        json_error(e.status, &e.message)
    }))
}

async fn route(
    state: &Arc<ServerState>,
    method: &Method,
    segments: &[&str],
    params: &HashMap<String, String>,
    caller: Option<&Identity>,
    token: Option<&str>,
    body: &[u8],
) -> ApiResult {
    // Reads are open to everyone; each mutation checks its own policy below.
    if *method == Method::GET {
        Policy::Public.check(caller)?;
    }

    match (method, segments) {
        (&Method::GET, ["healthz"]) => Ok(text_response(StatusCode::OK, "ok\n")),

        (&Method::GET, ["api", "movies"]) => list_movies(state, params).await,
        (&Method::GET, ["api", "movies", "top"]) => {
            let limit = parse_limit(params)?;
            blocking(state, move |s| s.store.top_rated(limit))
                .await
                .map(|v| json_response(StatusCode::OK, &v))
        }
        (&Method::GET, ["api", "movies", "recent"]) => {
            let limit = parse_limit(params)?;
            blocking(state, move |s| s.store.recent(limit))
                .await
                .map(|v| json_response(StatusCode::OK, &v))
        }
        (&Method::GET, ["api", "movies", "batch"]) => movies_batch(state, params).await,
        (&Method::GET, ["api", "movies", id]) => get_movie(state, id).await,
        (&Method::POST, ["api", "movies"]) => add_movie(state, caller, body).await,
        (&Method::PUT, ["api", "movies", id]) => update_movie(state, caller, id, body).await,
        (&Method::DELETE, ["api", "movies", id]) => delete_movie(state, caller, id).await,
        (&Method::POST, ["api", "movies", id, "reviews"]) => {
            add_review(state, caller, id, body).await
        }
        (&Method::PUT, ["api", "reviews", id]) => update_review(state, caller, id, body).await,
        (&Method::DELETE, ["api", "reviews", id]) => delete_review(state, caller, id).await,

        (&Method::POST, ["api", "auth", "register"]) => register(state, body),
        (&Method::POST, ["api", "auth", "login"]) => login(state, body),
        (&Method::POST, ["api", "auth", "logout"]) => logout(state, token),
        (&Method::GET, ["api", "me"]) => Ok(me(state, caller)),

        _ => Err(ApiError::new(StatusCode::NOT_FOUND, "not found")),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_movies(state: &Arc<ServerState>, params: &HashMap<String, String>) -> ApiResult {
    let movies = if let Some(genre) = params.get("genre").cloned() {
        blocking(state, move |s| s.store.by_genre(&genre)).await?
    } else if let Some(year) = params.get("year") {
        let year: i32 = year
            .parse()
            .map_err(|_| ApiError::bad_request(format!("invalid year `{year}`")))?;
        blocking(state, move |s| s.store.by_year(year)).await?
    } else if let Some(language) = params.get("language").cloned() {
        blocking(state, move |s| s.store.by_language(&language)).await?
    } else if let Some(query) = params.get("search").cloned() {
        blocking(state, move |s| s.store.search(&query)).await?
    } else {
        blocking(state, |s| s.store.all()).await?
    };
    Ok(json_response(StatusCode::OK, &movies))
}

async fn get_movie(state: &Arc<ServerState>, id: &str) -> ApiResult {
    match state.loader.load(id.to_string()).await? {
        Some(movie) => Ok(json_response(StatusCode::OK, &movie)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "Movie not found")),
    }
}

/// `?ids=1,2,3` → one loader batch; unknown ids come back as `null`.
async fn movies_batch(state: &Arc<ServerState>, params: &HashMap<String, String>) -> ApiResult {
    let ids: Vec<String> = params
        .get("ids")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return Err(ApiError::bad_request("missing `ids` query parameter"));
    }

    let movies = state.loader.load_many(ids).await?;
    Ok(json_response(StatusCode::OK, &movies))
}

async fn add_movie(state: &Arc<ServerState>, caller: Option<&Identity>, body: &[u8]) -> ApiResult {
    Policy::Authenticated.check(caller)?;
    let draft: MovieDraft = parse_body(body)?;
    let created_by = caller.map(|c| c.user_id.clone());
    let movie = blocking(state, move |s| s.store.add(draft, created_by)).await?;
    Ok(json_response(StatusCode::CREATED, &movie))
}

async fn update_movie(
    state: &Arc<ServerState>,
    caller: Option<&Identity>,
    id: &str,
    body: &[u8],
) -> ApiResult {
    let existing = require_movie(state, caller, id).await?;
    Policy::CreatorOrAdmin {
        creator: existing.created_by,
    }
    .check(caller)?;

    let patch: MoviePatch = parse_body(body)?;
    let id = id.to_string();
    let movie = blocking(state, move |s| s.store.update(&id, patch)).await?;
    Ok(json_response(StatusCode::OK, &movie))
}

async fn delete_movie(state: &Arc<ServerState>, caller: Option<&Identity>, id: &str) -> ApiResult {
    let existing = require_movie(state, caller, id).await?;
    Policy::CreatorOrAdmin {
        creator: existing.created_by,
    }
    .check(caller)?;

    let id = id.to_string();
    let movie = blocking(state, move |s| s.store.delete(&id)).await?;
    Ok(json_response(StatusCode::OK, &movie))
}

async fn add_review(
    state: &Arc<ServerState>,
    caller: Option<&Identity>,
    movie_id: &str,
    body: &[u8],
) -> ApiResult {
    Policy::Authenticated.check(caller)?;
    let reviewer = caller
        .map(|c| c.user_id.clone())
        .ok_or(AuthError::AuthenticationRequired)?;
    let ReviewBody { rating, comment } = parse_body(body)?;

    let draft = ReviewDraft {
        movie_id: movie_id.to_string(),
        rating,
        comment,
        reviewer,
    };
    let review = blocking(state, move |s| s.store.add_review(draft)).await?;
    Ok(json_response(StatusCode::CREATED, &review))
}

async fn update_review(
    state: &Arc<ServerState>,
    caller: Option<&Identity>,
    id: &str,
    body: &[u8],
) -> ApiResult {
    review_policy(state, caller, id).await?;
    let patch: ReviewPatch = parse_body(body)?;
    let id = id.to_string();
    let review = blocking(state, move |s| s.store.update_review(&id, patch)).await?;
    Ok(json_response(StatusCode::OK, &review))
}

async fn delete_review(state: &Arc<ServerState>, caller: Option<&Identity>, id: &str) -> ApiResult {
    review_policy(state, caller, id).await?;
    let id = id.to_string();
    let review = blocking(state, move |s| s.store.delete_review(&id)).await?;
    Ok(json_response(StatusCode::OK, &review))
}

fn register(state: &Arc<ServerState>, body: &[u8]) -> ApiResult {
    let RegisterBody {
        email,
        password,
        name,
    } = parse_body(body)?;
    let session = state.users.register(&email, &password, &name)?;
    Ok(json_response(StatusCode::CREATED, &session))
}

fn login(state: &Arc<ServerState>, body: &[u8]) -> ApiResult {
    let LoginBody { email, password } = parse_body(body)?;
    let session = state.users.login(&email, &password)?;
    Ok(json_response(StatusCode::OK, &session))
}

fn logout(state: &Arc<ServerState>, token: Option<&str>) -> ApiResult {
    let token = token.ok_or(AuthError::AuthenticationRequired)?;
    if !state.users.logout(token) {
        return Err(AuthError::AuthenticationRequired.into());
    }
    Ok(json_response(StatusCode::OK, &serde_json::json!({ "loggedOut": true })))
}

fn me(state: &Arc<ServerState>, caller: Option<&Identity>) -> Response<Full<Bytes>> {
    let Some(caller) = caller else {
        return json_response(StatusCode::OK, &serde_json::Value::Null);
    };
    let user = state.users.user(&caller.user_id);
    json_response(
        StatusCode::OK,
        &MeResponse {
            user_id: caller.user_id.clone(),
            role: caller.role,
            email: user.as_ref().map(|u| u.email.clone()),
            name: user.map(|u| u.name),
        },
    )
}

/// Authentication is checked before existence so anonymous callers can't
/// discover which ids exist.
async fn require_movie(
    state: &Arc<ServerState>,
    caller: Option<&Identity>,
    id: &str,
) -> std::result::Result<Movie, ApiError> {
    Policy::Authenticated.check(caller)?;
    state
        .loader
        .load(id.to_string())
        .await?
        .ok_or_else(|| StoreError::MovieNotFound(id.to_string()).into())
}

async fn review_policy(
    state: &Arc<ServerState>,
    caller: Option<&Identity>,
    id: &str,
) -> std::result::Result<(), ApiError> {
    Policy::Authenticated.check(caller)?;
    let lookup = id.to_string();
    let review = blocking(state, move |s| s.store.find_review(&lookup))
        .await?
        .ok_or_else(|| StoreError::ReviewNotFound(id.to_string()))?;
    Policy::ReviewerOnly {
        reviewer: review.reviewer,
    }
    .check(caller)?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Run a synchronous store call off the async workers.
async fn blocking<T, F>(state: &Arc<ServerState>, f: F) -> std::result::Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&ServerState) -> std::result::Result<T, StoreError> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(ApiError::from)
}

fn bearer_token(req: &Request<Incoming>) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?;
    Some(token.trim().to_string())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> std::result::Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("failed to parse request JSON: {e}")))
}

fn parse_limit(params: &HashMap<String, String>) -> std::result::Result<Option<usize>, ApiError> {
    params
        .get("limit")
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| ApiError::bad_request(format!("invalid limit `{v}`")))
        })
        .transpose()
}

fn parse_query_params(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query else {
        return HashMap::new();
    };
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"internal error"))))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{\"error\":\"serialize\"}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| {
            Response::new(Full::new(Bytes::from_static(b"{\"error\":\"internal\"}")))
        })
}

fn json_error(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    let v = serde_json::json!({ "error": msg });
    json_response(status, &v)
}

/// `--batch-delay-ms` as a `Duration`.
pub(crate) fn batch_delay(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
