//! `RollstreamServer` builder, shared state, and router.
//!
//! This is the entry point for running a Rollstream server. It ties
//! together all the layers: HTTP/SSE → session → room/bridge → store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use rollstream_protocol::RoomId;
use rollstream_room::{EventLog, IdGenerator, Roster};
use rollstream_session::SessionManager;
use rollstream_store::{Backend, Clock};
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::handler;
use crate::rate_limit::{RateLimiter, limit_requests};
use crate::sse;
use crate::{RollstreamError, ServerConfig};

/// Shared server state passed to each request handler.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. Every
/// component gets its backend handed in here; none holds a global.
pub struct ServerState<B: Backend> {
    pub(crate) backend: B,
    pub(crate) log: EventLog<B>,
    pub(crate) roster: Roster<B>,
    pub(crate) sessions: Arc<SessionManager<B>>,
    pub(crate) limiter: RateLimiter<B>,
    pub(crate) config: ServerConfig,
}

impl<B: Backend> ServerState<B> {
    pub fn new(backend: B, clock: Clock, config: ServerConfig) -> Self {
        let ids = Arc::new(IdGenerator::new(clock));
        Self {
            log: EventLog::new(backend.clone(), ids, config.room.clone()),
            roster: Roster::new(backend.clone(), config.room.clone()),
            sessions: Arc::new(SessionManager::new(
                backend.clone(),
                clock,
                config.session.clone(),
            )),
            limiter: RateLimiter::new(backend.clone(), clock, config.rate_limit.clone()),
            backend,
            config,
        }
    }

    pub fn log(&self) -> &EventLog<B> {
        &self.log
    }

    pub fn roster(&self) -> &Roster<B> {
        &self.roster
    }

    pub fn sessions(&self) -> &SessionManager<B> {
        &self.sessions
    }
}

/// Builds the HTTP router over `state`.
///
/// Every route is rate limited, tagged with a request id in the logs, and
/// served with `no-cache`/`nosniff` headers.
pub fn router<B: Backend>(state: Arc<ServerState<B>>) -> Router {
    Router::new()
        .route("/health", get(handler::health))
        .route("/auth/login", post(handler::login::<B>))
        .route("/auth/logout", post(handler::logout::<B>))
        .route("/game/info", get(handler::info::<B>))
        .route("/game/events", get(handler::events::<B>))
        .route("/game/subscription", get(sse::subscription::<B>))
        .route("/game/roll", post(handler::roll::<B>))
        .route("/game/reroll", post(handler::reroll::<B>))
        .route("/game/initiative", post(handler::initiative::<B>))
        .route("/game/modify-roll", post(handler::modify_roll::<B>))
        .route("/game/delete-roll", post(handler::delete_roll::<B>))
        .route("/player/update", post(handler::update_player::<B>))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            limit_requests::<B>,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(trace_request))
        .with_state(state)
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

async fn trace_request(request: Request, next: Next) -> Response {
    let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    async move {
        let response = next.run(request).await;
        tracing::debug!(status = response.status().as_u16(), "response");
        response
    }
    .instrument(span)
    .await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a Rollstream server.
///
/// # Example
///
/// ```rust,ignore
/// use rollstream::prelude::*;
///
/// let backend = RedisBackend::connect("redis://127.0.0.1:6379").await?;
/// let server = RollstreamServerBuilder::new()
///     .bind("0.0.0.0:3001")
///     .seed_rooms(["test1", "test2"])
///     .build(backend)
///     .await?;
/// server.run().await
/// ```
pub struct RollstreamServerBuilder {
    bind_addr: String,
    config: ServerConfig,
    clock: Option<Clock>,
    seed_rooms: Vec<RoomId>,
}

impl RollstreamServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            config: ServerConfig::default(),
            clock: None,
            seed_rooms: Vec::new(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the system clock (tests run on paused tokio time).
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Rooms created at startup if missing.
    pub fn seed_rooms<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_rooms.extend(rooms.into_iter().map(RoomId::new));
        self
    }

    /// Seeds rooms, binds the listener, and returns the ready server.
    pub async fn build<B: Backend>(
        self,
        backend: B,
    ) -> Result<RollstreamServer<B>, RollstreamError> {
        let clock = self.clock.unwrap_or_else(Clock::system);
        let state = Arc::new(ServerState::new(backend, clock, self.config));

        for room in &self.seed_rooms {
            if !state.roster.exists(room).await? {
                state.roster.create_room(room).await?;
            }
        }

        let listener = TcpListener::bind(&self.bind_addr).await?;
        Ok(RollstreamServer { listener, state })
    }
}

impl Default for RollstreamServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Rollstream server.
///
/// Call [`run()`](Self::run) to start serving requests.
pub struct RollstreamServer<B: Backend> {
    listener: TcpListener,
    state: Arc<ServerState<B>>,
}

impl<B: Backend> RollstreamServer<B> {
    /// Creates a new builder.
    pub fn builder() -> RollstreamServerBuilder {
        RollstreamServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState<B>> {
        &self.state
    }

    /// Serves requests until the process is terminated.
    pub async fn run(self) -> Result<(), RollstreamError> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "Rollstream server running");

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}
