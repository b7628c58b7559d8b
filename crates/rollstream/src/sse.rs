//! Server-sent events transport for room subscriptions.
//!
//! `GET /game/subscription` attaches a [`Bridge`] to the caller's room and
//! turns each bridge message into an SSE frame:
//!
//! | Bridge message | SSE event | data                 |
//! |----------------|-----------|----------------------|
//! | `Event`        | `event`   | serialized event     |
//! | `Update`       | `update`  | serialized update    |
//! | `Keepalive`    | `ping`    | `hi`                 |
//!
//! The first frame only carries the client reconnect delay. The caller's
//! session is pinned for as long as the stream is open.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use futures_util::Stream;
use rollstream_bridge::{Bridge, BridgeMessage};
use rollstream_protocol::SessionId;
use rollstream_session::{Session, SessionManager};
use rollstream_store::Backend;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::RollstreamError;
use crate::handler::{authenticate, bearer_session};
use crate::server::ServerState;

/// `EventSource` cannot set headers, so the session may come as a query
/// parameter instead.
#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionQuery {
    pub session: Option<String>,
}

/// Drop guard that ends the bridge and unpins the session when the stream
/// goes away.
///
/// The body stream is dropped by the server when the client disconnects,
/// which may happen before the stream is ever polled. Since `Drop` is
/// synchronous, the unpin runs in a fire-and-forget task.
struct StreamGuard<B: Backend> {
    cancel: CancellationToken,
    session: Session,
    sessions: Arc<SessionManager<B>>,
}

impl<B: Backend> Drop for StreamGuard<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
        let session = self.session.clone();
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            if let Err(e) = sessions.unpin(&session).await {
                tracing::debug!(player = %session.player_id, error = %e, "unpin after stream failed");
            }
        });
    }
}

/// `GET /game/subscription`
pub(crate) async fn subscription<B: Backend>(
    State(state): State<Arc<ServerState<B>>>,
    headers: HeaderMap,
    Query(query): Query<SubscriptionQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, RollstreamError> {
    let presented = bearer_session(&headers).or_else(|| query.session.map(SessionId));
    let session = authenticate(&state, presented).await?;

    let cancel = CancellationToken::new();
    let (bridge, mut rx) = Bridge::attach(
        &state.backend,
        &session.room,
        state.config.stream.bridge_config(),
        cancel.clone(),
    )
    .await?;

    if let Err(e) = state.sessions.pin(&session).await {
        cancel.cancel();
        return Err(e.into());
    }
    tracing::info!(room = %session.room, player = %session.player_id, "stream opened");

    let room = session.room.clone();
    tokio::spawn(async move {
        let reason = bridge.closed().await;
        tracing::info!(%room, %reason, "stream closed");
    });

    let guard = StreamGuard {
        cancel,
        session,
        sessions: Arc::clone(&state.sessions),
    };
    let client_retry = state.config.stream.client_retry;

    let stream = stream! {
        let _guard = guard;
        yield Ok(SseEvent::default().retry(client_retry));

        while let Some(message) = rx.recv().await {
            yield Ok(frame(message));
        }
    };

    Ok(Sse::new(stream))
}

fn frame(message: BridgeMessage) -> SseEvent {
    match message {
        BridgeMessage::Event(payload) => SseEvent::default().event("event").data(payload),
        BridgeMessage::Update(payload) => SseEvent::default().event("update").data(payload),
        BridgeMessage::Keepalive => SseEvent::default().event("ping").data("hi"),
    }
}
