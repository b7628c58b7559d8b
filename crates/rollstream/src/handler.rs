//! HTTP route handlers.
//!
//! Thin glue: each handler authenticates the caller, validates its input,
//! and hands off to the room or session layer. Credentials arrive as
//! `Authorization: Bearer <session id>`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use rollstream_protocol::{
    Event, EventDiff, EventId, EventKind, PlayerDiff, PlayerId, PlayerInfo, RoomId, SessionId,
};
use rollstream_room::{EventPage, RoomError};
use rollstream_session::Session;
use rollstream_store::{Backend, Bound, ParseBoundError};
use serde::{Deserialize, Serialize};

use crate::dice;
use crate::server::ServerState;
use crate::RollstreamError;

type AppState<B> = State<Arc<ServerState<B>>>;

// ---------------------------------------------------------------------------
// Request and response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "gameID")]
    pub game_id: String,
    #[serde(rename = "playerName")]
    pub player_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "playerID")]
    pub player_id: PlayerId,
    pub session: SessionId,
    /// Id of the player's join event; clients page backwards from here.
    #[serde(rename = "newestEventID")]
    pub newest_event_id: EventId,
    pub game: GameInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub id: RoomId,
    pub players: Vec<PlayerInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub newest: Option<String>,
    pub oldest: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollRequest {
    pub count: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub edge: bool,
    #[serde(default)]
    pub glitchy: i32,
}

#[derive(Debug, Deserialize)]
pub struct RerollRequest {
    #[serde(rename = "rollID")]
    pub roll_id: EventId,
}

#[derive(Debug, Deserialize)]
pub struct InitiativeRequest {
    #[serde(default)]
    pub title: String,
    pub base: i32,
    pub dice: u8,
}

#[derive(Debug, Deserialize)]
pub struct ModifyRollRequest {
    pub id: EventId,
    pub diff: RollDiff,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollDiff {
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRollRequest {
    pub id: EventId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Posted {
    pub id: EventId,
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The session id from an `Authorization: Bearer` header, if any.
pub(crate) fn bearer_session(headers: &HeaderMap) -> Option<SessionId> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| SessionId(token.to_string()))
}

/// Validates a presented session id and checks that its room still
/// exists.
///
/// Every failure, including a room that has gone, surfaces as the same
/// `401`; see [`RollstreamError::status`].
pub(crate) async fn authenticate<B: Backend>(
    state: &ServerState<B>,
    presented: Option<SessionId>,
) -> Result<Session, RollstreamError> {
    let id = presented.ok_or(RollstreamError::MissingSession)?;
    let session = state.sessions.get(&id).await?;
    if !state.roster.exists(&session.room).await? {
        tracing::debug!(room = %session.room, "session outlived its room");
        return Err(RoomError::RoomNotFound(session.room).into());
    }
    Ok(session)
}

// ---------------------------------------------------------------------------
// Auth routes
// ---------------------------------------------------------------------------

pub(crate) async fn health() -> &'static str {
    "OK"
}

/// `POST /auth/login`: joins a room as a new player and issues a session.
pub(crate) async fn login<B: Backend>(
    State(state): AppState<B>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, RollstreamError> {
    let name = request.player_name.trim();
    if !PlayerInfo::valid_name(name) {
        return Err(RollstreamError::BadRequest("invalid player name".into()));
    }
    let room = RoomId::new(request.game_id);
    if !state.roster.exists(&room).await? {
        return Err(RoomError::RoomNotFound(room).into());
    }

    let info = PlayerInfo {
        id: PlayerId::generate(),
        name: name.to_string(),
        hue: dice::random_hue(&mut rand::rng()),
    };

    // Roster write last; abandon_login rolls back the earlier steps.
    let session = state.sessions.create(&room, &info.id, &info.name).await?;
    let joined = match state
        .log
        .append_new(&room, |id| Event {
            id,
            player_id: info.id.clone(),
            player_name: info.name.clone(),
            edited_at: 0,
            kind: EventKind::PlayerJoin,
        })
        .await
    {
        Ok(event) => event,
        Err(e) => {
            abandon_login(&state, &session, None).await;
            return Err(e.into());
        }
    };
    if let Err(e) = state.roster.add_player(&room, &info).await {
        abandon_login(&state, &session, Some(joined.id)).await;
        return Err(e.into());
    }
    let players = state.roster.players(&room).await?;

    tracing::info!(%room, player = %info.id, "player logged in");
    Ok(Json(LoginResponse {
        player_id: info.id,
        session: session.id,
        newest_event_id: joined.id,
        game: GameInfo { id: room, players },
    }))
}

/// Undoes whatever a failed login already wrote. Best effort: the
/// original error is what the client gets.
async fn abandon_login<B: Backend>(
    state: &ServerState<B>,
    session: &Session,
    joined: Option<EventId>,
) {
    if let Some(id) = joined {
        if let Err(e) = state.log.delete(&session.room, id).await {
            tracing::warn!(room = %session.room, %id, error = %e, "could not retract join event");
        }
    }
    if let Err(e) = state.sessions.destroy(session).await {
        tracing::warn!(room = %session.room, error = %e, "could not discard session");
    }
    tracing::info!(room = %session.room, player = %session.player_id, "login abandoned");
}

/// `POST /auth/logout`: destroys the caller's session.
pub(crate) async fn logout<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
) -> Result<StatusCode, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    state.sessions.destroy(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Game routes
// ---------------------------------------------------------------------------

/// `GET /game/info`
pub(crate) async fn info<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
) -> Result<Json<GameInfo>, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    let players = state.roster.players(&session.room).await?;
    Ok(Json(GameInfo {
        id: session.room,
        players,
    }))
}

/// `GET /game/events?newest=<id>&oldest=<id>`: one page of history,
/// newest first.
pub(crate) async fn events<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Result<Json<EventPage>, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    let newest = parse_bound(query.newest.as_deref(), Bound::parse_newest)?;
    let oldest = parse_bound(query.oldest.as_deref(), Bound::parse_oldest)?;

    let page = state
        .log
        .range(&session.room, newest, oldest, state.config.room.max_page_size)
        .await?;
    tracing::debug!(room = %session.room, count = page.events.len(), more = page.more, "events listed");
    Ok(Json(page))
}

fn parse_bound(
    raw: Option<&str>,
    parse: fn(&str) -> Result<Bound, ParseBoundError>,
) -> Result<Bound, RollstreamError> {
    match raw {
        None => Ok(Bound::Unbounded),
        Some(raw) => parse(raw).map_err(|e| RollstreamError::BadRequest(e.to_string())),
    }
}

/// `POST /game/roll`: a plain or edge roll.
pub(crate) async fn roll<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
    Json(request): Json<RollRequest>,
) -> Result<Json<Posted>, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    if request.count == 0 || request.count > state.config.dice.max_single_roll {
        return Err(RollstreamError::BadRequest("roll count out of range".into()));
    }

    let count = request.count as usize;
    let kind = {
        let mut rng = rand::rng();
        if request.edge {
            EventKind::EdgeRoll {
                title: request.title,
                rounds: dice::exploding_sixes(&mut rng, count),
                glitchy: request.glitchy,
            }
        } else {
            EventKind::Roll {
                title: request.title,
                dice: dice::roll(&mut rng, count),
                glitchy: request.glitchy,
            }
        }
    };

    let event = post_event(&state, &session, kind).await?;
    Ok(Json(Posted { id: event.id }))
}

/// `POST /game/reroll`: rerolls the failures of one of the caller's own
/// plain rolls.
pub(crate) async fn reroll<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
    Json(request): Json<RerollRequest>,
) -> Result<Json<Posted>, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    let previous = authored_event(&state, &session, request.roll_id).await?;
    let EventKind::Roll { title, dice: previous_dice, glitchy } = previous.kind else {
        return Err(RollstreamError::BadRequest("only plain rolls can be rerolled".into()));
    };

    let rerolled = dice::reroll_failures(&mut rand::rng(), &previous_dice);
    let kind = EventKind::RerollFailures {
        prev_id: previous.id,
        title,
        rounds: vec![rerolled, previous_dice],
        glitchy,
    };
    let event = post_event(&state, &session, kind).await?;
    Ok(Json(Posted { id: event.id }))
}

/// `POST /game/initiative`
pub(crate) async fn initiative<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
    Json(request): Json<InitiativeRequest>,
) -> Result<Json<Posted>, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    let limits = &state.config.dice;
    if request.dice == 0 || request.dice > limits.max_initiative_dice {
        return Err(RollstreamError::BadRequest("initiative dice out of range".into()));
    }
    if request.base < limits.min_initiative_base {
        return Err(RollstreamError::BadRequest("initiative base too low".into()));
    }

    let kind = EventKind::InitiativeRoll {
        title: request.title,
        base: request.base,
        dice: dice::roll(&mut rand::rng(), request.dice as usize),
    };
    let event = post_event(&state, &session, kind).await?;
    Ok(Json(Posted { id: event.id }))
}

/// `POST /game/modify-roll`: renames one of the caller's events.
pub(crate) async fn modify_roll<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
    Json(request): Json<ModifyRollRequest>,
) -> Result<Json<Event>, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    let Some(title) = request.diff.title else {
        return Err(RollstreamError::BadRequest("nothing to change".into()));
    };
    authored_event(&state, &session, request.id).await?;

    let edited = state
        .log
        .update(&session.room, request.id, &EventDiff::Title(title))
        .await?;
    tracing::info!(room = %session.room, id = %request.id, "event renamed");
    Ok(Json(edited))
}

/// `POST /game/delete-roll`: deletes one of the caller's events.
pub(crate) async fn delete_roll<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
    Json(request): Json<DeleteRollRequest>,
) -> Result<StatusCode, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    authored_event(&state, &session, request.id).await?;

    state.log.delete(&session.room, request.id).await?;
    tracing::info!(room = %session.room, id = %request.id, "event deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Player routes
// ---------------------------------------------------------------------------

/// `POST /player/update`: changes the caller's name or hue.
pub(crate) async fn update_player<B: Backend>(
    State(state): AppState<B>,
    headers: HeaderMap,
    Json(diff): Json<PlayerDiff>,
) -> Result<Json<PlayerInfo>, RollstreamError> {
    let session = authenticate(&state, bearer_session(&headers)).await?;
    if diff.is_empty() {
        return Err(RollstreamError::BadRequest("nothing to change".into()));
    }
    if diff.name.as_deref().is_some_and(|name| !PlayerInfo::valid_name(name)) {
        return Err(RollstreamError::BadRequest("invalid player name".into()));
    }
    if diff.hue.is_some_and(|hue| !(0..360).contains(&hue)) {
        return Err(RollstreamError::BadRequest("hue must be in 0..360".into()));
    }

    let info = state
        .roster
        .update_player(&session.room, &session.player_id, &diff)
        .await?;
    Ok(Json(info))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Appends a new event authored by the session's player.
async fn post_event<B: Backend>(
    state: &ServerState<B>,
    session: &Session,
    kind: EventKind,
) -> Result<Event, RollstreamError> {
    let event = state
        .log
        .append_new(&session.room, |id| Event {
            id,
            player_id: session.player_id.clone(),
            player_name: session.player_name.clone(),
            edited_at: 0,
            kind: kind.clone(),
        })
        .await?;
    tracing::info!(
        room = %session.room,
        player = %session.player_id,
        id = %event.id,
        ty = event.kind.tag(),
        "event posted"
    );
    Ok(event)
}

/// Loads a live event, rejecting it unless the session's player wrote it.
async fn authored_event<B: Backend>(
    state: &ServerState<B>,
    session: &Session,
    id: EventId,
) -> Result<Event, RollstreamError> {
    let event = state.log.get_by_id(&session.room, id).await?;
    if event.player_id != session.player_id {
        return Err(RollstreamError::Unauthorized(format!(
            "event {id} belongs to another player"
        )));
    }
    Ok(event)
}
