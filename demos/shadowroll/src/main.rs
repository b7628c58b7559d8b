use std::time::Duration;

use clap::{Parser, ValueEnum};
use rollstream::prelude::*;
use rollstream_store::RedisBackend;

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// Shadowroll: a dice-rolling room server on top of Rollstream.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "ROLLSTREAM_BIND", default_value = "0.0.0.0:3001")]
    bind: String,

    /// Redis-compatible store to connect to.
    #[arg(long, env = "ROLLSTREAM_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Keep everything in process memory instead of Redis.
    #[arg(long, env = "ROLLSTREAM_IN_MEMORY")]
    in_memory: bool,

    /// Rooms created at startup if they don't exist.
    #[arg(long, env = "ROLLSTREAM_GAME_NAMES", value_delimiter = ',', default_value = "test1,test2")]
    game_names: Vec<String>,

    /// Idle session lifetime in seconds.
    #[arg(long, env = "ROLLSTREAM_SESSION_TTL_SECS", default_value_t = 15 * 60)]
    session_ttl_secs: u64,

    /// Seconds between SSE pings.
    #[arg(long, env = "ROLLSTREAM_SSE_PING_SECS", default_value_t = 20)]
    sse_ping_secs: u64,

    /// Reconnect delay suggested to SSE clients, in seconds.
    #[arg(long, env = "ROLLSTREAM_SSE_CLIENT_RETRY_SECS", default_value_t = 5)]
    sse_client_retry_secs: u64,

    /// Requests allowed per client per rate-limit window.
    #[arg(long, env = "ROLLSTREAM_RATE_LIMIT", default_value_t = 120)]
    rate_limit: i64,

    /// Rate-limit window in seconds.
    #[arg(long, env = "ROLLSTREAM_RATE_WINDOW_SECS", default_value_t = 60)]
    rate_window_secs: u64,

    /// Largest dice pool per roll.
    #[arg(long, env = "ROLLSTREAM_MAX_SINGLE_ROLL", default_value_t = 100)]
    max_single_roll: u32,

    /// Run a one-off administrative task and exit instead of serving.
    #[arg(long, value_enum)]
    task: Option<Task>,

    /// Room to create with `--task create-room`.
    #[arg(long, required_if_eq("task", "create-room"))]
    room: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Task {
    /// Revoke every outstanding session.
    BumpAuthEpoch,
    /// Create the room named by `--room`.
    CreateRoom,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.session.ttl = Duration::from_secs(self.session_ttl_secs);
        config.stream.ping_interval = Duration::from_secs(self.sse_ping_secs);
        config.stream.client_retry = Duration::from_secs(self.sse_client_retry_secs);
        config.rate_limit.max_requests = self.rate_limit;
        config.rate_limit.window = Duration::from_secs(self.rate_window_secs);
        config.dice.max_single_roll = self.max_single_roll;
        config
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

async fn run<B: Backend>(args: &Args, backend: B) -> Result<(), RollstreamError> {
    let config = args.server_config();
    match args.task {
        Some(Task::BumpAuthEpoch) => {
            let epoch = AuthEpoch::new(backend, config.session.store_retries)
                .bump()
                .await?;
            tracing::info!(epoch, "auth epoch bumped, all sessions revoked");
            Ok(())
        }
        Some(Task::CreateRoom) => {
            let Some(room) = &args.room else {
                return Err(RollstreamError::BadRequest("--room is required".into()));
            };
            Roster::new(backend, config.room)
                .create_room(&RoomId::new(room.as_str()))
                .await?;
            Ok(())
        }
        None => {
            let server = RollstreamServerBuilder::new()
                .bind(&args.bind)
                .config(config)
                .seed_rooms(args.game_names.iter().map(String::as_str))
                .build(backend)
                .await?;
            server.run().await
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    rollstream::logging::init(&LogConfig::default())?;

    if args.in_memory {
        tracing::warn!("using the in-memory store; nothing survives a restart");
        run(&args, MemoryBackend::new()).await?;
    } else {
        let backend = RedisBackend::connect(&args.redis_url).await?;
        run(&args, backend).await?;
    }
    Ok(())
}
