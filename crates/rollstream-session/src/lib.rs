//! Session management for Rollstream.
//!
//! This crate handles the lifecycle of player credentials:
//!
//! 1. **Issuing**: [`SessionManager::create`] after a player logs in
//! 2. **Validating**: [`SessionManager::get`] on every request
//! 3. **Pinning**: a session stays alive for as long as its owner has a
//!    stream open ([`SessionManager::pin`] / [`SessionManager::unpin`])
//! 4. **Revoking**: one at a time ([`SessionManager::destroy`]) or all at
//!    once by bumping the [`AuthEpoch`]
//!
//! # How it fits in the stack
//!
//! ```text
//! HTTP / SSE layer (above)  ← validates the bearer session on each request
//!     ↕
//! Session layer (this crate)
//!     ↕
//! Store layer (below)  ← session hashes with TTLs, the epoch counter
//! ```

mod auth;
mod error;
mod manager;
mod session;

pub use auth::AuthEpoch;
pub use error::SessionError;
pub use manager::SessionManager;
pub use session::{Session, SessionConfig, SessionState};
