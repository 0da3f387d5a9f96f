//! Credential pool for Copilot accounts
//!
//! Resolves the configured GitHub credentials into an ordered pool, rotates
//! the active credential round-robin when the backend answers 429, and keeps
//! a Copilot session token for the active credential fresh.
//!
//! Account lifecycle:
//! 1. `source::load_pool()` resolves records from inline list, file, or fallback
//! 2. `AccountPool::current()` is the credential every request is sent with
//! 3. Backend 429 → `rotate_if_current()` marks the credential cooled down and
//!    advances exactly one slot
//! 4. `SessionManager` re-exchanges the session token for the new credential
//!    and replaces the refresh schedule
//! 5. A 2xx on a credential, or an admin reset, clears its cooldown

pub mod error;
pub mod pool;
pub mod refresh;
pub mod session;
pub mod source;

pub use error::{Error, Result};
pub use pool::{
    AccountPool, AccountUsage, ActiveCredential, CooldownView, CredentialSink, PoolStatus,
};
pub use refresh::{RefreshHandle, refresh_delay};
pub use session::{GithubExchanger, Session, SessionManager, TokenExchanger};
pub use source::{CredentialRecord, PoolSources, load_pool, parse_entries};
