//! GitHub and Copilot authentication library
//!
//! Everything needed to turn a GitHub account into a usable Copilot session:
//! device-flow login, owner-only token file persistence, identity and usage
//! lookups, and the exchange of a long-lived GitHub token for a short-lived
//! Copilot session token. No pool or rotation logic lives here.
//!
//! Credential flow:
//! 1. `login::acquire_github_token()` reads the cached token file and checks
//!    it against `/user`, or runs `device::run_device_flow()` and persists
//!    the result with `token_file::write_token_file()`
//! 2. `copilot::exchange_session_token()` trades the GitHub token for a
//!    Copilot session token carrying its own `refresh_in`
//! 3. `headers::ClientIdentity` builds the headers every outbound call carries

pub mod constants;
pub mod copilot;
pub mod device;
pub mod error;
pub mod headers;
pub mod login;
pub mod token_file;

pub use constants::{AccountType, Endpoints};
pub use copilot::{GithubUser, SessionToken, exchange_session_token, fetch_usage, fetch_user};
pub use device::{
    DeviceCode, DeviceFlowAction, DeviceFlowEvent, DeviceFlowState, PollResponse, handle_event,
    run_device_flow,
};
pub use error::{Error, Result};
pub use headers::{ClientIdentity, fetch_vscode_version};
pub use login::acquire_github_token;
pub use token_file::{read_token_file, write_token_file};
