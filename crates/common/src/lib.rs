//! Types shared by the gateway crates: the redacting `Secret` wrapper used for
//! every credential value, and the configuration error type.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
