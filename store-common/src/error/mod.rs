//! Error types shared by the backfill job and the server.
//!
//! Module errors in `store-manager` wrap these with `#[from]` and implement
//! [`ErrorClassification`] so a failed backfill unit is logged and skipped
//! while a failed startup stage aborts the process.

mod common;
mod traits;

pub use common::{ConfigurationError, NetworkError};
pub use traits::{ErrorCategory, ErrorClassification};
