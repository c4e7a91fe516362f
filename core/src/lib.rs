//! Core utilities and shared types for the flowsift engine.

pub mod backoff;
pub mod cancel;
mod fixedid;

pub use cancel::{CancelToken, Cancelled};
pub use fixedid::{FixedId, FixedIdError};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Pipeline stage attached to user-visible failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Correlate,
    Write,
    Retention,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Parse => "parse",
            Stage::Correlate => "correlate",
            Stage::Write => "write",
            Stage::Retention => "retention",
        };
        f.write_str(s)
    }
}
