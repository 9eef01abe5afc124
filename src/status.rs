//! Outcome vocabulary of an evaluation.

use std::fmt;
use std::str::FromStr;

use crate::error::HerdError;

/// What the caller should do with a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Unset.
    #[default]
    None,
    /// An internal error occurred while evaluating.
    Failed,
    /// A herd was detected and this caller was chosen to do the work. It must call
    /// `request_done` (success) or `cleanup` (failure) afterwards.
    Process,
    /// A herd is in progress and somebody else is doing the work; back off or reject.
    Wait,
    /// Business as usual: no herd, a resolved herd, or an active cooldown.
    OpenGates,
}

impl Status {
    /// Status for an evaluation result; every error reports as [`Status::Failed`].
    pub fn of(result: &Result<Status, HerdError>) -> Status {
        match result {
            Ok(status) => *status,
            Err(_) => Status::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::None => "none",
            Status::Failed => "failed",
            Status::Process => "process",
            Status::Wait => "wait",
            Status::OpenGates => "open-gates",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`Status`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Status::None),
            "failed" => Ok(Status::Failed),
            "process" => Ok(Status::Process),
            "wait" => Ok(Status::Wait),
            "open-gates" => Ok(Status::OpenGates),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}
