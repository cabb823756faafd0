// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bgp::BgpError;
use crate::flows::FlowError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error {0}")]
    Db(#[from] vrdb::error::Error),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("resource exhausted: {0}")]
    Exhausted(String),

    #[error("bgp speaker error: {0}")]
    Bgp(#[from] BgpError),

    #[error("forwarding programmer error: {0}")]
    Flow(#[from] FlowError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("overlapping subnet: {0}")]
    Overlap(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The failure classes jobs are handled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A dependency has not appeared yet.
    NotReady,
    /// No RD, label or id left.
    Exhausted,
    /// The BGP speaker or forwarding programmer failed.
    Collaborator,
    /// Persisted state contradicts itself.
    Invariant,
    /// The request itself is unacceptable.
    Rejected,
    /// Store or runtime failure.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Db(vrdb::error::Error::PoolExhausted(_)) => {
                ErrorKind::Exhausted
            }
            Error::Db(_) | Error::Io(_) => ErrorKind::Internal,
            Error::NotReady(_) | Error::Timeout(_) => ErrorKind::NotReady,
            Error::Exhausted(_) => ErrorKind::Exhausted,
            Error::Bgp(_) | Error::Flow(_) => ErrorKind::Collaborator,
            Error::InvariantViolation(_) => ErrorKind::Invariant,
            Error::Overlap(_)
            | Error::Conflict(_)
            | Error::NotFound(_)
            | Error::InvalidArgument(_)
            | Error::Config(_) => ErrorKind::Rejected,
        }
    }

    /// Only store and runtime failures are worth running a job again for.
    /// Everything else is either final or waits for the next trigger.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}
