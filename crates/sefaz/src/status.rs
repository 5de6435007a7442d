//! Authority status codes (`cStat`) and what each one means for a submission.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorityStatus {
    Authorized,
    AuthorizedLate,
    BatchReceived,
    BatchProcessed,
    BatchProcessing,
    ServiceOperational,
    ServiceSuspended,
    ServiceUnavailable,
    Denied,
    Rejected,
}

/// What the gateway does next after seeing a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Available,
    Authorized,
    AwaitBatch,
    ReadInner,
    KeepPolling,
    Unavailable,
    Rejected,
}

/// The one place status codes are interpreted. Codes not listed are rejections.
const STATUS_TABLE: &[(u16, AuthorityStatus, Transition)] = &[
    (100, AuthorityStatus::Authorized, Transition::Authorized),
    (150, AuthorityStatus::AuthorizedLate, Transition::Authorized),
    (103, AuthorityStatus::BatchReceived, Transition::AwaitBatch),
    (104, AuthorityStatus::BatchProcessed, Transition::ReadInner),
    (105, AuthorityStatus::BatchProcessing, Transition::KeepPolling),
    (107, AuthorityStatus::ServiceOperational, Transition::Available),
    (108, AuthorityStatus::ServiceSuspended, Transition::Unavailable),
    (109, AuthorityStatus::ServiceUnavailable, Transition::Unavailable),
    (110, AuthorityStatus::Denied, Transition::Rejected),
    (301, AuthorityStatus::Denied, Transition::Rejected),
    (302, AuthorityStatus::Denied, Transition::Rejected),
    (303, AuthorityStatus::Denied, Transition::Rejected),
];

impl AuthorityStatus {
    pub fn from_code(code: u16) -> Self {
        lookup(code).map(|(s, _)| s).unwrap_or(AuthorityStatus::Rejected)
    }

    pub fn is_authorized(self) -> bool {
        matches!(self, AuthorityStatus::Authorized | AuthorityStatus::AuthorizedLate)
    }
}

impl fmt::Display for AuthorityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn lookup(code: u16) -> Option<(AuthorityStatus, Transition)> {
    STATUS_TABLE
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, s, t)| (*s, *t))
}

pub fn transition_for(code: u16) -> Transition {
    lookup(code).map(|(_, t)| t).unwrap_or(Transition::Rejected)
}
