//! # Directory Call Responses
//!
//! Every directory call returns the same three-part envelope:
//! `(status code, status message, value)`. [`Response`] is the typed view of
//! that envelope on the slave side.
//!
//! Only [`StatusCode::Success`] is a non-exceptional outcome. `Error` and
//! `Failure` differ in message text only; callers must treat them (and any
//! transport failure) through a single failure channel and never branch on
//! which of the two came back.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status code carried in every directory response envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// The call failed at the protocol level (e.g. malformed arguments).
    Failure,
    /// The call was understood but could not be satisfied.
    Error,
    /// The call succeeded; the envelope value is meaningful.
    Success,
}

impl StatusCode {
    /// Wire encoding used by the envelope: -1 failure, 0 error, 1 success.
    pub fn to_int(self) -> i32 {
        match self {
            StatusCode::Failure => -1,
            StatusCode::Error => 0,
            StatusCode::Success => 1,
        }
    }

    pub fn from_int(code: i32) -> Result<Self, InvalidStatusCode> {
        match code {
            -1 => Ok(StatusCode::Failure),
            0 => Ok(StatusCode::Error),
            1 => Ok(StatusCode::Success),
            other => Err(InvalidStatusCode(other)),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Failure => f.write_str("FAILURE"),
            StatusCode::Error => f.write_str("ERROR"),
            StatusCode::Success => f.write_str("SUCCESS"),
        }
    }
}

/// The remote sent a status code outside {-1, 0, 1}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidStatusCode(pub i32);

impl fmt::Display for InvalidStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status code {}", self.0)
    }
}

impl std::error::Error for InvalidStatusCode {}

/// A non-success envelope, surfaced to callers as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub status: StatusCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        RemoteError { status, message: message.into() }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote returned {}: {}", self.status, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Typed view of a decoded directory response envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response<T> {
    pub status: StatusCode,
    pub message: String,
    pub value: T,
}

impl<T> Response<T> {
    pub fn success(message: impl Into<String>, value: T) -> Self {
        Response { status: StatusCode::Success, message: message.into(), value }
    }

    pub fn error(message: impl Into<String>, value: T) -> Self {
        Response { status: StatusCode::Error, message: message.into(), value }
    }

    pub fn failure(message: impl Into<String>, value: T) -> Self {
        Response { status: StatusCode::Failure, message: message.into(), value }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }

    /// Collapse the envelope into the single failure channel: the value on
    /// success, [`RemoteError`] otherwise.
    pub fn into_result(self) -> Result<T, RemoteError> {
        if self.is_success() {
            Ok(self.value)
        } else {
            Err(RemoteError::new(self.status, self.message))
        }
    }
}
