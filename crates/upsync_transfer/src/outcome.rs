use std::io;

use upsync_dav::{DavError, DavMethod, DavResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCode {
    Ok,
    Cancelled,
    HttpFailure,
    /// Destination already exists, or changed since it was checked.
    TargetExists,
    /// Assembly refused because the destination folder is missing.
    ParentMissing,
    LocalFileNotFound,
    LocalIo,
    NetworkUnreachable,
    Timeout,
    Unexpected,
}

/// Request that produced an unsuccessful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpContext {
    pub method: DavMethod,
    pub target: String,
    pub status: u16,
}

/// Result of one remote operation. Failures never escape as errors; they
/// are folded into `code` with whatever context was available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome<T> {
    pub code: OutcomeCode,
    pub data: Option<T>,
    pub http: Option<HttpContext>,
    pub error: Option<String>,
}

impl<T> RemoteOutcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: OutcomeCode::Ok,
            data: Some(data),
            http: None,
            error: None,
        }
    }

    pub fn failure(code: OutcomeCode, error: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            http: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self::failure(OutcomeCode::Cancelled, "cancelled")
    }

    pub fn from_response(response: DavResponse) -> Self {
        Self::with_code(OutcomeCode::HttpFailure, response)
    }

    pub fn with_code(code: OutcomeCode, response: DavResponse) -> Self {
        Self {
            code,
            data: None,
            error: Some(format!(
                "{} {} answered {}",
                response.method, response.target, response.status
            )),
            http: Some(HttpContext {
                method: response.method,
                target: response.target,
                status: response.status,
            }),
        }
    }

    pub fn from_dav_error(err: DavError) -> Self {
        let code = match &err {
            DavError::Connection(_) => OutcomeCode::NetworkUnreachable,
            DavError::Timeout(_) => OutcomeCode::Timeout,
            DavError::InvalidRequest(_) | DavError::Request(_) => OutcomeCode::Unexpected,
        };
        Self::failure(code, err.to_string())
    }

    pub fn from_io_error(err: &io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => OutcomeCode::LocalFileNotFound,
            _ => OutcomeCode::LocalIo,
        };
        Self::failure(code, err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.code == OutcomeCode::Ok
    }

    /// Carries a failure over to another payload type.
    pub fn cast<U>(self) -> RemoteOutcome<U> {
        RemoteOutcome {
            code: self.code,
            data: None,
            http: self.http,
            error: self.error,
        }
    }
}
