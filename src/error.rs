//! Application Errors
//!
//! Coded errors that the admission path translates into transport responses.

use std::fmt;

/// Application error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    BadRequest,
    NotFound,
    TooManyRequests,
    Internal,
}

impl ErrorCode {
    /// Numeric code as reported to metrics and clients.
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::BadRequest => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::Internal => 500,
        }
    }

    /// Transport status for this code.
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::Ok => 200,
            ErrorCode::BadRequest => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::Internal => 500,
        }
    }

    /// Map a numeric code back; anything unknown is an internal error.
    pub fn from_u16(code: u16) -> Self {
        match code {
            0 => ErrorCode::Ok,
            400 => ErrorCode::BadRequest,
            404 => ErrorCode::NotFound,
            429 => ErrorCode::TooManyRequests,
            _ => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Coded application error with an optional cause.
#[derive(Debug)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    pub cause: Option<anyhow::Error>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn wrap(code: ErrorCode, message: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn status(&self) -> u16 {
        self.code.status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}:{}: {}", self.code, self.message, cause),
            None => write!(f, "{}:{}", self.code, self.message),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| &**c as &(dyn std::error::Error + 'static))
    }
}

impl From<crate::infrastructure::BulkheadError> for AppError {
    fn from(err: crate::infrastructure::BulkheadError) -> Self {
        AppError::wrap(ErrorCode::TooManyRequests, "request rejected", err)
    }
}
