//! Uniform result envelope
//!
//! Success: `{"success": true, "data": ..., "meta": {"timestamp": ..., "count": n}}`
//! Failure: `{"success": false, "error": {"code": ..., "message": ..., "details": ...}}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ErrorCode};

/// Metadata attached to successful responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            count: None,
        }
    }
}

/// Response envelope returned by every control-surface route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> Envelope<T> {
    /// Wrap a payload
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: Some(Meta::now()),
            error: None,
        }
    }

    /// Wrap a list-like payload, recording its item count
    pub fn ok_counted(data: T, count: usize) -> Self {
        let mut envelope = Self::ok(data);
        if let Some(meta) = envelope.meta.as_mut() {
            meta.count = Some(count);
        }
        envelope
    }

    pub fn err(error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            meta: None,
            error: Some(error),
        }
    }

    /// Convert into a plain `Result`
    pub fn into_result(self) -> Result<T, ApiError> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            (true, None, None) => Err(ApiError::new(
                ErrorCode::ExecutionFailed,
                "success envelope without data",
            )),
            (false, _, None) => Err(ApiError::new(
                ErrorCode::ExecutionFailed,
                "failure envelope without error",
            )),
        }
    }
}

impl<T> From<Result<T, ApiError>> for Envelope<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(data) => Envelope::ok(data),
            Err(error) => Envelope::err(error),
        }
    }
}
