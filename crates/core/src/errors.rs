use serde::Serialize;
use thiserror::Error;

use crate::domain::request::RequestStatus;

/// Every failure an engine operation can surface to its caller.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },
    #[error("requested {requested} units but only {available} of {total} are available ({consumed} consumed)")]
    InsufficientCapacity { requested: u32, available: u32, total: u32, consumed: u32 },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("caller authority level {caller_level} cannot act on approval level {required_level}")]
    InsufficientLevel { caller_level: u8, required_level: u8 },
    #[error("approval level {expected_level} of request `{request_id}` was already resolved (current level {current_level})")]
    StaleLevel { request_id: String, expected_level: u8, current_level: u8 },
    #[error("request `{request_id}` is {status:?} at level {current_level}/{required_levels}; no further action possible")]
    CompletedWorkflow {
        request_id: String,
        status: RequestStatus,
        current_level: u8,
        required_levels: u8,
    },
    #[error("internal failure: {message}")]
    Internal { message: String },
}

impl AllocationError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::BadRequest,
            Self::InsufficientCapacity { .. }
            | Self::StaleLevel { .. }
            | Self::CompletedWorkflow { .. } => ErrorClass::Conflict,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::InsufficientLevel { .. } => ErrorClass::Forbidden,
            Self::Internal { .. } => ErrorClass::ServiceUnavailable,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        InterfaceError {
            class: self.class(),
            message: self.to_string(),
            correlation_id: correlation_id.into(),
            detail: self,
        }
    }
}

/// Failures reported by a persistence backend.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("approval level {level} of request `{request_id}` changed concurrently")]
    Stale { request_id: String, level: u8 },
    #[error("resource `{resource_id}` has {available} of {total} units available")]
    CapacityExceeded { resource_id: String, available: u32, total: u32, consumed: u32 },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("storage failure: {0}")]
    Backend(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    ServiceUnavailable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ServiceUnavailable => "service_unavailable",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("{class:?}: {message}")]
pub struct InterfaceError {
    pub class: ErrorClass,
    pub message: String,
    pub correlation_id: String,
    pub detail: AllocationError,
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self.class {
            ErrorClass::BadRequest => {
                "The request could not be processed. Check inputs and try again."
            }
            ErrorClass::Forbidden => "Your role cannot act on the current approval level.",
            ErrorClass::NotFound => "The referenced request or resource does not exist.",
            ErrorClass::Conflict => {
                "The request changed or ran out of capacity. Refresh and try again."
            }
            ErrorClass::ServiceUnavailable => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }
}
