//! Error types for request execution.

use async_graphql_parser::Pos;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use subkit_core::ResponsePath;
use thiserror::Error;

/// Typed error codes, serialized under `extensions.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    ParseError,
    ValidationError,
    ComplexityLimitExceeded,
    ExecutionError,
    ResolverError,
    NonNullViolation,
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ComplexityLimitExceeded => "COMPLEXITY_LIMIT_EXCEEDED",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::ResolverError => "RESOLVER_ERROR",
            Self::NonNullViolation => "NON_NULL_VIOLATION",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true for errors caused by the request itself.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::ParseError | Self::ValidationError | Self::ComplexityLimitExceeded
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source location in the request document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl From<Pos> for Location {
    fn from(pos: Pos) -> Self {
        Self {
            line: pos.line,
            column: pos.column,
        }
    }
}

/// An error in the response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// The error message.
    pub message: String,
    /// Locations in the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    /// The path to the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<ResponsePath>,
    /// Error extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<IndexMap<String, serde_json::Value>>,
}

impl GraphQLError {
    /// Creates a new error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }

    /// Adds a location.
    pub fn with_location(mut self, location: impl Into<Location>) -> Self {
        self.locations
            .get_or_insert_with(Vec::new)
            .push(location.into());
        self
    }

    /// Adds a path to the error.
    pub fn with_path(mut self, path: ResponsePath) -> Self {
        self.path = Some(path);
        self
    }

    /// Adds an extension.
    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the error code extension.
    pub fn with_code(self, code: ErrorCode) -> Self {
        self.with_extension("code", serde_json::Value::String(code.as_str().to_string()))
    }

    /// Returns the error code, if one was set.
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GraphQLError {}

/// A document check failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub locations: Vec<Location>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
        }
    }

    pub fn at(mut self, pos: Pos) -> Self {
        self.locations.push(pos.into());
        self
    }
}

impl From<ValidationError> for GraphQLError {
    fn from(error: ValidationError) -> Self {
        let mut out = GraphQLError::new(error.message).with_code(ErrorCode::ValidationError);
        if !error.locations.is_empty() {
            out.locations = Some(error.locations);
        }
        out
    }
}

/// The single error produced when a query is too expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("The query exceeds the maximum complexity of {ceiling}. Actual complexity is {score}")]
pub struct AdmissionError {
    pub ceiling: u64,
    pub score: u64,
}

impl From<AdmissionError> for GraphQLError {
    fn from(error: AdmissionError) -> Self {
        GraphQLError::new(error.to_string()).with_code(ErrorCode::ComplexityLimitExceeded)
    }
}

/// Errors surfaced by the subscription manager.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// The subscription document failed its checks. Nothing was subscribed.
    #[error("Subscription query has validation errors")]
    Validation(Vec<GraphQLError>),

    /// The subscription document scores above the complexity ceiling.
    /// Nothing was subscribed.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Subscribing to the bus failed; established topics were rolled back.
    #[error("subscription setup failed: {0}")]
    Setup(String),

    /// No subscription is registered under this handle.
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),

    /// The context factory failed for one event.
    #[error("failed to build subscription context: {0}")]
    Context(String),

    /// Executing the document for one event failed.
    #[error("subscription execution failed: {0}")]
    Execution(String),
}
