use std::fmt;

use thiserror::Error;

/// Machine-readable code attached to every rejection body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigFileNotFound,
    ConfigInvalidFormat,
    ConfigMissingFields,
    ConfigEmptyArray,
    ConfigValidationFailed,
    AuthTokenGenerationFailed,
    AuthInvalidCredentials,
    AuthNoAvailableConfigs,
    AuthAllConfigsFailed,
    RequestInvalidFormat,
    RequestMissingMethod,
    RequestMissingPath,
    NetworkConnectionFailed,
    NetworkTimeout,
    InternalUnexpectedError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigFileNotFound => "CONFIG_1001",
            Self::ConfigInvalidFormat => "CONFIG_1002",
            Self::ConfigMissingFields => "CONFIG_1003",
            Self::ConfigEmptyArray => "CONFIG_1004",
            Self::ConfigValidationFailed => "CONFIG_1005",
            Self::AuthTokenGenerationFailed => "AUTH_2001",
            Self::AuthInvalidCredentials => "AUTH_2002",
            Self::AuthNoAvailableConfigs => "AUTH_2003",
            Self::AuthAllConfigsFailed => "AUTH_2004",
            Self::RequestInvalidFormat => "REQUEST_3001",
            Self::RequestMissingMethod => "REQUEST_3002",
            Self::RequestMissingPath => "REQUEST_3003",
            Self::NetworkConnectionFailed => "NETWORK_4001",
            Self::NetworkTimeout => "NETWORK_4002",
            Self::InternalUnexpectedError => "INTERNAL_5001",
        }
    }

    pub fn status(self) -> u16 {
        match self {
            Self::ConfigFileNotFound
            | Self::ConfigInvalidFormat
            | Self::ConfigMissingFields
            | Self::ConfigEmptyArray
            | Self::ConfigValidationFailed
            | Self::AuthTokenGenerationFailed
            | Self::AuthInvalidCredentials
            | Self::InternalUnexpectedError => 500,
            Self::AuthNoAvailableConfigs | Self::AuthAllConfigsFailed => 503,
            Self::RequestInvalidFormat | Self::RequestMissingMethod | Self::RequestMissingPath => {
                400
            }
            Self::NetworkConnectionFailed | Self::NetworkTimeout => 502,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ConfigFileNotFound => "Configuration file not found",
            Self::ConfigInvalidFormat => "Invalid configuration file format",
            Self::ConfigMissingFields => "Configuration missing required fields",
            Self::ConfigEmptyArray => "Configuration array is empty",
            Self::ConfigValidationFailed => "Configuration validation failed",
            Self::AuthTokenGenerationFailed => "Failed to generate authentication token",
            Self::AuthInvalidCredentials => "Invalid authentication credentials",
            Self::AuthNoAvailableConfigs => "No authentication configurations available",
            Self::AuthAllConfigsFailed => "All authentication configurations have failed",
            Self::RequestInvalidFormat => "Invalid request format",
            Self::RequestMissingMethod => "Request missing HTTP method",
            Self::RequestMissingPath => "Request missing path",
            Self::NetworkConnectionFailed => "Failed to connect to upstream server",
            Self::NetworkTimeout => "Request to upstream server timed out",
            Self::InternalUnexpectedError => "An unexpected error occurred",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found on one field of a credential record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldIssue {
    NotAnObject { found: &'static str },
    Missing(&'static str),
    WrongType {
        field: &'static str,
        found: &'static str,
    },
    Empty(&'static str),
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject { found } => write!(f, "configuration must be an object, got {found}"),
            Self::Missing(field) => write!(f, "missing required field '{field}'"),
            Self::WrongType { field, found } => {
                write!(f, "field '{field}' must be a string, got {found}")
            }
            Self::Empty(field) => write!(f, "field '{field}' cannot be empty or whitespace-only"),
        }
    }
}

/// Every issue found on the record at `index` of the credential array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIssue {
    pub index: usize,
    pub issues: Vec<FieldIssue>,
}

impl fmt::Display for RecordIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}: ", self.index)?;
        for (pos, issue) in self.issues.iter().enumerate() {
            if pos > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

fn join_records(failures: &[RecordIssue]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardFailureKind {
    Network,
    Timeout,
    MalformedRequest,
    General,
}

impl ForwardFailureKind {
    pub fn code(self) -> ErrorCode {
        match self {
            Self::Network => ErrorCode::NetworkConnectionFailed,
            Self::Timeout => ErrorCode::NetworkTimeout,
            Self::MalformedRequest => ErrorCode::RequestInvalidFormat,
            Self::General => ErrorCode::InternalUnexpectedError,
        }
    }

    pub fn status(self) -> u16 {
        self.code().status()
    }
}

impl fmt::Display for ForwardFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::MalformedRequest => "invalid_request",
            Self::General => "general",
        })
    }
}

/// A failure raised while handing a request to, or reading a response from, the upstream.
#[derive(Debug, Clone, Error)]
#[error("{kind} failure: {message}")]
pub struct ForwardFailure {
    pub kind: ForwardFailureKind,
    pub message: String,
}

impl ForwardFailure {
    pub fn new(kind: ForwardFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ForwardFailureKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ForwardFailureKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ForwardFailureKind::MalformedRequest, message)
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ForwardFailureKind::General, message)
    }
}

impl From<reqwest::Error> for ForwardFailure {
    fn from(err: reqwest::Error) -> Self {
        // reqwest includes the url in its message; the url never carries credentials here.
        let message = err.to_string();
        if err.is_timeout() {
            Self::timeout(message)
        } else if err.is_connect() {
            Self::network(message)
        } else if err.is_builder() || err.is_request() {
            Self::malformed(message)
        } else {
            Self::general(message)
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("secrets file not found at resolved path: {resolved} (original: {original})")]
    ConfigNotFound { resolved: String, original: String },
    #[error("invalid configuration format: {reason}")]
    ConfigFormat { reason: String },
    #[error("secrets array cannot be empty - at least one credential is required")]
    ConfigEmpty,
    #[error("invalid credential records: {}", join_records(.failures))]
    ConfigValidation { failures: Vec<RecordIssue> },
    #[error("invalid settings: {reason}")]
    Settings { reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot build a load balancer from an empty credential list")]
    EmptyPool,
    #[error("no available credentials - all credentials are quarantined")]
    NoAvailableCredentials,
    #[error("credential is missing required fields: {}", .missing.join(", "))]
    InvalidCredential { missing: Vec<&'static str> },
    #[error("token generation failed: {reason}")]
    TokenGeneration { reason: String },
    #[error("failover exhausted: {last}")]
    FailoverExhausted { last: Box<ProxyError> },
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    #[error("request is missing an HTTP method")]
    MissingMethod,
    #[error("request is missing a path")]
    MissingPath,
    #[error(transparent)]
    Forward(#[from] ForwardFailure),
}

impl ProxyError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConfigNotFound { .. } => ErrorCode::ConfigFileNotFound,
            Self::ConfigFormat { .. } | Self::Settings { .. } | Self::Io { .. } => {
                ErrorCode::ConfigInvalidFormat
            }
            Self::ConfigEmpty | Self::EmptyPool => ErrorCode::ConfigEmptyArray,
            Self::ConfigValidation { failures } => {
                let only_missing = failures.iter().all(|record| {
                    record
                        .issues
                        .iter()
                        .all(|issue| matches!(issue, FieldIssue::Missing(_)))
                });
                if only_missing {
                    ErrorCode::ConfigMissingFields
                } else {
                    ErrorCode::ConfigValidationFailed
                }
            }
            Self::NoAvailableCredentials => ErrorCode::AuthNoAvailableConfigs,
            Self::InvalidCredential { .. } => ErrorCode::AuthInvalidCredentials,
            Self::TokenGeneration { .. } => ErrorCode::AuthTokenGenerationFailed,
            Self::FailoverExhausted { .. } => ErrorCode::AuthAllConfigsFailed,
            Self::InvalidInput { .. } => ErrorCode::RequestInvalidFormat,
            Self::MissingMethod => ErrorCode::RequestMissingMethod,
            Self::MissingPath => ErrorCode::RequestMissingPath,
            Self::Forward(failure) => failure.kind.code(),
        }
    }

    pub fn status(&self) -> u16 {
        self.code().status()
    }

    /// Whether the failure belongs to a credential and should trigger failover.
    pub fn is_mint_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential { .. } | Self::TokenGeneration { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_kinds_map_to_documented_statuses() {
        assert_eq!(ForwardFailureKind::Network.status(), 502);
        assert_eq!(ForwardFailureKind::Timeout.status(), 502);
        assert_eq!(ForwardFailureKind::MalformedRequest.status(), 400);
        assert_eq!(ForwardFailureKind::General.status(), 500);
        assert_eq!(ForwardFailureKind::Timeout.code().as_str(), "NETWORK_4002");
    }

    #[test]
    fn validation_error_lists_every_record() {
        let err = ProxyError::ConfigValidation {
            failures: vec![
                RecordIssue {
                    index: 0,
                    issues: vec![FieldIssue::Missing("clientId"), FieldIssue::Empty("tenant")],
                },
                RecordIssue {
                    index: 2,
                    issues: vec![FieldIssue::WrongType {
                        field: "clientSecret",
                        found: "number",
                    }],
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("record 0: missing required field 'clientId'; field 'tenant'"));
        assert!(text.contains("record 2: field 'clientSecret' must be a string, got number"));
        assert_eq!(err.code(), ErrorCode::ConfigValidationFailed);
    }

    #[test]
    fn missing_only_validation_uses_missing_fields_code() {
        let err = ProxyError::ConfigValidation {
            failures: vec![RecordIssue {
                index: 1,
                issues: vec![FieldIssue::Missing("tenant")],
            }],
        };
        assert_eq!(err.code().as_str(), "CONFIG_1003");
    }

    #[test]
    fn pool_exhaustion_is_service_unavailable() {
        assert_eq!(ProxyError::NoAvailableCredentials.status(), 503);
        let exhausted = ProxyError::FailoverExhausted {
            last: Box::new(ProxyError::NoAvailableCredentials),
        };
        assert_eq!(exhausted.code().as_str(), "AUTH_2004");
        assert_eq!(exhausted.status(), 503);
    }
}
