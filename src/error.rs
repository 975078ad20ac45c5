//! Error types for wharf gateway and installer operations.

use thiserror::Error;

/// Main error type for wharf operations
#[derive(Error, Debug)]
pub enum WharfError {
    /// No install method could be resolved for a server
    #[error("no install method available for server '{0}'")]
    NoMethodAvailable(String),

    /// Descriptor is missing fields its preferred method requires
    #[error("invalid descriptor for server '{0}': {1}")]
    InvalidDescriptor(String, String),

    /// A provisioning step exited non-zero or threw
    #[error("install failed for server '{0}': {1}")]
    InstallFailed(String, String),

    /// A process failed to launch
    #[error("spawn failed for '{0}': {1}")]
    SpawnFailed(String, String),

    /// Backend rejected the connection with an authorization error (HTTP 401)
    #[error("backend authorization failed for '{0}'")]
    AuthFailed(String),

    /// Backend connection could not be established
    #[error("connection failed for '{0}': {1}")]
    ConnectFailed(String, String),

    /// Transport discriminator is not one of stdio / sse / streamable-http
    #[error("unsupported transport type '{0}'")]
    UnsupportedTransport(String),

    /// Unknown session id
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// Unknown server name or id
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// Message relay into a session failed (channel closed or transport gone)
    #[error("relay failed for session '{0}': {1}")]
    RelayFailed(String, String),

    /// Persisted store read/write failure
    #[error("persist error: {0}")]
    Persist(String),
}

/// Result type alias for wharf operations
pub type Result<T> = std::result::Result<T, WharfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_method_available_display() {
        let err = WharfError::NoMethodAvailable("weather".to_string());
        assert_eq!(
            err.to_string(),
            "no install method available for server 'weather'"
        );
    }

    #[test]
    fn test_invalid_descriptor_display() {
        let err = WharfError::InvalidDescriptor(
            "weather".to_string(),
            "git method requires 'source' field".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid descriptor for server 'weather': git method requires 'source' field"
        );
    }

    #[test]
    fn test_auth_failed_distinct_from_connect_failed() {
        let auth = WharfError::AuthFailed("https://api.example.com/mcp".to_string());
        let conn = WharfError::ConnectFailed(
            "https://api.example.com/mcp".to_string(),
            "connection refused".to_string(),
        );
        assert!(auth.to_string().contains("authorization"));
        assert!(!conn.to_string().contains("authorization"));
    }

    #[test]
    fn test_session_not_found_display() {
        let err = WharfError::SessionNotFound("weather-1234".to_string());
        assert_eq!(err.to_string(), "session 'weather-1234' not found");
    }
}
