use rmcp::model::ErrorData;

/// Error taxonomy for the gateway core. Every variant maps to a kind named in
/// the system design's error handling section; messages preserve vendor
/// diagnostics verbatim where it is safe to do so.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Configuration validation failed:\n  - {0}")]
    Config(String),

    #[error("Connection '{0}' not found. Available connections: {1}")]
    ConnectionNotFound(String, String),

    #[error("Database '{database}' is not allowed for connection '{connection}'. Allowed databases: {allowed}")]
    DatabaseNotAllowed {
        connection: String,
        database: String,
        allowed: String,
    },

    #[error("Server '{server}' not found in connection '{connection}'. Available servers: {available}")]
    ServerNotFound {
        connection: String,
        server: String,
        available: String,
    },

    #[error("{0}")]
    ReadOnlyViolation(String),

    #[error("{backend}: connection timed out after {timeout_s}s")]
    ConnectionTimeout { backend: String, timeout_s: u64 },

    #[error("{backend}: query timed out after {timeout_s}s")]
    QueryTimeout { backend: String, timeout_s: u64 },

    #[error("SSH: connection timeout after {0}s")]
    SshTimeout(u64),

    #[error("Operation exceeded hard timeout of {0}s")]
    HardTimeout(u64),

    #[error("{0}")]
    ExecutionError(String),

    #[error("SSH: authentication failed - {0}")]
    SshAuth(String),

    #[error("SSH: {0}")]
    SshError(String),

    #[error("{0}: command not found on PATH")]
    ToolMissing(String),

    #[error("Result size ({actual} bytes) exceeds maximum allowed ({max} bytes)")]
    DataSizeLimitExceeded { actual: u64, max: u64 },

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Failed to write result file {path}: {source}")]
    FileWriteError {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    pub fn to_mcp_error(&self) -> ErrorData {
        match self {
            GatewayError::ReadOnlyViolation(_)
            | GatewayError::ConnectionNotFound(_, _)
            | GatewayError::DatabaseNotAllowed { .. }
            | GatewayError::ServerNotFound { .. }
            | GatewayError::FileExists(_) => ErrorData::invalid_params(self.to_string(), None),
            _ => ErrorData::internal_error(self.to_string(), None),
        }
    }
}
