use serde::{Deserialize, Serialize};

/// Shared error type used across all DotBot crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("local agent unavailable: {0}")]
    Infrastructure(String),

    #[error("tool stuck: {0}")]
    Stuck(String),

    #[error("credential domain mismatch: {0}")]
    DomainMismatch(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("config: {0}")]
    Config(String),

    #[error("pipeline: {0}")]
    Pipeline(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The closed error taxonomy. Every error maps to exactly one kind; the
/// kind determines the recovery policy at the failure site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket closed, read timeout. Retried with backoff; not surfaced to
    /// the user until the one-hour circuit breaker trips.
    TransientTransport,
    /// Invalid/expired/consumed token, revoked device, fingerprint
    /// mismatch. Exit 1 with remediation steps.
    FatalAuth,
    /// Known tool error, bad arguments, external 4xx. Returned as tool
    /// result text so the LLM can retry or escalate.
    ToolRecoverable,
    /// No local agent / device disconnected. Short-circuits the tool loop.
    ToolInfrastructure,
    /// Same tool called repeatedly with the same arguments. Force-escalate.
    ToolStuck,
    /// Proxy request to the wrong host, or GCM auth failure. Never retried
    /// with any other domain.
    CredentialDomainMismatch,
    /// Too many auth or credential-form attempts from one IP.
    RateLimited,
    /// Exception in a pipeline stage. Caught at the pipeline root; a
    /// generic conversational error goes to the user.
    PipelineUnexpected,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Transport(_) | Error::Timeout(_) => {
                ErrorKind::TransientTransport
            }
            Error::Auth(_) => ErrorKind::FatalAuth,
            Error::Json(_) | Error::Tool { .. } => ErrorKind::ToolRecoverable,
            Error::Infrastructure(_) => ErrorKind::ToolInfrastructure,
            Error::Stuck(_) => ErrorKind::ToolStuck,
            Error::DomainMismatch(_) | Error::Crypto(_) => {
                ErrorKind::CredentialDomainMismatch
            }
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Config(_) | Error::Pipeline(_) | Error::Other(_) => {
                ErrorKind::PipelineUnexpected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_one_kind() {
        assert_eq!(
            Error::Transport("closed".into()).kind(),
            ErrorKind::TransientTransport
        );
        assert_eq!(
            Error::Auth("token consumed".into()).kind(),
            ErrorKind::FatalAuth
        );
        assert_eq!(
            Error::Tool {
                tool: "shell.run".into(),
                message: "exit 1".into()
            }
            .kind(),
            ErrorKind::ToolRecoverable
        );
        assert_eq!(
            Error::Infrastructure("no device".into()).kind(),
            ErrorKind::ToolInfrastructure
        );
        assert_eq!(
            Error::DomainMismatch("evil.example".into()).kind(),
            ErrorKind::CredentialDomainMismatch
        );
        assert_eq!(
            Error::RateLimited("auth".into()).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            Error::Pipeline("planner".into()).kind(),
            ErrorKind::PipelineUnexpected
        );
    }
}
