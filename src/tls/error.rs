//! TLS engine error types

use thiserror::Error;

/// Certificate authority errors
#[derive(Error, Debug)]
pub enum CaError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    Generation(String),

    /// CA certificate or key could not be loaded
    #[error("Failed to load CA: {0}")]
    Load(String),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for {host}: {reason}")]
    Issue { host: String, reason: String },
}

impl CaError {
    /// Create a CA generation error
    pub fn generation(msg: impl ToString) -> Self {
        Self::Generation(msg.to_string())
    }

    /// Create a CA load error
    pub fn load(msg: impl ToString) -> Self {
        Self::Load(msg.to_string())
    }

    /// Create a leaf issuance error
    pub fn issue(host: impl Into<String>, msg: impl ToString) -> Self {
        Self::Issue {
            host: host.into(),
            reason: msg.to_string(),
        }
    }
}

/// Decision template evaluation errors
#[derive(Error, Debug)]
pub enum DecisionError {
    /// Rendering failed
    #[error("Error executing template: {0}")]
    Render(#[from] minijinja::Error),

    /// Rendered text is not a boolean
    #[error("Template output {0:?} is not a boolean")]
    NotBoolean(String),
}

/// Per-connection failures
///
/// These never escape the connection that raised them.
#[derive(Error, Debug)]
pub enum InterceptError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client sent nothing within the read timeout
    #[error("Timed out waiting for client data")]
    ReadTimeout,

    /// Client closed before sending any data
    #[error("Client closed the connection before sending data")]
    ClientClosed,

    /// Decision template failed
    #[error(transparent)]
    Decision(#[from] DecisionError),

    /// Leaf certificate could not be produced
    #[error(transparent)]
    Certificate(#[from] CaError),

    /// Interception requested without a certificate authority
    #[error("No certificate authority configured for interception")]
    NoAuthority,

    /// Interception requested for a connection that is not TLS
    #[error("Cannot decrypt a connection that did not start with a TLS ClientHello")]
    NotTls,

    /// TLS server configuration rejected the certificate
    #[error("TLS configuration failed: {0}")]
    TlsConfig(#[from] rustls::Error),

    /// TLS handshake with the client failed
    #[error("TLS handshake failed for {host}: {reason}")]
    Handshake { host: String, reason: String },

    /// Nobody consumed the stream
    #[error("Downstream stream closed")]
    StreamClosed,
}

impl InterceptError {
    /// Create a handshake error
    pub fn handshake(host: impl Into<String>, msg: impl ToString) -> Self {
        Self::Handshake {
            host: host.into(),
            reason: msg.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_host_and_reason() {
        let err = CaError::issue("example.test", "bad name");
        assert_eq!(
            err.to_string(),
            "Failed to generate certificate for example.test: bad name"
        );
        assert!(std::error::Error::source(&err).is_none());

        let err = InterceptError::handshake("10.0.0.1", "no shared cipher");
        assert_eq!(
            err.to_string(),
            "TLS handshake failed for 10.0.0.1: no shared cipher"
        );
    }
}
