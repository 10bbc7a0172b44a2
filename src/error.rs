//! Error types shared across the server, session, and transport layers.

use std::io;

use thiserror::Error;

/// Errors surfaced by [`crate::Server`] startup.
///
/// Connection-scoped faults never reach this type; they are absorbed into
/// SMTP reply codes or a silent close inside the session.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind a listener to the configured address.
    #[error("Failed to bind listener to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// TLS credentials could not be loaded or were rejected by rustls.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Errors raised while loading or applying TLS credentials.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The certificate file could not be read or parsed.
    #[error("Unable to load TLS certificate {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The private key file could not be read or was in an unknown format.
    #[error("Unable to load TLS key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// rustls rejected the certificate/key pair.
    #[error("Invalid TLS configuration: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The idle deadline elapsed; a 421 has been sent where possible.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),

    /// Transport-level failure; the session closes silently.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The STARTTLS handshake failed; a 403 has been sent where possible.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

impl SessionError {
    /// Returns `true` if the session ended because the client went idle.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Faults raised by the DATA-phase reader.
///
/// Each variant maps to a distinct recovery: size overflows keep the session
/// open with a 552, timeouts close it after a 421, and any other transport
/// fault keeps it open with a 451 so the client may retry.
#[derive(Debug, Error)]
pub enum DataError {
    /// The accumulated message exceeded the configured maximum size.
    #[error("Message exceeds maximum allowed size of {0} bytes")]
    MaxSizeExceeded(usize),

    /// The idle deadline elapsed while waiting for message data.
    #[error("Timed out after {0} seconds while reading message data")]
    Timeout(u64),

    /// A transport fault interrupted the message body.
    #[error("Error reading message data: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn session_error_classification() {
        assert!(SessionError::Timeout(300).is_timeout());
        assert!(!SessionError::Connection(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .is_timeout());
    }

    #[test]
    fn bind_error_preserves_source() {
        let err = ServerError::BindFailed {
            address: "0.0.0.0:25".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
        };

        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "Failed to bind listener to 0.0.0.0:25: access denied"
        );
    }

    #[test]
    fn data_error_display() {
        assert_eq!(
            DataError::MaxSizeExceeded(1024).to_string(),
            "Message exceeds maximum allowed size of 1024 bytes"
        );
    }
}
