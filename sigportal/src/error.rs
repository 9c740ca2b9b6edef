// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the agent and its collaborators.

use std::time::Duration;

use http::StatusCode;
use openssl::x509::X509;

use crate::protocol::Operation;

/// How the outcome of an exchange is presented to the user.
///
/// Every exchange ends in exactly one notification of one of these categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// The portal closed the exchange after the requested work was completed.
    Success,
    /// The user declined to continue, e.g. by dismissing a PIN prompt.
    Cancelled,
    /// A token, session, or the portal's patience ran out.
    Expired,
    /// Anything else; the details are in the logs.
    Fatal,
}

/// Errors that occur while talking HTTP(S) to the portal or the authorization server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// An I/O error occurred.
    ///
    /// This is very likely due to temporary networking issues, or because the
    /// hostname in the magic link is wrong.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The TLS handshake with the remote host failed.
    ///
    /// This is most often because the host presented a certificate chain that doesn't lead to
    /// a trusted anchor. The chain the host presented is included so it can be offered to the
    /// user for review.
    #[error("the TLS connection to {host} failed: {reason}")]
    Tls {
        host: String,
        reason: String,
        presented_chain: Vec<X509>,
    },

    /// No response arrived within the configured request timeout.
    #[error("the request to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    /// The request could not be constructed, most likely due to an invalid URL.
    #[error("the HTTP request could not be built: {0}")]
    Request(#[from] http::Error),

    /// The HTTP client failed for a reason other than TLS or I/O.
    #[error("the HTTP client failed: {0}")]
    Client(String),

    /// The OpenSSL configuration derived from the trust store is disagreeable to OpenSSL.
    #[error("openssl could not be configured: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

/// Errors from the [`crate::auth::BearerTokenProvider`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The magic link, or the redirect it produced, isn't shaped as expected.
    ///
    /// Retrying will not help; the portal needs to issue a new link.
    #[error("the magic link is not in the expected format: {0}")]
    MalformedMagicLink(String),

    /// The token endpoint refused to issue a token.
    #[error("the token endpoint responded with {status}")]
    TokenEndpoint { status: StatusCode },

    /// The token endpoint responded successfully, but with a body that isn't a token.
    #[error("the token endpoint response could not be parsed: {0}")]
    TokenResponse(#[from] serde_json::Error),

    /// Both the access token and the refresh token have expired.
    #[error("the access token expired and cannot be refreshed")]
    Expired,

    /// The issued access token contains characters that aren't allowed in a header.
    #[error("the issued access token is not a valid header value")]
    UnusableToken,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from the [`crate::session::SessionAuthenticator`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The session identifier isn't `<opaque id>+<epoch milliseconds>`.
    #[error("the session identifier is malformed: {0}")]
    Malformed(String),

    /// The session was issued too long ago.
    #[error("the session was issued {age:?} ago")]
    Expired { age: Duration },

    /// No certificate to check session signatures was configured.
    #[error("no session trust certificate is configured")]
    NoTrustCertificate,

    /// The signature does not match the session identifier.
    #[error("the session signature does not match the session identifier")]
    SignatureMismatch,

    /// The session is validly signed, but belongs to a different exchange.
    #[error("the session does not belong to the current exchange")]
    SessionMismatch,

    /// No exchange is in progress, so no session can be expected.
    #[error("no session is expected at this time")]
    NotBound,

    /// The signature isn't valid base64.
    #[error("the session signature is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

/// Errors from the signing backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProductError {
    /// The PKCS #11 module reported an error.
    #[error("the PKCS #11 module failed: {0}")]
    Pkcs11(#[from] cryptoki::error::Error),

    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// A general I/O error occurred, most likely reading a keystore file.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The PIN or password was refused.
    #[error("the PIN or password for {0} is incorrect")]
    BadSecret(String),

    /// The product has no token, or no token matching the configured slot or label.
    #[error("no token is available for {0}")]
    NoToken(String),

    /// The requested key doesn't exist on the token.
    #[error("no key with id {0} was found")]
    KeyNotFound(String),

    /// The key exists, but isn't a type this agent can sign with.
    #[error("unsupported key: {0}")]
    UnsupportedKey(String),

    /// The session was destroyed while in use, most likely because its cache entry expired.
    #[error("the token session has been closed")]
    Closed,

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Errors from the [`crate::trust::TrustStore`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrustError {
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// The persisted chain cache could not be (de)serialized.
    #[error("the trusted chain cache is invalid: {0}")]
    Cache(#[from] serde_json::Error),

    /// The chain doesn't lead from its first certificate to a trusted anchor.
    #[error("the certificate chain is not trustworthy: {0}")]
    BrokenChain(String),
}

/// Errors from parsing the inbound wake-up message.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MessageError {
    #[error("the message does not contain a magic link")]
    MissingMagicLink,

    #[error("the magic link is not a valid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("the message expiry '{0}' is not a timestamp")]
    InvalidExpiry(String),
}

/// Errors that end an exchange with the portal.
///
/// These are caught once, at the top of [`crate::dispatch::Agent`], and turned into a single
/// notification with [`DispatchError::category`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The portal responded with a status outside the protocol.
    #[error("the server responded with {} {reason}", .status.as_u16())]
    Communication { status: StatusCode, reason: String },

    /// The portal asked the agent to wait for too long.
    #[error("the server kept the agent waiting for more than {0:?}")]
    IdleTimeout(Duration),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The portal sent work this agent doesn't know how to do.
    ///
    /// This is a bug in either the portal or the agent.
    #[error("the server requested an unsupported operation: {0:?}")]
    UnsupportedOperation(Operation),

    /// The portal sent a body that isn't a work request.
    #[error("the server sent a response that could not be understood: {0}")]
    InvalidBody(#[from] serde_json::Error),

    /// The portal redirected without a usable `Location` header.
    #[error("the server redirected without a usable Location header")]
    InvalidRedirect,
}

impl DispatchError {
    /// The notification category for this error.
    pub fn category(&self) -> Category {
        match self {
            DispatchError::IdleTimeout(_) | DispatchError::Auth(AuthError::Expired) => {
                Category::Expired
            }
            _ => Category::Fatal,
        }
    }

    /// The transport error behind this error, if there is one.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            DispatchError::Transport(error)
            | DispatchError::Auth(AuthError::Transport(error)) => Some(error),
            _ => None,
        }
    }

    /// Whether this error should be shown to the user in a modal dialog.
    ///
    /// TLS failures and unexpected HTTP responses are the errors a user can act on.
    pub fn wants_dialog(&self) -> bool {
        matches!(
            self,
            DispatchError::Communication { .. }
                | DispatchError::Auth(AuthError::TokenEndpoint { .. })
        ) || matches!(self.transport(), Some(TransportError::Tls { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expirations_are_categorized() {
        assert_eq!(
            DispatchError::IdleTimeout(Duration::from_secs(300)).category(),
            Category::Expired
        );
        assert_eq!(
            DispatchError::Auth(AuthError::Expired).category(),
            Category::Expired
        );
        assert_eq!(
            DispatchError::InvalidRedirect.category(),
            Category::Fatal
        );
    }

    #[test]
    fn tls_errors_want_a_dialog() {
        let error = DispatchError::Auth(AuthError::Transport(TransportError::Tls {
            host: "portal.example.com".into(),
            reason: "certificate verify failed".into(),
            presented_chain: vec![],
        }));
        assert!(error.wants_dialog());
        assert_eq!(error.category(), Category::Fatal);

        let error = DispatchError::Transport(TransportError::Timeout {
            host: "portal.example.com".into(),
            timeout: Duration::from_secs(30),
        });
        assert!(!error.wants_dialog());
    }
}
