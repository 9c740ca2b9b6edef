// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Check that work requests were issued by the portal for the exchange in progress.
//!
//! Every [`WorkRequest`](crate::protocol::WorkRequest) carries a [`SessionValue`]: a session
//! identifier ending in its issue time, and a signature made with the portal's session key.
//! The signature is a textbook RSA operation over the SHA-512 digest of the identifier, so it is
//! checked with an unpadded public-key operation rather than a regular signature verifier.

use std::{
    sync::Mutex,
    time::{Duration, SystemTime},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{hash::MessageDigest, rsa::Padding, x509::X509};

use crate::{error::SessionError, protocol::SessionValue};

/// Sessions issued longer ago than this are refused.
pub const MAX_SESSION_AGE: Duration = Duration::from_secs(12 * 60 * 60 + 30 * 60);

const SHA512_LEN: usize = 64;

#[derive(Debug)]
pub struct SessionAuthenticator {
    trust_certificate: Option<X509>,
    expected_digest: Mutex<Option<Vec<u8>>>,
}

impl SessionAuthenticator {
    /// Create an authenticator that checks session signatures with the key in `trust_certificate`.
    ///
    /// Without a certificate every session is refused.
    pub fn new(trust_certificate: Option<X509>) -> Self {
        Self {
            trust_certificate,
            expected_digest: Mutex::new(None),
        }
    }

    /// Bind the authenticator to the exchange identified by `session_id`.
    ///
    /// Until [`SessionAuthenticator::reset`] is called, only sessions with this identifier pass
    /// [`SessionAuthenticator::check_session`].
    pub fn set_session_id(&self, session_id: &str) -> Result<(), SessionError> {
        let digest = openssl::hash::hash(MessageDigest::sha512(), session_id.as_bytes())?;
        let mut expected = self.expected_digest.lock().expect("lock is poisoned");
        *expected = Some(digest.to_vec());
        Ok(())
    }

    /// Whether an exchange is currently bound.
    pub fn is_bound(&self) -> bool {
        self.expected_digest
            .lock()
            .expect("lock is poisoned")
            .is_some()
    }

    /// Forget the current exchange.
    pub fn reset(&self) {
        self.expected_digest.lock().expect("lock is poisoned").take();
    }

    /// Check a session presented by the portal at time `now`.
    ///
    /// # Errors
    ///
    /// A session passes only if its identifier is well-formed, it was issued less than
    /// [`MAX_SESSION_AGE`] ago, its signature recovers the SHA-512 digest of the identifier
    /// under the trust certificate's key, and that digest matches the bound exchange.
    pub fn check_session(
        &self,
        session: &SessionValue,
        now: SystemTime,
    ) -> Result<(), SessionError> {
        let issued = issue_time(&session.session_id)?;
        let age = now.duration_since(issued).unwrap_or(Duration::ZERO);
        if age > MAX_SESSION_AGE {
            return Err(SessionError::Expired { age });
        }

        let certificate = self
            .trust_certificate
            .as_ref()
            .ok_or(SessionError::NoTrustCertificate)?;
        let digest = openssl::hash::hash(MessageDigest::sha512(), session.session_id.as_bytes())?;
        let recovered = recover_digest(certificate, &session.signature)?;
        if recovered.as_slice() != &digest[..] {
            tracing::debug!(
                session_id = %session.session_id,
                "Session signature does not recover the session digest"
            );
            return Err(SessionError::SignatureMismatch);
        }

        let expected = self.expected_digest.lock().expect("lock is poisoned");
        match expected.as_deref() {
            None => Err(SessionError::NotBound),
            Some(expected) if expected != &digest[..] => Err(SessionError::SessionMismatch),
            Some(_) => Ok(()),
        }
    }
}

/// Parse the issue time out of `<opaque id>+<epoch millis>`.
fn issue_time(session_id: &str) -> Result<SystemTime, SessionError> {
    let (opaque_id, millis) = session_id
        .rsplit_once('+')
        .ok_or_else(|| SessionError::Malformed("no timestamp separator".into()))?;
    if opaque_id.is_empty() {
        return Err(SessionError::Malformed("empty session id".into()));
    }
    let millis: u64 = millis
        .parse()
        .map_err(|_| SessionError::Malformed(format!("'{millis}' is not a timestamp")))?;
    SystemTime::UNIX_EPOCH
        .checked_add(Duration::from_millis(millis))
        .ok_or_else(|| SessionError::Malformed("timestamp out of range".into()))
}

/// Run the raw RSA public-key operation on `signature` and return the trailing digest.
///
/// The recovered integer must be exactly a SHA-512 digest: every byte in front of it is zero.
fn recover_digest(certificate: &X509, signature: &str) -> Result<Vec<u8>, SessionError> {
    let signature = STANDARD.decode(signature)?;
    let rsa = certificate.public_key()?.rsa()?;
    let size = rsa.size() as usize;
    if signature.len() != size {
        return Err(SessionError::SignatureMismatch);
    }

    let mut recovered = vec![0; size];
    let len = rsa
        .public_decrypt(&signature, &mut recovered, Padding::NONE)
        .map_err(|error| {
            tracing::debug!(?error, "Raw RSA operation on the session signature failed");
            SessionError::SignatureMismatch
        })?;
    recovered.truncate(len);

    let Some(split) = recovered.len().checked_sub(SHA512_LEN) else {
        return Err(SessionError::SignatureMismatch);
    };
    let (padding, digest) = recovered.split_at(split);
    if padding.iter().any(|byte| *byte != 0) {
        return Err(SessionError::SignatureMismatch);
    }

    Ok(digest.to_vec())
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use anyhow::Result;
    use openssl::pkey::{PKey, Private};
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{Minted, mint_ca};

    static PORTAL: LazyLock<Minted> =
        LazyLock::new(|| mint_ca("portal session key").expect("minting works"));

    fn sign_session(key: &PKey<Private>, session_id: &str) -> Result<String> {
        let rsa = key.rsa()?;
        let size = rsa.size() as usize;
        let digest = openssl::hash::hash(MessageDigest::sha512(), session_id.as_bytes())?;
        let mut padded = vec![0; size - digest.len()];
        padded.extend_from_slice(&digest);

        let mut signature = vec![0; size];
        rsa.private_encrypt(&padded, &mut signature, Padding::NONE)?;
        Ok(STANDARD.encode(signature))
    }

    fn session_at(issued: SystemTime) -> Result<SessionValue> {
        let millis = issued.duration_since(SystemTime::UNIX_EPOCH)?.as_millis();
        let session_id = format!("c2lnbmluZy1zZXNzaW9u+{millis}");
        let signature = sign_session(&PORTAL.key, &session_id)?;
        Ok(SessionValue {
            session_id,
            signature,
        })
    }

    fn authenticator() -> SessionAuthenticator {
        SessionAuthenticator::new(Some(PORTAL.certificate.clone()))
    }

    #[test]
    fn valid_session_passes() -> Result<()> {
        let now = SystemTime::now();
        let session = session_at(now - Duration::from_secs(60))?;
        let authenticator = authenticator();
        authenticator.set_session_id(&session.session_id)?;

        authenticator.check_session(&session, now)?;
        Ok(())
    }

    #[test]
    fn unbound_session_fails() -> Result<()> {
        let now = SystemTime::now();
        let session = session_at(now)?;
        let authenticator = authenticator();

        let result = authenticator.check_session(&session, now);
        assert!(matches!(result, Err(SessionError::NotBound)));

        authenticator.set_session_id(&session.session_id)?;
        authenticator.reset();
        assert!(!authenticator.is_bound());
        Ok(())
    }

    #[test]
    fn other_exchange_fails() -> Result<()> {
        let now = SystemTime::now();
        let session = session_at(now)?;
        let authenticator = authenticator();
        authenticator.set_session_id("another-exchange+1")?;

        let result = authenticator.check_session(&session, now);
        assert!(matches!(result, Err(SessionError::SessionMismatch)));
        Ok(())
    }

    #[test]
    fn tampered_session_fails() -> Result<()> {
        let now = SystemTime::now();
        let mut session = session_at(now)?;
        let authenticator = authenticator();
        authenticator.set_session_id(&session.session_id)?;

        session.signature = sign_session(&PORTAL.key, "something-else+1")?;
        let result = authenticator.check_session(&session, now);
        assert!(matches!(result, Err(SessionError::SignatureMismatch)));

        session.signature = STANDARD.encode(b"short");
        let result = authenticator.check_session(&session, now);
        assert!(matches!(result, Err(SessionError::SignatureMismatch)));
        Ok(())
    }

    #[test]
    fn missing_trust_certificate_fails() -> Result<()> {
        let now = SystemTime::now();
        let session = session_at(now)?;
        let authenticator = SessionAuthenticator::new(None);
        authenticator.set_session_id(&session.session_id)?;

        let result = authenticator.check_session(&session, now);
        assert!(matches!(result, Err(SessionError::NoTrustCertificate)));
        Ok(())
    }

    #[test]
    fn malformed_session_ids() {
        for session_id in ["no-timestamp", "+1700000000000", "abc+yesterday", "abc+"] {
            let session = SessionValue {
                session_id: session_id.into(),
                signature: String::new(),
            };
            let result = authenticator().check_session(&session, SystemTime::now());
            assert!(
                matches!(result, Err(SessionError::Malformed(_))),
                "{session_id} should be malformed"
            );
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn old_sessions_fail_regardless_of_signature(
            extra_seconds in 1u64..(10 * 365 * 86_400)
        ) {
            let now = SystemTime::now();
            let issued = now - MAX_SESSION_AGE - Duration::from_secs(extra_seconds);
            let session = session_at(issued).expect("signing works");
            let authenticator = authenticator();
            authenticator.set_session_id(&session.session_id).expect("hashing works");

            let result = authenticator.check_session(&session, now);
            prop_assert!(matches!(result, Err(SessionError::Expired { .. })));
        }
    }
}
