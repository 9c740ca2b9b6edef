// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signing backends.
//!
//! A [`Product`] is a configured source of keys: a PKCS #11 module (usually driving a smart
//! card), or a PKCS #12 keystore file. Connecting to a product with its PIN or password yields a
//! [`TokenSession`], which lists the keys available and signs with them.
//!
//! Everything here blocks; callers in async code should use `spawn_blocking`.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use cryptoki::{
    context::{CInitializeArgs, CInitializeFlags, Pkcs11},
    error::RvError,
    mechanism::Mechanism,
    object::{Attribute, AttributeType, KeyType, ObjectClass},
    session::{Session, UserType},
};
use openssl::{
    hash::MessageDigest,
    pkcs12::Pkcs12,
    pkey::{Id, PKey, Private},
    pkey_ctx::PkeyCtx,
    x509::{X509, X509Ref, X509VerifyResult},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{
    cache::Closable,
    error::ProductError,
    protocol::{self, DigestAlgorithm},
};

/// The longest chain assembled from the certificates on a token.
const MAX_CHAIN_LENGTH: usize = 8;

/// A configured source of signing keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Product {
    /// A PKCS #11 module, such as OpenSC for smart cards.
    Pkcs11 {
        /// Path to the module's shared library.
        library: PathBuf,
        /// Only use the token in this slot.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot: Option<u64>,
        /// Only use the token with this label.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// A file containing the token's user PIN.
        ///
        /// Relative paths are relative to the credentials directory. Without a PIN file, the
        /// user is asked for the PIN.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pin_file: Option<PathBuf>,
    },
    /// A PKCS #12 keystore file.
    Pkcs12 {
        path: PathBuf,
        /// A file containing the keystore's password; see `pin_file` above.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password_file: Option<PathBuf>,
    },
}

impl Product {
    /// A stable identifier for this product, used as the token id in the protocol and to
    /// decide whether a cached session belongs to it.
    pub fn identity(&self) -> String {
        match self {
            Product::Pkcs11 {
                library,
                slot,
                label,
                ..
            } => {
                let mut identity = format!("pkcs11:{}", library.display());
                if let Some(slot) = slot {
                    identity.push_str(&format!(";slot={slot}"));
                }
                if let Some(label) = label {
                    identity.push_str(&format!(";label={label}"));
                }
                identity
            }
            Product::Pkcs12 { path, .. } => format!("pkcs12:{}", path.display()),
        }
    }

    /// The file holding this product's secret, if one is configured.
    pub fn secret_file(&self) -> Option<&Path> {
        match self {
            Product::Pkcs11 { pin_file, .. } => pin_file.as_deref(),
            Product::Pkcs12 { password_file, .. } => password_file.as_deref(),
        }
    }

    pub(crate) fn secret_file_mut(&mut self) -> Option<&mut PathBuf> {
        match self {
            Product::Pkcs11 { pin_file, .. } => pin_file.as_mut(),
            Product::Pkcs12 { password_file, .. } => password_file.as_mut(),
        }
    }

    /// Open a session, logging in with `secret`.
    pub fn connect(&self, secret: &SecretString) -> Result<TokenSession, ProductError> {
        match self {
            Product::Pkcs11 {
                library,
                slot,
                label,
                ..
            } => Pkcs11Session::open(self.identity(), library, *slot, label.as_deref(), secret)
                .map(TokenSession::Pkcs11),
            Product::Pkcs12 { path, .. } => {
                KeystoreSession::open(self.identity(), path, secret).map(TokenSession::Keystore)
            }
        }
    }
}

/// Signature algorithms supported on tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA with PKCS #1 v1.5 padding.
    Rsa,
    Ecdsa,
}

impl KeyAlgorithm {
    /// The name used for the algorithm in the protocol.
    pub fn name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ecdsa => "ECDSA",
        }
    }
}

/// A key on a token, along with its certificate.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub key_id: Vec<u8>,
    pub label: String,
    pub algorithm: KeyAlgorithm,
    pub certificate: X509,
    /// The issuers of `certificate` found alongside it, closest first.
    pub chain: Vec<X509>,
}

impl AsRef<X509Ref> for KeyEntry {
    fn as_ref(&self) -> &X509Ref {
        &self.certificate
    }
}

/// An open, logged-in session with a product.
#[derive(Debug)]
pub enum TokenSession {
    Pkcs11(Pkcs11Session),
    Keystore(KeystoreSession),
}

impl TokenSession {
    /// The identity of the product this session belongs to.
    pub fn token_id(&self) -> &str {
        match self {
            TokenSession::Pkcs11(session) => &session.token_id,
            TokenSession::Keystore(session) => &session.token_id,
        }
    }

    /// Keys that have a certificate. Keys without one can't be offered to the portal.
    pub fn get_keys(&self) -> Result<Vec<KeyEntry>, ProductError> {
        match self {
            TokenSession::Pkcs11(session) => session.get_keys(),
            TokenSession::Keystore(session) => session.get_keys(),
        }
    }

    /// Sign `digest`, computed with `algorithm`, with the key identified by `key_id`.
    ///
    /// RSA signatures use PKCS #1 v1.5 padding. ECDSA signatures are DER-encoded.
    pub fn sign(
        &self,
        key_id: &[u8],
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, ProductError> {
        if digest.len() != algorithm.size() {
            return Err(ProductError::Fatal(anyhow::anyhow!(
                "The specified digest algorithm is {} bytes; payload was {}",
                algorithm.size(),
                digest.len()
            )));
        }
        match self {
            TokenSession::Pkcs11(session) => session.sign(key_id, algorithm, digest),
            TokenSession::Keystore(session) => session.sign(key_id, algorithm, digest),
        }
    }
}

impl Closable for TokenSession {
    fn close(&self) {
        match self {
            TokenSession::Pkcs11(session) => {
                if session.session.lock().expect("lock is poisoned").take().is_some() {
                    tracing::debug!(token = session.token_id, "Closed PKCS #11 session");
                }
            }
            TokenSession::Keystore(session) => {
                if session.key.lock().expect("lock is poisoned").take().is_some() {
                    tracing::debug!(token = session.token_id, "Closed keystore");
                }
            }
        }
    }
}

pub struct Pkcs11Session {
    token_id: String,
    // Kept so the module stays initialized for the session's lifetime.
    _pkcs11: Pkcs11,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for Pkcs11Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Session")
            .field("token_id", &self.token_id)
            .finish()
    }
}

impl Pkcs11Session {
    fn open(
        token_id: String,
        library: &Path,
        slot_id: Option<u64>,
        label: Option<&str>,
        pin: &SecretString,
    ) -> Result<Self, ProductError> {
        let pkcs11 = Pkcs11::new(library)?;
        match pkcs11.initialize(CInitializeArgs::new(CInitializeFlags::OS_LOCKING_OK)) {
            Ok(()) => {}
            // Another session from this process already initialized the module.
            Err(cryptoki::error::Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(error) => return Err(error.into()),
        }

        let mut slot = None;
        for candidate in pkcs11.get_slots_with_token()? {
            if slot_id.is_some_and(|id| candidate.id() != id) {
                continue;
            }
            if let Some(label) = label {
                let info = pkcs11.get_token_info(candidate)?;
                if info.label().trim() != label {
                    continue;
                }
            }
            slot = Some(candidate);
            break;
        }
        let slot = slot.ok_or_else(|| ProductError::NoToken(token_id.clone()))?;

        let session = pkcs11.open_ro_session(slot)?;
        match session.login(UserType::User, Some(pin)) {
            Ok(()) => {}
            Err(cryptoki::error::Error::Pkcs11(
                RvError::PinIncorrect | RvError::PinInvalid | RvError::PinLenRange,
                _,
            )) => return Err(ProductError::BadSecret(token_id)),
            Err(cryptoki::error::Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
            Err(error) => return Err(error.into()),
        }
        tracing::info!(token = token_id, slot = slot.id(), "Logged in to PKCS #11 token");

        Ok(Self {
            token_id,
            _pkcs11: pkcs11,
            session: Mutex::new(Some(session)),
        })
    }

    fn get_keys(&self) -> Result<Vec<KeyEntry>, ProductError> {
        let session = self.session.lock().expect("lock is poisoned");
        let session = session.as_ref().ok_or(ProductError::Closed)?;

        let mut private_keys = vec![];
        let private_key_attributes = [AttributeType::Id, AttributeType::Label, AttributeType::KeyType];
        for object in session.iter_objects(&[Attribute::Class(ObjectClass::PRIVATE_KEY)])? {
            let attributes = session.get_attributes(object?, &private_key_attributes)?;
            let mut key_id = None;
            let mut label = String::new();
            let mut key_type = None;
            for attr in attributes {
                match attr {
                    Attribute::Id(id) => key_id = Some(id),
                    Attribute::Label(l) => label = String::from_utf8_lossy(&l).into_owned(),
                    Attribute::KeyType(kt) => key_type = Some(kt),
                    _ => {}
                }
            }
            let algorithm = match key_type {
                Some(KeyType::RSA) => KeyAlgorithm::Rsa,
                Some(KeyType::EC) => KeyAlgorithm::Ecdsa,
                _ => {
                    tracing::debug!(label, "Skipping key of unsupported type");
                    continue;
                }
            };
            if let Some(key_id) = key_id {
                private_keys.push((key_id, label, algorithm));
            }
        }

        let mut certificates = vec![];
        let certificate_attributes = [AttributeType::Id, AttributeType::Value];
        for object in session.iter_objects(&[Attribute::Class(ObjectClass::CERTIFICATE)])? {
            let attributes = session.get_attributes(object?, &certificate_attributes)?;
            let mut key_id = vec![];
            let mut der = None;
            for attr in attributes {
                match attr {
                    Attribute::Id(id) => key_id = id,
                    Attribute::Value(value) => der = Some(value),
                    _ => {}
                }
            }
            match der.as_deref().map(X509::from_der) {
                Some(Ok(certificate)) => certificates.push((key_id, certificate)),
                Some(Err(error)) => tracing::warn!(?error, "Skipping unparsable certificate"),
                None => {}
            }
        }

        let pool: Vec<X509> = certificates.iter().map(|(_, c)| c.clone()).collect();
        let entries = private_keys
            .into_iter()
            .filter_map(|(key_id, label, algorithm)| {
                let certificate = certificates
                    .iter()
                    .find(|(id, _)| *id == key_id)
                    .map(|(_, certificate)| certificate.clone())?;
                let chain = build_chain(&certificate, &pool);
                Some(KeyEntry {
                    key_id,
                    label,
                    algorithm,
                    certificate,
                    chain,
                })
            })
            .collect();
        Ok(entries)
    }

    fn sign(
        &self,
        key_id: &[u8],
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, ProductError> {
        let session = self.session.lock().expect("lock is poisoned");
        let session = session.as_ref().ok_or(ProductError::Closed)?;

        let key = session
            .find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Id(key_id.to_vec()),
            ])?
            .into_iter()
            .next()
            .ok_or_else(|| ProductError::KeyNotFound(hex::encode(key_id)))?;
        let key_type = session
            .get_attributes(key, &[AttributeType::KeyType])?
            .into_iter()
            .find_map(|attr| match attr {
                Attribute::KeyType(kt) => Some(kt),
                _ => None,
            });

        // The input and output of the PKCS #11 mechanisms don't match OpenSSL, so adjust
        // them to match what a softkey signature looks like.
        match key_type {
            Some(KeyType::RSA) => {
                let digest_info = protocol::encode_digest_info(algorithm, digest)?;
                Ok(session.sign(&Mechanism::RsaPkcs, key, &digest_info)?)
            }
            Some(KeyType::EC) => {
                let signature = session.sign(&Mechanism::Ecdsa, key, digest)?;
                ecdsa_to_der(&signature)
            }
            other => Err(ProductError::UnsupportedKey(format!("{other:?}"))),
        }
    }
}

/// Convert the raw `r || s` ECDSA signature PKCS #11 returns into DER.
///
/// Refer to https://www.ietf.org/rfc/rfc6979.html#appendix-A.1.3.
fn ecdsa_to_der(signature: &[u8]) -> Result<Vec<u8>, ProductError> {
    if signature.is_empty() || signature.len() % 2 != 0 {
        return Err(ProductError::UnsupportedKey(format!(
            "ECDSA signature of {} bytes",
            signature.len()
        )));
    }
    let (r, s) = signature.split_at(signature.len() / 2);
    let r = openssl::bn::BigNum::from_slice(r)?;
    let s = openssl::bn::BigNum::from_slice(s)?;
    let signature = openssl::ecdsa::EcdsaSig::from_private_components(r, s)?;
    Ok(signature.to_der()?)
}

/// Follow issuers from `certificate` through `pool`, closest issuer first.
fn build_chain(certificate: &X509Ref, pool: &[X509]) -> Vec<X509> {
    let mut chain: Vec<X509> = vec![];
    let mut current = certificate.to_owned();
    while chain.len() < MAX_CHAIN_LENGTH {
        if current.issued(&current) == X509VerifyResult::OK {
            break;
        }
        let issuer = pool.iter().find(|candidate| {
            candidate.issued(&current) == X509VerifyResult::OK
                && !chain
                    .iter()
                    .any(|known| known.to_der().ok() == candidate.to_der().ok())
        });
        match issuer {
            Some(issuer) => {
                chain.push(issuer.clone());
                current = issuer.clone();
            }
            None => break,
        }
    }
    chain
}

pub struct KeystoreSession {
    token_id: String,
    key: Mutex<Option<Keystore>>,
}

struct Keystore {
    pkey: PKey<Private>,
    certificate: X509,
    chain: Vec<X509>,
}

impl std::fmt::Debug for KeystoreSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreSession")
            .field("token_id", &self.token_id)
            .finish()
    }
}

impl KeystoreSession {
    fn open(token_id: String, path: &Path, password: &SecretString) -> Result<Self, ProductError> {
        let der = std::fs::read(path)?;
        let parsed = Pkcs12::from_der(&der)?
            .parse2(password.expose_secret())
            .map_err(|error| {
                tracing::debug!(?error, "Unable to decrypt keystore");
                ProductError::BadSecret(token_id.clone())
            })?;
        let (Some(pkey), Some(certificate)) = (parsed.pkey, parsed.cert) else {
            return Err(ProductError::KeyNotFound(format!(
                "no key and certificate in {}",
                path.display()
            )));
        };
        let pool: Vec<X509> = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();
        let chain = build_chain(&certificate, &pool);
        tracing::info!(token = token_id, "Opened keystore");

        Ok(Self {
            token_id,
            key: Mutex::new(Some(Keystore {
                pkey,
                certificate,
                chain,
            })),
        })
    }

    /// Keystore keys are identified by the SHA-1 fingerprint of their certificate.
    fn key_id(certificate: &X509Ref) -> Result<Vec<u8>, ProductError> {
        Ok(certificate.digest(MessageDigest::sha1())?.to_vec())
    }

    fn get_keys(&self) -> Result<Vec<KeyEntry>, ProductError> {
        let keystore = self.key.lock().expect("lock is poisoned");
        let keystore = keystore.as_ref().ok_or(ProductError::Closed)?;
        let algorithm = match keystore.pkey.id() {
            Id::RSA => KeyAlgorithm::Rsa,
            Id::EC => KeyAlgorithm::Ecdsa,
            other => return Err(ProductError::UnsupportedKey(format!("{other:?}"))),
        };
        let label = keystore
            .certificate
            .subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|name| name.to_string())
            .unwrap_or_default();

        Ok(vec![KeyEntry {
            key_id: Self::key_id(&keystore.certificate)?,
            label,
            algorithm,
            certificate: keystore.certificate.clone(),
            chain: keystore.chain.clone(),
        }])
    }

    fn sign(
        &self,
        key_id: &[u8],
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, ProductError> {
        let keystore = self.key.lock().expect("lock is poisoned");
        let keystore = keystore.as_ref().ok_or(ProductError::Closed)?;
        if Self::key_id(&keystore.certificate)? != key_id {
            return Err(ProductError::KeyNotFound(hex::encode(key_id)));
        }

        let mut ctx = PkeyCtx::new(&keystore.pkey)?;
        ctx.sign_init()?;
        ctx.set_signature_md(algorithm.md())?;
        if keystore.pkey.id() == Id::RSA {
            // PKCS #1 should be the default, but lets be explicit about it.
            ctx.set_rsa_padding(openssl::rsa::Padding::PKCS1)?;
        }
        let mut signature = vec![];
        ctx.sign_to_vec(digest, &mut signature)?;
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use openssl::{pkcs12::Pkcs12, stack::Stack};

    use super::*;
    use crate::test_utils::{LeafUsage, mint_ca, mint_intermediate, mint_leaf};

    fn keystore(dir: &Path, password: &str) -> Result<(PathBuf, X509, X509)> {
        let root = mint_ca("Root CA")?;
        let intermediate = mint_intermediate("Issuing CA", &root)?;
        let signer = mint_leaf(
            "Jane Signer",
            &intermediate,
            LeafUsage {
                non_repudiation: true,
                ..Default::default()
            },
        )?;
        let mut ca = Stack::new()?;
        ca.push(root.certificate.clone())?;
        ca.push(intermediate.certificate.clone())?;
        let pkcs12 = Pkcs12::builder()
            .name("signer")
            .pkey(&signer.key)
            .cert(&signer.certificate)
            .ca(ca)
            .build2(password)?;
        let path = dir.join("signer.p12");
        std::fs::write(&path, pkcs12.to_der()?)?;
        Ok((path, signer.certificate, intermediate.certificate))
    }

    #[test]
    fn keystore_signs_digests() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (path, certificate, intermediate) = keystore(dir.path(), "hunter2")?;
        let product = Product::Pkcs12 {
            path: path.clone(),
            password_file: None,
        };

        let session = product.connect(&SecretString::from("hunter2"))?;
        assert_eq!(session.token_id(), format!("pkcs12:{}", path.display()));
        let keys = session.get_keys()?;
        assert_eq!(keys.len(), 1);
        let key = &keys[0];
        assert_eq!(key.label, "Jane Signer");
        assert_eq!(key.algorithm, KeyAlgorithm::Rsa);
        assert_eq!(key.chain.len(), 2);
        assert_eq!(key.chain[0].to_der()?, intermediate.to_der()?);

        let digest = openssl::hash::hash(MessageDigest::sha256(), b"contract")?;
        let signature = session.sign(&key.key_id, DigestAlgorithm::Sha256, &digest)?;

        let public_key = certificate.public_key()?;
        let mut ctx = PkeyCtx::new(&public_key)?;
        ctx.verify_init()?;
        ctx.set_signature_md(openssl::md::Md::sha256())?;
        ctx.set_rsa_padding(openssl::rsa::Padding::PKCS1)?;
        assert!(ctx.verify(&digest, &signature)?);
        Ok(())
    }

    #[test]
    fn keystore_refuses_wrong_password() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (path, _, _) = keystore(dir.path(), "hunter2")?;
        let product = Product::Pkcs12 {
            path,
            password_file: None,
        };

        let result = product.connect(&SecretString::from("hunter3"));
        assert!(matches!(result, Err(ProductError::BadSecret(_))));
        Ok(())
    }

    #[test]
    fn closed_sessions_refuse_work() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (path, _, _) = keystore(dir.path(), "hunter2")?;
        let product = Product::Pkcs12 {
            path,
            password_file: None,
        };
        let session = product.connect(&SecretString::from("hunter2"))?;
        let key_id = session.get_keys()?[0].key_id.clone();

        session.close();
        session.close();
        assert!(matches!(session.get_keys(), Err(ProductError::Closed)));
        let digest = [0; 32];
        assert!(matches!(
            session.sign(&key_id, DigestAlgorithm::Sha256, &digest),
            Err(ProductError::Closed)
        ));
        Ok(())
    }

    #[test]
    fn digest_length_is_checked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (path, _, _) = keystore(dir.path(), "hunter2")?;
        let product = Product::Pkcs12 {
            path,
            password_file: None,
        };
        let session = product.connect(&SecretString::from("hunter2"))?;
        let key_id = session.get_keys()?[0].key_id.clone();

        let result = session.sign(&key_id, DigestAlgorithm::Sha512, &[0; 32]);
        assert!(matches!(result, Err(ProductError::Fatal(_))));
        Ok(())
    }

    #[test]
    fn raw_ecdsa_signatures_become_der() -> Result<()> {
        let mut raw = vec![0x11; 32];
        raw.extend([0x22; 32]);
        let der = ecdsa_to_der(&raw)?;
        let parsed = openssl::ecdsa::EcdsaSig::from_der(&der)?;
        assert_eq!(parsed.r().to_vec(), vec![0x11; 32]);
        assert_eq!(parsed.s().to_vec(), vec![0x22; 32]);

        assert!(ecdsa_to_der(&raw[..63]).is_err());
        Ok(())
    }

    #[test]
    fn product_identity() {
        let product: Product = toml::from_str(
            r#"
            type = "pkcs11"
            library = "/usr/lib64/opensc-pkcs11.so"
            slot = 1
            label = "PIV Card"
            "#,
        )
        .expect("valid product");
        assert_eq!(
            product.identity(),
            "pkcs11:/usr/lib64/opensc-pkcs11.so;slot=1;label=PIV Card"
        );
    }
}
