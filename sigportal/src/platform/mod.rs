// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The work the portal asks for, performed on this machine.
//!
//! The [`dispatch`](crate::dispatch) loop only knows about the [`Platform`] capability.
//! [`LocalPlatform`] implements it with the signing backends in [`product`], asking the user
//! for input through [`Dialogs`].

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use crate::{
    cache::CredentialCache,
    clock::Clock,
    error::{DispatchError, ProductError, TransportError},
    filter::filter_entries,
    protocol::{
        AuditInfo, CertificateResult, DigestAlgorithm, ErrorCode, Execution, SessionValue,
        SignatureResult, WorkRequest,
    },
    session::SessionAuthenticator,
    store::HardwareStore,
    trust::TrustStore,
};

pub mod product;

use product::{KeyEntry, Product, TokenSession};

/// Everything the dispatch loop needs from the machine it runs on.
pub trait Platform: Send + Sync {
    /// A new exchange with the portal is starting.
    fn begin_exchange(&self, locale: Option<&str>);

    /// The exchange has ended, successfully or not.
    fn end_exchange(&self);

    /// Check that a work request belongs to the exchange in progress.
    fn check_session(&self, session: &SessionValue) -> Execution<bool>;

    /// Select a certificate for later signing.
    fn get_certificate(
        &self,
        request: &WorkRequest,
    ) -> impl Future<Output = Execution<CertificateResult>> + Send;

    /// Sign the digest in `request`.
    fn sign(&self, request: &WorkRequest) -> impl Future<Output = Execution<SignatureResult>> + Send;

    /// Show a notification, optionally closing it after `delay`.
    fn push_notification(&self, text: &str, close: bool, delay: Duration);

    /// When the hardware support dataset was last stored.
    fn last_hardware_sync(&self) -> Option<SystemTime>;

    /// Store the hardware support dataset received at `now`.
    fn store_supported_hardware(&self, dataset: &serde_json::Value, now: SystemTime);

    /// Close any open token, forget any secret, and unbind the session.
    ///
    /// Called whenever an exchange ends other than successfully.
    fn teardown(&self);

    /// Tell the user about a failed exchange if they can act on it.
    fn handle_failure(&self, error: &DispatchError) -> impl Future<Output = ()> + Send;
}

/// Interaction with the person at the keyboard.
///
/// All methods may block while waiting for the user.
pub trait Dialogs: Send + Sync + 'static {
    /// Switch the language of subsequent dialogs.
    fn set_locale(&self, _locale: Option<&str>) {}

    /// Ask for the PIN or password of `product`. [`None`] means the user declined.
    fn ask_secret(&self, product: &Product) -> Option<SecretString>;

    /// Pick one of several products. [`None`] means the user declined.
    fn select_product(&self, products: &[Product]) -> Option<usize>;

    /// Pick one of several keys. [`None`] means the user declined.
    fn select_key(&self, keys: &[KeyEntry]) -> Option<usize>;

    /// Ask whether to trust the chain `host` presented from now on.
    fn review_chain(&self, host: &str, chain: &[X509]) -> bool;

    fn show_error(&self, title: &str, message: &str);

    fn notify(&self, text: &str, close: bool, delay: Duration);
}

/// Dialogs for an agent without a user interface.
///
/// Notifications and errors go to the log. Choices are made only when there's nothing to
/// choose between; everything else is declined.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDialogs;

impl Dialogs for LogDialogs {
    fn ask_secret(&self, product: &Product) -> Option<SecretString> {
        tracing::warn!(
            product = %product.identity(),
            "A PIN is required but no PIN file is configured; declining"
        );
        None
    }

    fn select_product(&self, products: &[Product]) -> Option<usize> {
        if products.len() == 1 {
            return Some(0);
        }
        tracing::warn!(count = products.len(), "Unable to choose between products; declining");
        None
    }

    fn select_key(&self, keys: &[KeyEntry]) -> Option<usize> {
        if keys.len() == 1 {
            return Some(0);
        }
        tracing::warn!(count = keys.len(), "Unable to choose between keys; declining");
        None
    }

    fn review_chain(&self, host: &str, chain: &[X509]) -> bool {
        tracing::warn!(
            host,
            certificates = chain.len(),
            "Refusing to trust an unknown certificate chain without review"
        );
        false
    }

    fn show_error(&self, title: &str, message: &str) {
        tracing::error!(title, message, "Error");
    }

    fn notify(&self, text: &str, close: bool, delay: Duration) {
        tracing::info!(text, close, ?delay, "Notification");
    }
}

/// Why a piece of work was refused; becomes a failed [`Execution`].
#[derive(Debug)]
struct Refusal {
    code: ErrorCode,
    message: String,
    forget_secret: bool,
}

impl Refusal {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            forget_secret: false,
        }
    }

    fn cancelled() -> Self {
        Self::new(ErrorCode::UserCancelled, "the user cancelled the operation")
    }

    fn into_execution<T>(self) -> Execution<T> {
        Execution::failure(self.code, self.message)
    }
}

impl From<ProductError> for Refusal {
    fn from(error: ProductError) -> Self {
        tracing::error!(%error, "Signing backend failed");
        match error {
            ProductError::BadSecret(_) => Self {
                code: ErrorCode::TokenFailure,
                message: "the PIN or password is incorrect".into(),
                forget_secret: true,
            },
            ProductError::NoToken(_) => Self::new(ErrorCode::NoProductFound, "no token is present"),
            ProductError::KeyNotFound(_) => Self::new(ErrorCode::NoKeyFound, "the key was not found"),
            _ => Self::new(ErrorCode::TokenFailure, "the token failed"),
        }
    }
}

/// Run blocking backend work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, Refusal>
where
    F: FnOnce() -> Result<T, ProductError> + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        work()
    })
    .await
    .map_err(|error| {
        tracing::error!(?error, "Signing task failed to complete");
        Refusal::new(ErrorCode::Failure, "the signing task failed")
    })?
    .map_err(Refusal::from)
}

/// Configuration for a [`LocalPlatform`].
#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// Products the user has configured.
    pub products: Vec<Product>,
    /// Directories holding PKCS #11 modules the portal may suggest by file name.
    pub pkcs11_directories: Vec<PathBuf>,
    /// How long a PIN or password is remembered.
    pub secret_ttl: Duration,
    /// The certificate whose key signs portal sessions.
    pub session_certificate: Option<PathBuf>,
    pub state_directory: PathBuf,
}

/// A [`Platform`] using the tokens and keystores on this machine.
pub struct LocalPlatform<D, C> {
    products: Vec<Product>,
    pkcs11_directories: Vec<PathBuf>,
    secret_ttl: Duration,
    dialogs: Arc<D>,
    clock: C,
    cache: CredentialCache<TokenSession>,
    sessions: SessionAuthenticator,
    trust: Arc<TrustStore>,
    hardware: HardwareStore,
}

impl<D: Dialogs, C: Clock> LocalPlatform<D, C> {
    /// Set up the platform.
    ///
    /// # Errors
    ///
    /// An error is returned if the session certificate is configured but can't be read.
    pub fn new(
        options: LocalOptions,
        trust: Arc<TrustStore>,
        dialogs: D,
        clock: C,
    ) -> anyhow::Result<Self> {
        let trust_certificate = match &options.session_certificate {
            Some(path) => Some(
                std::fs::read(path)
                    .map_err(anyhow::Error::from)
                    .and_then(|pem| Ok(X509::from_pem(&pem)?))
                    .with_context(|| {
                        format!("failed to load the session certificate {}", path.display())
                    })?,
            ),
            None => {
                tracing::warn!("No session certificate is configured; all work will be refused");
                None
            }
        };

        Ok(Self {
            products: options.products,
            pkcs11_directories: options.pkcs11_directories,
            secret_ttl: options.secret_ttl,
            dialogs: Arc::new(dialogs),
            clock,
            cache: CredentialCache::new(),
            sessions: SessionAuthenticator::new(trust_certificate),
            trust,
            hardware: HardwareStore::open(&options.state_directory),
        })
    }

    /// The credential cache, shared with whoever needs to flush it.
    pub fn cache(&self) -> &CredentialCache<TokenSession> {
        &self.cache
    }

    /// Configured products, plus any smart card the portal suggests whose module is installed
    /// in one of the PKCS #11 module directories.
    fn candidates(&self, request: &WorkRequest) -> Vec<Product> {
        let mut products = self.products.clone();
        for card in request.smartcards.iter().flatten() {
            let Some(library) = card.pkcs11_library.as_deref() else {
                continue;
            };
            let Some(library) = find_module(&self.pkcs11_directories, library) else {
                tracing::debug!(atr = %card.atr, library, "Suggested module is not installed");
                continue;
            };
            let product = Product::Pkcs11 {
                library,
                slot: None,
                label: None,
                pin_file: None,
            };
            if !products.iter().any(|known| known.identity() == product.identity()) {
                products.push(product);
            }
        }
        products
    }

    /// Ask the user something without blocking the runtime.
    async fn ask<T, F>(&self, question: F) -> Option<T>
    where
        F: FnOnce(&D) -> Option<T> + Send + 'static,
        T: Send + 'static,
    {
        let dialogs = self.dialogs.clone();
        tokio::task::spawn_blocking(move || question(&dialogs))
            .await
            .inspect_err(|error| tracing::error!(?error, "Dialog failed"))
            .ok()
            .flatten()
    }

    async fn secret_for(&self, product: &Product) -> Result<SecretString, Refusal> {
        if let Some(secret) = self.cache.get_secret_for_product(&product.identity()) {
            return Ok(secret);
        }
        if let Some(path) = product.secret_file() {
            let contents = tokio::fs::read_to_string(path).await.map_err(|error| {
                tracing::error!(path = %path.display(), ?error, "Unable to read secret file");
                Refusal::new(ErrorCode::TokenFailure, "the PIN file could not be read")
            })?;
            return Ok(SecretString::from(
                contents.trim_end_matches(['\r', '\n']).to_string(),
            ));
        }
        let product = product.clone();
        self.ask(move |dialogs| dialogs.ask_secret(&product))
            .await
            .ok_or_else(Refusal::cancelled)
    }

    /// Get a logged-in session for `product`, from the cache if possible.
    async fn open_session(&self, product: &Product) -> Result<Arc<TokenSession>, Refusal> {
        let identity = product.identity();
        if let Some(session) = self.cache.get_initialized_token_for_product(&identity) {
            tracing::debug!(product = %identity, "Using cached session");
            return Ok(session);
        }
        let secret = self.secret_for(product).await?;
        let connecting = product.clone();
        let login = SecretString::from(secret.expose_secret().to_owned());
        let session = blocking(move || connecting.connect(&login))
            .await
            .inspect_err(|refusal| {
                if refusal.forget_secret {
                    self.cache.destroy_secret();
                }
            })?;

        self.cache.set_secret(&identity, secret, self.secret_ttl);
        Ok(self.cache.set_token(&identity, session))
    }

    async fn select_certificate(
        &self,
        request: &WorkRequest,
    ) -> Result<(CertificateResult, String), Refusal> {
        let candidates = self.candidates(request);
        if candidates.is_empty() {
            return Err(Refusal::new(ErrorCode::NoProductFound, "no product is available"));
        }
        let choice = if candidates.len() == 1 {
            Some(0)
        } else {
            let choices = candidates.clone();
            self.ask(move |dialogs| dialogs.select_product(&choices)).await
        };
        let product = choice
            .and_then(|index| candidates.get(index))
            .ok_or_else(Refusal::cancelled)?;
        let identity = product.identity();

        let session = self.open_session(product).await?;
        let keys = blocking(move || session.get_keys()).await?;
        let keys = filter_entries(keys, request.certificate_filter.as_ref(), self.clock.now());
        if keys.is_empty() {
            return Err(Refusal::new(
                ErrorCode::NoKeyFound,
                "no key matches the requested certificate",
            ));
        }
        let choice = if keys.len() == 1 {
            Some(0)
        } else {
            let choices = keys.clone();
            self.ask(move |dialogs| dialogs.select_key(&choices)).await
        };
        let key = choice
            .and_then(|index| keys.get(index))
            .ok_or_else(Refusal::cancelled)?;
        tracing::info!(product = %identity, key = %key.label, "Selected certificate");

        let result = CertificateResult {
            token_id: identity.clone(),
            key_id: hex::encode(&key.key_id),
            certificate: der(&key.certificate)?,
            certificate_chain: key.chain.iter().map(der).collect::<Result<_, _>>()?,
            encryption_algorithm: key.algorithm.name().to_string(),
            supported_digests: DigestAlgorithm::ALL.to_vec(),
        };
        Ok((result, identity))
    }

    async fn produce_signature(
        &self,
        request: &WorkRequest,
    ) -> Result<(SignatureResult, String), Refusal> {
        let (Some(token_id), Some(key_id), Some(digest), Some(algorithm)) = (
            request.token_id.as_deref(),
            request.key_id.as_deref(),
            request.to_be_signed.clone(),
            request.digest_algorithm,
        ) else {
            return Err(Refusal::new(
                ErrorCode::InvalidRequest,
                "the token, key, digest and digest algorithm are required",
            ));
        };
        let key_id = hex::decode(key_id)
            .map_err(|_| Refusal::new(ErrorCode::InvalidRequest, "the key id is not hex"))?;
        let product = self
            .candidates(request)
            .into_iter()
            .find(|product| product.identity() == token_id)
            .ok_or_else(|| Refusal::new(ErrorCode::NoProductFound, "the token is not available"))?;

        let session = self.open_session(&product).await?;
        let (signature, key) = blocking(move || {
            let key = session
                .get_keys()?
                .into_iter()
                .find(|key| key.key_id == key_id)
                .ok_or_else(|| ProductError::KeyNotFound(hex::encode(&key_id)))?;
            let signature = session.sign(&key.key_id, algorithm, &digest)?;
            Ok((signature, key))
        })
        .await
        .inspect_err(|refusal| {
            if refusal.code == ErrorCode::TokenFailure {
                self.cache.destroy_product(token_id);
            }
        })?;
        tracing::info!(product = token_id, key = %key.label, ?algorithm, "Produced signature");

        let result = SignatureResult {
            signature_value: signature,
            certificate: der(&key.certificate)?,
            certificate_chain: key.chain.iter().map(der).collect::<Result<_, _>>()?,
        };
        Ok((result, token_id.to_string()))
    }

    fn audit(&self, started: SystemTime, product: Option<String>) -> AuditInfo {
        let duration = self
            .clock
            .now()
            .duration_since(started)
            .unwrap_or(Duration::ZERO);
        AuditInfo::new(duration, product)
    }
}

fn der(certificate: &X509) -> Result<Vec<u8>, Refusal> {
    certificate.to_der().map_err(|error| {
        tracing::error!(?error, "Unable to encode certificate");
        Refusal::new(ErrorCode::Failure, "the certificate could not be encoded")
    })
}

/// Find `library` by file name in `directories`.
///
/// Names with a path component are refused so a portal can't load arbitrary files.
fn find_module(directories: &[PathBuf], library: &str) -> Option<PathBuf> {
    let name = Path::new(library);
    if name.file_name()? != name.as_os_str() {
        return None;
    }
    directories
        .iter()
        .map(|directory| directory.join(name))
        .find(|candidate| candidate.is_file())
}

impl<D: Dialogs, C: Clock> Platform for LocalPlatform<D, C> {
    fn begin_exchange(&self, locale: Option<&str>) {
        self.sessions.reset();
        self.dialogs.set_locale(locale);
    }

    fn end_exchange(&self) {
        self.sessions.reset();
    }

    fn check_session(&self, session: &SessionValue) -> Execution<bool> {
        if !self.sessions.is_bound()
            && let Err(error) = self.sessions.set_session_id(&session.session_id)
        {
            tracing::error!(%error, "Unable to bind the exchange to its session");
            return Execution::failure(ErrorCode::InvalidSession, "the session is not valid");
        }
        match self.sessions.check_session(session, self.clock.now()) {
            Ok(()) => Execution::success(true),
            Err(error) => {
                tracing::warn!(%error, "Refusing work from an invalid session");
                Execution::failure(ErrorCode::InvalidSession, "the session is not valid")
            }
        }
    }

    #[instrument(skip_all)]
    async fn get_certificate(&self, request: &WorkRequest) -> Execution<CertificateResult> {
        let started = self.clock.now();
        match self.select_certificate(request).await {
            Ok((result, product)) => {
                Execution::success(result).with_audit_info(self.audit(started, Some(product)))
            }
            Err(refusal) => refusal
                .into_execution()
                .with_audit_info(self.audit(started, None)),
        }
    }

    #[instrument(skip_all)]
    async fn sign(&self, request: &WorkRequest) -> Execution<SignatureResult> {
        let started = self.clock.now();
        match self.produce_signature(request).await {
            Ok((result, product)) => {
                Execution::success(result).with_audit_info(self.audit(started, Some(product)))
            }
            Err(refusal) => refusal
                .into_execution()
                .with_audit_info(self.audit(started, request.token_id.clone())),
        }
    }

    fn push_notification(&self, text: &str, close: bool, delay: Duration) {
        self.dialogs.notify(text, close, delay);
    }

    fn last_hardware_sync(&self) -> Option<SystemTime> {
        self.hardware.last_sync()
    }

    fn store_supported_hardware(&self, dataset: &serde_json::Value, now: SystemTime) {
        if let Err(error) = self.hardware.store(dataset, now) {
            tracing::error!(?error, "Unable to store the hardware support dataset");
        }
    }

    fn teardown(&self) {
        self.cache.destroy();
        self.sessions.reset();
    }

    async fn handle_failure(&self, error: &DispatchError) {
        if !error.wants_dialog() {
            return;
        }

        let message = error.to_string();
        let review = match error.transport() {
            Some(TransportError::Tls {
                host,
                presented_chain,
                ..
            }) if !presented_chain.is_empty() => Some((host.clone(), presented_chain.clone())),
            _ => None,
        };
        let accepted = self
            .ask(move |dialogs| {
                dialogs.show_error("Unable to complete the signing request", &message);
                review.filter(|(host, chain)| dialogs.review_chain(host, chain))
            })
            .await;

        if let Some((host, chain)) = accepted {
            match self.trust.accept_chain(&chain) {
                Ok(()) => tracing::info!(%host, "Now trusting the certificate chain"),
                Err(error) => tracing::error!(%host, %error, "Unable to trust the chain"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use openssl::{hash::MessageDigest, pkcs12::Pkcs12, rsa::Padding, stack::Stack};

    use super::*;
    use crate::{
        clock::SystemClock,
        protocol::{CertificateFilter, Operation},
        test_utils::{LeafUsage, Minted, mint_ca, mint_leaf},
    };

    /// Answers every PIN prompt with a fixed secret and counts the prompts.
    struct Scripted {
        secret: String,
        prompts: AtomicUsize,
        reviews: AtomicUsize,
    }

    impl Dialogs for Scripted {
        fn ask_secret(&self, _product: &Product) -> Option<SecretString> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            Some(SecretString::from(self.secret.clone()))
        }

        fn select_product(&self, _products: &[Product]) -> Option<usize> {
            None
        }

        fn select_key(&self, _keys: &[KeyEntry]) -> Option<usize> {
            None
        }

        fn review_chain(&self, _host: &str, _chain: &[X509]) -> bool {
            self.reviews.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn show_error(&self, _title: &str, _message: &str) {}

        fn notify(&self, _text: &str, _close: bool, _delay: Duration) {}
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        portal: Minted,
        signer: Minted,
        platform: LocalPlatform<Scripted, SystemClock>,
        product: Product,
    }

    fn fixture(secret: &str) -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let portal = mint_ca("Portal sessions")?;
        let ca = mint_ca("Signing CA")?;
        let signer = mint_leaf(
            "Jane Signer",
            &ca,
            LeafUsage {
                non_repudiation: true,
                ..Default::default()
            },
        )?;

        let mut chain = Stack::new()?;
        chain.push(ca.certificate.clone())?;
        let keystore = Pkcs12::builder()
            .name("signer")
            .pkey(&signer.key)
            .cert(&signer.certificate)
            .ca(chain)
            .build2("hunter2")?;
        let keystore_path = dir.path().join("signer.p12");
        std::fs::write(&keystore_path, keystore.to_der()?)?;
        let session_certificate = dir.path().join("portal.pem");
        std::fs::write(&session_certificate, portal.certificate.to_pem()?)?;

        let product = Product::Pkcs12 {
            path: keystore_path,
            password_file: None,
        };
        let options = LocalOptions {
            products: vec![product.clone()],
            pkcs11_directories: vec![],
            secret_ttl: Duration::from_secs(300),
            session_certificate: Some(session_certificate),
            state_directory: dir.path().to_path_buf(),
        };
        let trust = Arc::new(TrustStore::load(None, &[], dir.path())?);
        let dialogs = Scripted {
            secret: secret.to_string(),
            prompts: AtomicUsize::new(0),
            reviews: AtomicUsize::new(0),
        };
        let platform = LocalPlatform::new(options, trust, dialogs, SystemClock)?;

        Ok(Fixture {
            _dir: dir,
            portal,
            signer,
            platform,
            product,
        })
    }

    fn session(portal: &Minted, opaque: &str) -> Result<SessionValue> {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();
        let session_id = format!("{opaque}+{millis}");
        let rsa = portal.key.rsa()?;
        let digest = openssl::hash::hash(MessageDigest::sha512(), session_id.as_bytes())?;
        let mut padded = vec![0; rsa.size() as usize - digest.len()];
        padded.extend_from_slice(&digest);
        let mut signature = vec![0; rsa.size() as usize];
        rsa.private_encrypt(&padded, &mut signature, Padding::NONE)?;
        Ok(SessionValue {
            session_id,
            signature: STANDARD.encode(signature),
        })
    }

    fn request(operation: Operation, session: SessionValue) -> WorkRequest {
        WorkRequest {
            operation,
            description: "test".into(),
            session,
            smartcards: None,
            step_id: Some("step-1".into()),
            certificate_filter: None,
            token_id: None,
            key_id: None,
            to_be_signed: None,
            digest_algorithm: None,
            supported_hardware: None,
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn exchange_binds_to_first_session() -> Result<()> {
        let fixture = fixture("hunter2")?;
        fixture.platform.begin_exchange(Some("en"));

        let first = session(&fixture.portal, "exchange-one")?;
        assert!(fixture.platform.check_session(&first).success);
        assert!(fixture.platform.check_session(&first).success);

        let other = session(&fixture.portal, "exchange-two")?;
        let execution = fixture.platform.check_session(&other);
        assert!(!execution.success);
        assert_eq!(execution.error_code, Some(ErrorCode::InvalidSession));

        fixture.platform.end_exchange();
        assert!(fixture.platform.check_session(&other).success);
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn select_then_sign_reuses_session() -> Result<()> {
        let fixture = fixture("hunter2")?;
        let session = session(&fixture.portal, "exchange")?;

        let mut selection = request(Operation::GetCertificate, session.clone());
        selection.certificate_filter = Some(CertificateFilter {
            non_repudiation_bit: true,
            ..Default::default()
        });
        let execution = fixture.platform.get_certificate(&selection).await;
        assert!(execution.success, "{execution:?}");
        let certificate = execution.result.expect("certificate was selected");
        assert_eq!(certificate.token_id, fixture.product.identity());
        assert_eq!(certificate.certificate, fixture.signer.certificate.to_der()?);
        assert_eq!(certificate.certificate_chain.len(), 1);
        assert_eq!(certificate.encryption_algorithm, "RSA");
        assert!(execution.audit_info.is_some());

        let digest = openssl::hash::hash(MessageDigest::sha256(), b"contract")?;
        let mut signing = request(Operation::Sign, session);
        signing.token_id = Some(certificate.token_id.clone());
        signing.key_id = Some(certificate.key_id.clone());
        signing.to_be_signed = Some(digest.to_vec());
        signing.digest_algorithm = Some(DigestAlgorithm::Sha256);
        let execution = fixture.platform.sign(&signing).await;
        assert!(execution.success, "{execution:?}");
        let signature = execution.result.expect("signature was produced");
        assert!(!signature.signature_value.is_empty());

        // The PIN was asked for once; the second operation used the cached session.
        assert_eq!(fixture.platform.dialogs.prompts.load(Ordering::SeqCst), 1);
        assert!(fixture.platform.cache().has_token());
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn wrong_secret_is_forgotten() -> Result<()> {
        let fixture = fixture("hunter3")?;
        let session = session(&fixture.portal, "exchange")?;

        let execution = fixture
            .platform
            .get_certificate(&request(Operation::GetCertificate, session))
            .await;
        assert!(!execution.success);
        assert_eq!(execution.error_code, Some(ErrorCode::TokenFailure));
        assert!(
            fixture
                .platform
                .cache()
                .get_secret_for_product(&fixture.product.identity())
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn sign_requires_complete_request() -> Result<()> {
        let fixture = fixture("hunter2")?;
        let session = session(&fixture.portal, "exchange")?;

        let execution = fixture
            .platform
            .sign(&request(Operation::Sign, session.clone()))
            .await;
        assert_eq!(execution.error_code, Some(ErrorCode::InvalidRequest));

        let mut signing = request(Operation::Sign, session);
        signing.token_id = Some("pkcs12:/nowhere.p12".into());
        signing.key_id = Some("00".into());
        signing.to_be_signed = Some(vec![0; 32]);
        signing.digest_algorithm = Some(DigestAlgorithm::Sha256);
        let execution = fixture.platform.sign(&signing).await;
        assert_eq!(execution.error_code, Some(ErrorCode::NoProductFound));
        Ok(())
    }

    #[tokio::test]
    async fn teardown_flushes_the_cache() -> Result<()> {
        let fixture = fixture("hunter2")?;
        let session = session(&fixture.portal, "exchange")?;
        assert!(fixture.platform.check_session(&session).success);
        let execution = fixture
            .platform
            .get_certificate(&request(Operation::GetCertificate, session))
            .await;
        assert!(execution.success);
        assert!(fixture.platform.cache().has_token());
        assert!(fixture.platform.sessions.is_bound());

        let error = DispatchError::Transport(TransportError::Tls {
            host: "portal.example.com".into(),
            reason: "certificate verify failed".into(),
            presented_chain: vec![fixture.signer.certificate.clone()],
        });
        fixture.platform.teardown();
        assert!(!fixture.platform.cache().has_token());
        assert!(
            fixture
                .platform
                .cache()
                .get_secret_for_product(&fixture.product.identity())
                .is_none()
        );
        assert!(!fixture.platform.sessions.is_bound());

        fixture.platform.handle_failure(&error).await;
        assert_eq!(fixture.platform.dialogs.reviews.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn suggested_modules_must_be_installed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("opensc-pkcs11.so"), b"")?;
        let directories = vec![dir.path().to_path_buf()];

        assert_eq!(
            find_module(&directories, "opensc-pkcs11.so"),
            Some(dir.path().join("opensc-pkcs11.so"))
        );
        assert_eq!(find_module(&directories, "missing.so"), None);
        assert_eq!(find_module(&directories, "../opensc-pkcs11.so"), None);
        assert_eq!(find_module(&directories, "/usr/lib64/opensc-pkcs11.so"), None);
        Ok(())
    }

    #[test]
    fn log_dialogs_only_pick_sole_choices() {
        let product = Product::Pkcs12 {
            path: "/keystore.p12".into(),
            password_file: None,
        };
        assert_eq!(LogDialogs.select_product(std::slice::from_ref(&product)), Some(0));
        assert_eq!(LogDialogs.select_product(&[product.clone(), product.clone()]), None);
        assert!(LogDialogs.ask_secret(&product).is_none());
        assert!(!LogDialogs.review_chain("portal.example.com", &[]));
    }
}
