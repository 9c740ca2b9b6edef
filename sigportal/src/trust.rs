// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The set of certificates trusted for HTTPS connections.
//!
//! The [`TrustStore`] merges three sources of trust anchors:
//!
//! * a bundled anchor file shipped with the agent,
//! * the operating system's anchor bundles,
//! * chains the user has reviewed and accepted in the past, persisted in the state directory.
//!
//! Learned chains are only kept while they still lead to one of the anchors; a chain that no
//! longer does is dropped the next time the store is loaded.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use hyper_openssl::client::legacy::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use openssl::{
    ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion},
    x509::{
        X509, X509Ref, X509StoreContext, X509StoreContextRef, X509VerifyResult,
        store::X509StoreBuilder,
    },
};
use serde::{Deserialize, Serialize};

use crate::error::TrustError;

/// The file, relative to the state directory, holding learned chains.
pub const LEARNED_CHAINS_FILE: &str = "trusted-chains.json";

/// The certificates a host presented during its most recent TLS handshake.
#[derive(Debug, Clone, Default)]
pub struct PresentedChain {
    /// The presented chain, leaf first.
    pub certificates: Vec<X509>,
    /// Whether OpenSSL accepted the chain.
    pub verified: bool,
    /// The first verification error, if any.
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearnedChains {
    /// PEM-encoded chains, leaf-adjacent certificate first.
    chains: Vec<Vec<String>>,
}

type Presented = Arc<Mutex<HashMap<String, PresentedChain>>>;

pub struct TrustStore {
    /// Anchors keyed by the DER encoding of their subject name.
    anchors: HashMap<Vec<u8>, Vec<X509>>,
    learned: Mutex<Vec<Vec<X509>>>,
    learned_path: PathBuf,
    presented: Presented,
    connector: Mutex<Option<HttpsConnector<HttpConnector>>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("anchors", &self.anchor_count())
            .field("learned_path", &self.learned_path)
            .field("generation", &self.generation())
            .finish()
    }
}

impl TrustStore {
    /// Load the trust store.
    ///
    /// Anchor files that don't exist are skipped. Learned chains are read from
    /// [`LEARNED_CHAINS_FILE`] in `state_directory`; any chain that no longer validates is
    /// dropped and the file is rewritten without it.
    ///
    /// # Errors
    ///
    /// An error is returned if an anchor file exists but can't be parsed, or if the learned
    /// chains file can't be read or rewritten.
    pub fn load(
        bundled_anchors: Option<&Path>,
        system_anchors: &[PathBuf],
        state_directory: &Path,
    ) -> Result<Self, TrustError> {
        let mut anchors: HashMap<Vec<u8>, Vec<X509>> = HashMap::new();
        for path in bundled_anchors.into_iter().chain(system_anchors.iter().map(|p| p.as_path())) {
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "Anchor bundle not present; skipping");
                continue;
            }
            let certificates = X509::stack_from_pem(&std::fs::read(path)?)?;
            tracing::debug!(
                path = %path.display(),
                count = certificates.len(),
                "Loaded trust anchors"
            );
            for certificate in certificates {
                let key = certificate.subject_name().to_der()?;
                let bucket = anchors.entry(key).or_default();
                if !bucket.iter().any(|known| same_certificate(known, &certificate)) {
                    bucket.push(certificate);
                }
            }
        }

        let store = Self {
            anchors,
            learned: Mutex::new(vec![]),
            learned_path: state_directory.join(LEARNED_CHAINS_FILE),
            presented: Arc::new(Mutex::new(HashMap::new())),
            connector: Mutex::new(None),
            generation: AtomicU64::new(0),
        };
        store.load_learned_chains()?;
        Ok(store)
    }

    fn load_learned_chains(&self) -> Result<(), TrustError> {
        if !self.learned_path.is_file() {
            return Ok(());
        }
        let cached: LearnedChains =
            serde_json::from_slice(&std::fs::read(&self.learned_path)?)?;
        let total = cached.chains.len();

        let mut kept = vec![];
        for pem_chain in cached.chains {
            let chain = pem_chain
                .iter()
                .map(|pem| X509::from_pem(pem.as_bytes()))
                .collect::<Result<Vec<_>, _>>();
            match chain.map_err(TrustError::from).and_then(|chain| {
                self.validate_chain(&chain)?;
                Ok(chain)
            }) {
                Ok(chain) => kept.push(chain),
                Err(error) => {
                    tracing::warn!(%error, "Dropping learned certificate chain");
                }
            }
        }

        let dropped = total - kept.len();
        *self.learned.lock().expect("lock is poisoned") = kept;
        if dropped > 0 {
            tracing::info!(dropped, "Rewriting learned certificate chains");
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), TrustError> {
        let learned = self.learned.lock().expect("lock is poisoned");
        let chains = learned
            .iter()
            .map(|chain| {
                chain
                    .iter()
                    .map(|certificate| {
                        certificate
                            .to_pem()
                            .map(|pem| String::from_utf8_lossy(&pem).into_owned())
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let contents = serde_json::to_vec_pretty(&LearnedChains { chains })?;
        if let Some(parent) = self.learned_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.learned_path, contents)?;
        Ok(())
    }

    /// The number of distinct trust anchors.
    pub fn anchor_count(&self) -> usize {
        self.anchors.values().map(Vec::len).sum()
    }

    /// The chains learned so far, leaf-adjacent certificate first.
    pub fn learned_chains(&self) -> Vec<Vec<X509>> {
        self.learned.lock().expect("lock is poisoned").clone()
    }

    /// Incremented every time the set of trusted certificates changes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Check each certificate in `chain` is issued by the next, and that the last certificate
    /// is, or is issued by, a trust anchor.
    pub fn validate_chain(&self, chain: &[X509]) -> Result<(), TrustError> {
        let Some(last) = chain.last() else {
            return Err(TrustError::BrokenChain("the chain is empty".into()));
        };
        for (position, pair) in chain.windows(2).enumerate() {
            if !issued_by(&pair[0], &pair[1])? {
                return Err(TrustError::BrokenChain(format!(
                    "certificate {position} is not issued by certificate {}",
                    position + 1
                )));
            }
        }

        let issuer_key = last.issuer_name().to_der()?;
        let subject_key = last.subject_name().to_der()?;
        if self
            .anchors
            .get(&subject_key)
            .is_some_and(|bucket| bucket.iter().any(|anchor| same_certificate(anchor, last)))
        {
            return Ok(());
        }
        for anchor in self.anchors.get(&issuer_key).into_iter().flatten() {
            if issued_by(last, anchor)? {
                return Ok(());
            }
        }
        Err(TrustError::BrokenChain(
            "the chain does not end at a trust anchor".into(),
        ))
    }

    /// Trust a chain presented by a server, after the user has reviewed it.
    ///
    /// The leaf is dropped; the remaining certificates must validate as per
    /// [`TrustStore::validate_chain`]. The chain is persisted and HTTPS connectors built from
    /// now on trust it.
    pub fn accept_chain(&self, presented: &[X509]) -> Result<(), TrustError> {
        let chain = presented.get(1..).unwrap_or_default().to_vec();
        if chain.is_empty() {
            return Err(TrustError::BrokenChain(
                "the server presented no intermediate certificates".into(),
            ));
        }
        self.validate_chain(&chain)?;

        {
            let mut learned = self.learned.lock().expect("lock is poisoned");
            let duplicate = learned.iter().any(|known| {
                known.len() == chain.len()
                    && known.iter().zip(&chain).all(|(a, b)| same_certificate(a, b))
            });
            if duplicate {
                tracing::debug!("Certificate chain is already trusted");
                return Ok(());
            }
            learned.push(chain);
        }
        self.persist()?;

        self.connector.lock().expect("lock is poisoned").take();
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::info!(path = %self.learned_path.display(), "Learned a new certificate chain");
        Ok(())
    }

    /// The chain presented by `host` in its most recent handshake.
    pub fn presented_chain(&self, host: &str) -> Option<PresentedChain> {
        self.presented
            .lock()
            .expect("lock is poisoned")
            .get(host)
            .cloned()
    }

    /// An HTTPS connector trusting the anchors and learned chains.
    ///
    /// The connector is built on first use and reused until the set of trusted certificates
    /// changes.
    pub fn https_connector(&self) -> Result<HttpsConnector<HttpConnector>, TrustError> {
        let mut connector = self.connector.lock().expect("lock is poisoned");
        if let Some(connector) = connector.as_ref() {
            return Ok(connector.clone());
        }

        let built = self.build_connector()?;
        *connector = Some(built.clone());
        Ok(built)
    }

    fn build_connector(&self) -> Result<HttpsConnector<HttpConnector>, TrustError> {
        let mut store = X509StoreBuilder::new()?;
        store.set_default_paths()?;
        let learned = self.learned.lock().expect("lock is poisoned");
        for certificate in self.anchors.values().flatten().chain(learned.iter().flatten()) {
            if let Err(error) = store.add_cert(certificate.clone()) {
                tracing::debug!(?error, "Skipping certificate the store refused");
            }
        }
        drop(learned);

        let mut ssl = SslConnector::builder(SslMethod::tls_client())?;
        ssl.set_verify(SslVerifyMode::PEER);
        ssl.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        ssl.set_cert_store(store.build());

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let mut https = HttpsConnector::with_connector(http, ssl)?;

        let presented = self.presented.clone();
        https.set_callback(move |config, uri| {
            let host = uri.host().unwrap_or_default().to_string();
            presented
                .lock()
                .expect("lock is poisoned")
                .insert(host.clone(), PresentedChain::default());
            let presented = presented.clone();
            config.set_verify_callback(SslVerifyMode::PEER, move |preverify_ok, context| {
                record_presented(&presented, &host, preverify_ok, context);
                preverify_ok
            });
            Ok(())
        });

        tracing::debug!(anchors = self.anchor_count(), "Built HTTPS connector");
        Ok(https)
    }
}

/// Note what a host presented as OpenSSL walks its chain.
///
/// The verify callback runs once per certificate. Both the certificates the peer sent and the
/// chain OpenSSL managed to build are considered; the longest seen is kept.
fn record_presented(
    presented: &Mutex<HashMap<String, PresentedChain>>,
    host: &str,
    preverify_ok: bool,
    context: &mut X509StoreContextRef,
) {
    let built = context
        .chain()
        .map(|chain| chain.iter().map(X509Ref::to_owned).collect::<Vec<_>>());
    let sent = X509StoreContext::ssl_idx()
        .ok()
        .and_then(|index| context.ex_data(index))
        .and_then(|ssl| ssl.peer_cert_chain())
        .map(|chain| chain.iter().map(X509Ref::to_owned).collect::<Vec<_>>());
    // On ties the sent chain wins.
    let longest = [built, sent].into_iter().flatten().max_by_key(Vec::len);

    let mut presented = presented.lock().expect("lock is poisoned");
    let record = presented.entry(host.to_string()).or_default();
    if let Some(chain) = longest
        && chain.len() > record.certificates.len()
    {
        record.certificates = chain;
    } else if record.certificates.is_empty()
        && let Some(certificate) = context.current_cert()
    {
        record.certificates.push(certificate.to_owned());
    }

    if preverify_ok {
        if record.error.is_none() {
            record.verified = true;
        }
    } else {
        record.verified = false;
        record
            .error
            .get_or_insert_with(|| context.error().error_string().to_string());
    }
}

fn same_certificate(a: &X509Ref, b: &X509Ref) -> bool {
    match (a.to_der(), b.to_der()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Whether `issuer` issued `subject`: names line up and the signature verifies.
fn issued_by(subject: &X509Ref, issuer: &X509Ref) -> Result<bool, TrustError> {
    if issuer.issued(subject) != X509VerifyResult::OK {
        return Ok(false);
    }
    let key = issuer.public_key()?;
    Ok(subject.verify(&key)?)
}
