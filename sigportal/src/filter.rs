// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Narrow the keys on a token down to those the portal is willing to accept.

use std::time::{SystemTime, UNIX_EPOCH};

use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    x509::{X509, X509Ref},
};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::protocol::CertificateFilter;

/// Remove every entry whose certificate fails one of the constraints enabled in `filter`.
///
/// The constraints are independent of each other. Without a filter, nothing is removed.
/// Entries whose certificates can't be checked are removed.
pub fn filter_entries<E: AsRef<X509Ref>>(
    entries: Vec<E>,
    filter: Option<&CertificateFilter>,
    now: SystemTime,
) -> Vec<E> {
    let Some(filter) = filter else {
        return entries;
    };

    let issuer = match filter.issuer_certificate.as_deref().map(X509::from_der) {
        Some(Ok(issuer)) => Some(issuer),
        Some(Err(error)) => {
            tracing::error!(?error, "The issuer certificate in the filter is not valid DER");
            return vec![];
        }
        None => None,
    };
    let fingerprint = filter
        .certificate_sha256
        .as_deref()
        .map(|fingerprint| fingerprint.replace(':', "").to_ascii_lowercase());
    let now = now
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|since| i64::try_from(since.as_secs()).ok())
        .and_then(|seconds| Asn1Time::from_unix(seconds).ok());

    let before = entries.len();
    let entries: Vec<E> = entries
        .into_iter()
        .filter(|entry| {
            let certificate = entry.as_ref();
            (filter.allow_expired || not_expired(certificate, now.as_ref()))
                && issuer
                    .as_ref()
                    .is_none_or(|issuer| issued_by(certificate, issuer))
                && fingerprint
                    .as_deref()
                    .is_none_or(|fingerprint| fingerprint_matches(certificate, fingerprint))
                && key_usage_allows(
                    certificate,
                    filter.non_repudiation_bit,
                    filter.digital_signature_bit,
                )
        })
        .collect();
    tracing::debug!(before, after = entries.len(), "Filtered key entries");
    entries
}

fn not_expired(certificate: &X509Ref, now: Option<&Asn1Time>) -> bool {
    let Some(now) = now else {
        return false;
    };
    match certificate.not_after().compare(now) {
        Ok(ordering) => ordering.is_ge(),
        Err(error) => {
            tracing::warn!(?error, "Unable to compare certificate expiry");
            false
        }
    }
}

fn issued_by(certificate: &X509Ref, issuer: &X509) -> bool {
    let verified = issuer
        .public_key()
        .and_then(|key| certificate.verify(&key));
    match verified {
        Ok(verified) => verified,
        Err(error) => {
            tracing::error!(?error, "Unexpected error checking the certificate's issuer");
            false
        }
    }
}

fn fingerprint_matches(certificate: &X509Ref, expected: &str) -> bool {
    certificate
        .digest(MessageDigest::sha256())
        .map(|digest| hex::encode(&*digest) == expected)
        .unwrap_or(false)
}

fn key_usage_allows(certificate: &X509Ref, non_repudiation: bool, digital_signature: bool) -> bool {
    if !non_repudiation && !digital_signature {
        return true;
    }
    let Ok(der) = certificate.to_der() else {
        return false;
    };
    let Ok((_, parsed)) = X509Certificate::from_der(&der) else {
        tracing::warn!("Unable to parse certificate to check its key usage");
        return false;
    };
    match parsed.key_usage() {
        Ok(Some(usage)) => {
            (!non_repudiation || usage.value.non_repudiation())
                && (!digital_signature || usage.value.digital_signature())
        }
        Ok(None) => false,
        Err(error) => {
            tracing::warn!(?error, "Certificate has an invalid key usage extension");
            false
        }
    }
}
