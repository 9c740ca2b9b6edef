// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Certificates minted on the fly for unit tests.

use anyhow::Result;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        self, X509,
        extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier},
    },
};

/// A certificate along with its private key.
pub(crate) struct Minted {
    pub certificate: X509,
    pub key: PKey<Private>,
}

/// Key usage and validity of a minted end-entity certificate.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LeafUsage {
    pub non_repudiation: bool,
    pub digital_signature: bool,
    pub expired: bool,
}

pub(crate) fn rsa_key() -> Result<PKey<Private>> {
    Ok(PKey::from_rsa(Rsa::generate(2048)?)?)
}

/// A self-signed certificate authority.
pub(crate) fn mint_ca(common_name: &str) -> Result<Minted> {
    mint(common_name, None, true, LeafUsage::default())
}

/// A certificate authority issued by `issuer`.
pub(crate) fn mint_intermediate(common_name: &str, issuer: &Minted) -> Result<Minted> {
    mint(common_name, Some(issuer), true, LeafUsage::default())
}

pub(crate) fn mint_leaf(common_name: &str, issuer: &Minted, usage: LeafUsage) -> Result<Minted> {
    mint(common_name, Some(issuer), false, usage)
}

fn mint(
    common_name: &str,
    issuer: Option<&Minted>,
    ca: bool,
    usage: LeafUsage,
) -> Result<Minted> {
    let key = rsa_key()?;
    let mut builder = x509::X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_pubkey(&key)?;

    let mut serial_number = [0; 20];
    openssl::rand::rand_bytes(&mut serial_number)?;
    let mut serial_number = BigNum::from_slice(&serial_number)?;
    serial_number.set_negative(false);
    builder.set_serial_number(Asn1Integer::from_bn(&serial_number)?.as_ref())?;

    let mut subject_name = x509::X509NameBuilder::new()?;
    subject_name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "sigportal tests")?;
    subject_name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let subject_name = subject_name.build();
    builder.set_subject_name(&subject_name)?;
    let issuer_name = issuer.map_or(subject_name.as_ref(), |ca| ca.certificate.subject_name());
    builder.set_issuer_name(issuer_name)?;

    if usage.expired {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs() as i64;
        builder.set_not_before(Asn1Time::from_unix(now - 30 * 86_400)?.as_ref())?;
        builder.set_not_after(Asn1Time::from_unix(now - 86_400)?.as_ref())?;
    } else {
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;
    }

    let mut basic_constraints = BasicConstraints::new();
    basic_constraints.critical();
    if ca {
        basic_constraints.ca();
    }
    builder.append_extension(basic_constraints.build()?)?;

    let mut key_usage = KeyUsage::new();
    key_usage.critical();
    if ca {
        key_usage.key_cert_sign().crl_sign();
    }
    if usage.non_repudiation {
        key_usage.non_repudiation();
    }
    if usage.digital_signature {
        key_usage.digital_signature();
    }
    if ca || usage.non_repudiation || usage.digital_signature {
        builder.append_extension(key_usage.build()?)?;
    }

    let subject_key_id =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;

    let signing_key = issuer.map_or(&key, |issuer| &issuer.key);
    builder.sign(signing_key, MessageDigest::sha512())?;

    Ok(Minted {
        certificate: builder.build(),
        key,
    })
}
