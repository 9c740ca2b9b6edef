// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# sigportal

sigportal is a local signing agent. It runs in the background on a user's machine and services
remote signing portals using the signing credentials available locally: smart cards and other
PKCS #11 tokens, as well as PKCS #12 software keystores.

A signing workflow starts in the user's browser. The portal hands the user a one-time "magic
link", which a launcher passes to the agent over a local Unix socket. The agent redeems the
link for a pair of bearer tokens and then long-polls the portal for work: selecting a
certificate, or producing a signature with a previously selected key. Each result is posted back
to the portal, which may respond with more work, redirect the agent, ask it to wait, or close the
exchange.

## Components

The [`dispatch`] module contains the polling state machine that drives an exchange. It relies on
the [`auth`] module for bearer tokens and on a [`platform::Platform`] to perform the actual work.

The [`platform::LocalPlatform`] does that work with the help of:

* the [`session::SessionAuthenticator`], which checks every piece of work was issued by a
  trusted portal for the exchange in progress,
* the [`cache::CredentialCache`], which keeps the most recently opened token and its PIN around
  for a limited time so users aren't prompted for every signature,
* the [`filter`] module, which narrows the keys on a token down to those the portal asked for.

All HTTPS traffic goes through the [`trust::TrustStore`], which is able to learn new certificate
chains after the user has reviewed them.

## Crate features

* **cli** -
  Include the `sigportal-agent` CLI. This is a default feature.
*/

pub mod auth;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod http;
pub mod platform;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod store;
pub mod trust;

#[cfg(test)]
pub(crate) mod test_utils;
