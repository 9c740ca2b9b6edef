// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A short-lived cache for the most recently opened token session and its secret.
//!
//! Opening a token usually requires the user to type a PIN. To avoid prompting for every
//! signature in a batch, the [`CredentialCache`] holds on to one open token session for
//! [`TOKEN_TTL`] and one secret for a configurable time. Each slot has its own timer task;
//! when it fires, the slot is torn down exactly as if [`CredentialCache::destroy`] had been
//! called.

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

/// How long an opened token session stays cached.
pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Something holding device state that must be released explicitly.
pub trait Closable: Send + Sync + 'static {
    /// Release the underlying resources.
    ///
    /// Implementations must tolerate being called more than once.
    fn close(&self);
}

struct TokenSlot<S> {
    product: String,
    session: Arc<S>,
    generation: u64,
    timer: CancellationToken,
}

struct SecretSlot {
    product: String,
    secret: SecretString,
    generation: u64,
    timer: CancellationToken,
}

struct Slots<S> {
    token: Option<TokenSlot<S>>,
    secret: Option<SecretSlot>,
    generation: u64,
}

impl<S> Slots<S> {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// Holds at most one open token session and at most one secret.
///
/// All methods are safe to call concurrently with each other and with the expiry timers.
/// Timers are Tokio tasks, so [`CredentialCache::set_token`] and
/// [`CredentialCache::set_secret`] must be called from within a Tokio runtime.
pub struct CredentialCache<S: Closable> {
    slots: Arc<Mutex<Slots<S>>>,
}

impl<S: Closable> Clone for CredentialCache<S> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<S: Closable> Default for CredentialCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Closable> std::fmt::Debug for CredentialCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().expect("lock is poisoned");
        f.debug_struct("CredentialCache")
            .field(
                "product",
                &slots.token.as_ref().map(|slot| slot.product.as_str()),
            )
            .field(
                "secret_product",
                &slots.secret.as_ref().map(|slot| slot.product.as_str()),
            )
            .finish()
    }
}

impl<S: Closable> CredentialCache<S> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                token: None,
                secret: None,
                generation: 0,
            })),
        }
    }

    /// Get the cached session if it belongs to `product`.
    ///
    /// A session belonging to any other product is destroyed.
    pub fn get_initialized_token_for_product(&self, product: &str) -> Option<Arc<S>> {
        let stale = {
            let mut slots = self.slots.lock().expect("lock is poisoned");
            match &slots.token {
                Some(slot) if slot.product == product => return Some(slot.session.clone()),
                Some(_) => slots.token.take(),
                None => None,
            }
        };
        if let Some(slot) = stale {
            tracing::debug!(
                cached = slot.product,
                requested = product,
                "Destroying cached session for a different product"
            );
            close_token(slot);
        }
        None
    }

    /// Cache `session` as the open session for `product`, replacing any previous one.
    ///
    /// # Panics
    ///
    /// This panics if called outside a Tokio runtime.
    pub fn set_token(&self, product: &str, session: S) -> Arc<S> {
        let session = Arc::new(session);
        let timer = CancellationToken::new();
        let (previous, generation) = {
            let mut slots = self.slots.lock().expect("lock is poisoned");
            let generation = slots.next_generation();
            let previous = slots.token.replace(TokenSlot {
                product: product.to_string(),
                session: session.clone(),
                generation,
                timer: timer.clone(),
            });
            (previous, generation)
        };
        if let Some(previous) = previous {
            close_token(previous);
        }

        let slots = Arc::downgrade(&self.slots);
        spawn_expiry(timer, TOKEN_TTL, move || {
            if let Some(slot) = take_token(&slots, generation) {
                tracing::info!(product = slot.product, "Cached token session expired");
                close_token(slot);
            }
        });
        tracing::debug!(product, ttl = ?TOKEN_TTL, "Cached token session");

        session
    }

    /// Cache `secret` as the secret for `product` for `ttl`, replacing any previous secret.
    ///
    /// # Panics
    ///
    /// This panics if called outside a Tokio runtime.
    pub fn set_secret(&self, product: &str, secret: SecretString, ttl: Duration) {
        let timer = CancellationToken::new();
        let (previous, generation) = {
            let mut slots = self.slots.lock().expect("lock is poisoned");
            let generation = slots.next_generation();
            let previous = slots.secret.replace(SecretSlot {
                product: product.to_string(),
                secret,
                generation,
                timer: timer.clone(),
            });
            (previous, generation)
        };
        if let Some(previous) = previous {
            previous.timer.cancel();
        }

        let slots = Arc::downgrade(&self.slots);
        spawn_expiry(timer, ttl, move || {
            if take_secret(&slots, generation).is_some() {
                tracing::info!("Cached secret expired");
            }
        });
    }

    /// A copy of the cached secret if it belongs to `product`.
    ///
    /// A secret belonging to any other product is forgotten.
    pub fn get_secret_for_product(&self, product: &str) -> Option<SecretString> {
        let stale = {
            let mut slots = self.slots.lock().expect("lock is poisoned");
            match &slots.secret {
                Some(slot) if slot.product == product => {
                    return Some(SecretString::from(slot.secret.expose_secret().to_owned()));
                }
                Some(_) => slots.secret.take(),
                None => None,
            }
        };
        if let Some(slot) = stale {
            tracing::debug!(
                cached = slot.product,
                requested = product,
                "Forgetting cached secret for a different product"
            );
            slot.timer.cancel();
        }
        None
    }

    /// Forget the cached secret.
    pub fn destroy_secret(&self) {
        let slot = self.slots.lock().expect("lock is poisoned").secret.take();
        if let Some(slot) = slot {
            slot.timer.cancel();
        }
    }

    /// Close the cached session and forget the secret, each only if it belongs to `product`.
    pub fn destroy_product(&self, product: &str) {
        let (token, secret) = {
            let mut slots = self.slots.lock().expect("lock is poisoned");
            let token = match &slots.token {
                Some(slot) if slot.product == product => slots.token.take(),
                _ => None,
            };
            let secret = match &slots.secret {
                Some(slot) if slot.product == product => slots.secret.take(),
                _ => None,
            };
            (token, secret)
        };
        if let Some(token) = token {
            close_token(token);
        }
        if let Some(secret) = secret {
            secret.timer.cancel();
        }
    }

    /// Close the cached session and forget the secret.
    ///
    /// This is safe to call any number of times, including after the timers have fired.
    pub fn destroy(&self) {
        let (token, secret) = {
            let mut slots = self.slots.lock().expect("lock is poisoned");
            (slots.token.take(), slots.secret.take())
        };
        if let Some(token) = token {
            close_token(token);
        }
        if let Some(secret) = secret {
            secret.timer.cancel();
        }
    }

    /// Whether a session is currently cached.
    pub fn has_token(&self) -> bool {
        self.slots.lock().expect("lock is poisoned").token.is_some()
    }
}

fn spawn_expiry<F>(timer: CancellationToken, ttl: Duration, on_expiry: F)
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(ttl) => on_expiry(),
        }
    });
}

fn take_token<S: Closable>(slots: &Weak<Mutex<Slots<S>>>, generation: u64) -> Option<TokenSlot<S>> {
    let slots = slots.upgrade()?;
    let mut slots = slots.lock().expect("lock is poisoned");
    match &slots.token {
        Some(slot) if slot.generation == generation => slots.token.take(),
        _ => None,
    }
}

fn take_secret<S: Closable>(slots: &Weak<Mutex<Slots<S>>>, generation: u64) -> Option<SecretSlot> {
    let slots = slots.upgrade()?;
    let mut slots = slots.lock().expect("lock is poisoned");
    match &slots.secret {
        Some(slot) if slot.generation == generation => slots.secret.take(),
        _ => None,
    }
}

fn close_token<S: Closable>(slot: TokenSlot<S>) {
    slot.timer.cancel();
    slot.session.close();
}
