// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Bearer tokens for talking to the portal.
//!
//! Each exchange starts with a magic link. Fetching the link redirects to a URL carrying an
//! authorization code; that URL, without the code, is where the agent polls for work. The code
//! is exchanged for an access token and a refresh token at the authorization server, whose
//! address is the part of the magic link in front of [`AUTH_PATH_MARKER`].
//!
//! Tokens are refreshed lazily when a request needs one. There's no background timer.

use std::time::{Duration, SystemTime};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::{HeaderValue, Method, Request, header};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use crate::{
    clock::Clock,
    error::{AuthError, TransportError},
    http::HttpTransport,
};

/// The path segment in a magic link where the authorization server's base address ends.
pub const AUTH_PATH_MARKER: &str = "/protocol/openid-connect";

/// The token endpoint, relative to the authorization server's base address.
pub const TOKEN_PATH: &str = "/protocol/openid-connect/token";

/// The fraction of a token's lifetime after which it is treated as expired.
const REFRESH_AT: f64 = 0.9;

/// The token endpoint's response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// The `iat` and `exp` claims of a JWT.
#[derive(Debug, Deserialize)]
struct Claims {
    iat: u64,
    exp: u64,
}

/// The window in which a token is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lifetime {
    issued_at: SystemTime,
    expires_at: SystemTime,
}

impl Lifetime {
    /// Read the lifetime from the token itself, if it's a JWT, or else count `expires_in`
    /// from `issued_locally`.
    fn of(token: &str, expires_in: u64, issued_locally: SystemTime) -> Self {
        match jwt_claims(token) {
            Some(claims) if claims.exp > claims.iat => Self {
                issued_at: SystemTime::UNIX_EPOCH + Duration::from_secs(claims.iat),
                expires_at: SystemTime::UNIX_EPOCH + Duration::from_secs(claims.exp),
            },
            _ => Self {
                issued_at: issued_locally,
                expires_at: issued_locally + Duration::from_secs(expires_in),
            },
        }
    }

    /// Whether `now` is within the last tenth of the lifetime, or past it.
    fn is_expired(&self, now: SystemTime) -> bool {
        let lifetime = self
            .expires_at
            .duration_since(self.issued_at)
            .unwrap_or(Duration::ZERO);
        now >= self.issued_at + lifetime.mul_f64(REFRESH_AT)
    }
}

fn jwt_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// A token pair issued by the authorization server.
pub struct AccessToken {
    access_token: SecretString,
    access_lifetime: Lifetime,
    refresh_token: Option<SecretString>,
    /// [`None`] if the refresh token never expires.
    refresh_lifetime: Option<Lifetime>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_lifetime", &self.access_lifetime)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("refresh_lifetime", &self.refresh_lifetime)
            .finish()
    }
}

impl AccessToken {
    fn from_response(response: TokenResponse, now: SystemTime) -> Self {
        let access_lifetime = Lifetime::of(&response.access_token, response.expires_in, now);
        let refresh_lifetime = match (&response.refresh_token, response.refresh_expires_in) {
            (_, 0) | (None, _) => None,
            (Some(token), expires_in) => Some(Lifetime::of(token, expires_in, now)),
        };
        Self {
            access_token: SecretString::from(response.access_token),
            access_lifetime,
            refresh_token: response.refresh_token.map(SecretString::from),
            refresh_lifetime,
        }
    }

    fn access_expired(&self, now: SystemTime) -> bool {
        self.access_lifetime.is_expired(now)
    }

    fn refresh_token(&self, now: SystemTime) -> Option<&SecretString> {
        let expired = self
            .refresh_lifetime
            .is_some_and(|lifetime| lifetime.is_expired(now));
        self.refresh_token.as_ref().filter(|_| !expired)
    }
}

/// The result of following the magic link.
struct Redemption {
    code: SecretString,
    session_state: String,
    redirect_uri: Url,
}

/// Issues bearer tokens for a single exchange.
///
/// A provider redeems its magic link at most once. Create a new provider for each exchange.
pub struct BearerTokenProvider<T, C> {
    transport: T,
    clock: C,
    client_id: String,
    magic_link: Url,
    token_endpoint: String,
    redemption: Option<Redemption>,
    token: Option<AccessToken>,
}

impl<T: HttpTransport, C: Clock> BearerTokenProvider<T, C> {
    /// Create a provider for `magic_link`.
    ///
    /// # Errors
    ///
    /// The magic link must contain [`AUTH_PATH_MARKER`]; otherwise the authorization server
    /// can't be located and [`AuthError::MalformedMagicLink`] is returned.
    pub fn new(
        transport: T,
        clock: C,
        client_id: impl Into<String>,
        magic_link: Url,
    ) -> Result<Self, AuthError> {
        let base = magic_link
            .as_str()
            .find(AUTH_PATH_MARKER)
            .map(|position| &magic_link.as_str()[..position])
            .ok_or_else(|| {
                AuthError::MalformedMagicLink(format!(
                    "'{AUTH_PATH_MARKER}' is not part of the link"
                ))
            })?;
        let token_endpoint = format!("{base}{TOKEN_PATH}");

        Ok(Self {
            transport,
            clock,
            client_id: client_id.into(),
            magic_link,
            token_endpoint,
            redemption: None,
            token: None,
        })
    }

    /// The clock this provider checks expiry against.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The transport this provider issues requests with.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The URL to poll for work.
    ///
    /// The first call follows the magic link; later calls return the same URL.
    #[instrument(skip_all, err)]
    pub async fn redirect_uri(&mut self) -> Result<Url, AuthError> {
        Ok(self.redeem().await?.redirect_uri.clone())
    }

    async fn redeem(&mut self) -> Result<&Redemption, AuthError> {
        if self.redemption.is_none() {
            let request = Request::get(self.magic_link.as_str())
                .body(Bytes::new())
                .map_err(|error| AuthError::MalformedMagicLink(error.to_string()))?;
            let response = self.transport.send(request).await?;

            if !response.status().is_redirection() {
                return Err(AuthError::MalformedMagicLink(format!(
                    "expected a redirect, got {}",
                    response.status()
                )));
            }
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|location| location.to_str().ok())
                .ok_or_else(|| {
                    AuthError::MalformedMagicLink("the redirect has no Location".into())
                })?;
            let location = self
                .magic_link
                .join(location)
                .map_err(|error| AuthError::MalformedMagicLink(error.to_string()))?;
            let redemption = parse_redirect(location)?;
            tracing::info!(
                redirect_uri = %redemption.redirect_uri,
                "Redeemed magic link"
            );
            self.redemption = Some(redemption);
        }

        self.redemption
            .as_ref()
            .ok_or_else(|| AuthError::MalformedMagicLink("the link was not redeemed".into()))
    }

    /// The `Authorization` header value for the next request to the portal.
    ///
    /// A token is issued on first use, reused while it's fresh, and refreshed once it enters
    /// the last tenth of its lifetime.
    ///
    /// # Errors
    ///
    /// [`AuthError::Expired`] is returned if the access token needs refreshing but the
    /// refresh token has expired as well.
    #[instrument(skip_all, err)]
    pub async fn endpoint_authentication(&mut self) -> Result<HeaderValue, AuthError> {
        if self.token.is_none() {
            let form = self.authorization_code_form().await?;
            self.token = Some(self.request_token(form).await?);
        }

        let now = self.clock.now();
        let session_state = self
            .redemption
            .as_ref()
            .map(|redemption| redemption.session_state.as_str())
            .unwrap_or_default();
        let refresh_form = match &self.token {
            Some(token) if token.access_expired(now) => match token.refresh_token(now) {
                Some(refresh_token) => {
                    tracing::debug!("Access token is about to expire; refreshing");
                    Some(
                        url::form_urlencoded::Serializer::new(String::new())
                            .append_pair("grant_type", "refresh_token")
                            .append_pair("refresh_token", refresh_token.expose_secret())
                            .append_pair("session_state", session_state)
                            .append_pair("client_id", &self.client_id)
                            .finish(),
                    )
                }
                None => return Err(AuthError::Expired),
            },
            _ => None,
        };
        if let Some(form) = refresh_form {
            self.token = Some(self.request_token(form).await?);
        }

        let token = self.token.as_ref().ok_or(AuthError::Expired)?;
        let mut value =
            HeaderValue::from_str(&format!("Bearer {}", token.access_token.expose_secret()))
                .map_err(|_| AuthError::UnusableToken)?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn authorization_code_form(&mut self) -> Result<String, AuthError> {
        let client_id = self.client_id.clone();
        let redemption = self.redeem().await?;
        Ok(url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "authorization_code")
            .append_pair("code", redemption.code.expose_secret())
            .append_pair("session_state", &redemption.session_state)
            .append_pair("redirect_uri", redemption.redirect_uri.as_str())
            .append_pair("client_id", &client_id)
            .finish())
    }

    async fn request_token(&self, form: String) -> Result<AccessToken, AuthError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.token_endpoint)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "application/json")
            .body(Bytes::from(form))
            .map_err(TransportError::Request)?;
        let response = self.transport.send(request).await?;
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Token endpoint refused the request");
            return Err(AuthError::TokenEndpoint {
                status: response.status(),
            });
        }

        let token: TokenResponse = serde_json::from_slice(response.body())?;
        let token = AccessToken::from_response(token, self.clock.now());
        tracing::debug!(?token, "Issued bearer token");
        Ok(token)
    }
}

/// Split the authorization response into its code, session state, and the remaining URL.
fn parse_redirect(mut location: Url) -> Result<Redemption, AuthError> {
    let mut code = None;
    let mut session_state = None;
    let mut remaining = vec![];
    for (name, value) in location.query_pairs() {
        match name.as_ref() {
            "code" => code = Some(value.into_owned()),
            "session_state" => session_state = Some(value.into_owned()),
            _ => remaining.push((name.into_owned(), value.into_owned())),
        }
    }
    let (Some(code), Some(session_state)) = (code, session_state) else {
        return Err(AuthError::MalformedMagicLink(
            "the redirect lacks a code or session state".into(),
        ));
    };

    if remaining.is_empty() {
        location.set_query(None);
    } else {
        location.query_pairs_mut().clear().extend_pairs(remaining);
    }

    Ok(Redemption {
        code: SecretString::from(code),
        session_state,
        redirect_uri: location,
    })
}
