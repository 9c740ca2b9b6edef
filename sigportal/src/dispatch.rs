// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The protocol engine.
//!
//! An exchange with the portal is a loop of fetching work, doing it, and posting the result:
//!
//! ```text
//! FETCH -> (PROCESS -> SUBMIT)* -> DONE | FAILED
//! ```
//!
//! The portal may ask the agent to wait (202 Accepted) when fetching or submitting, redirect it
//! to a new work URL after a submission (303 or 307), or close the exchange (204 No Content, or
//! 200 OK with no body). Waiting is done in fixed steps on the [`Clock`] and is bounded by
//! [`IDLE_LIMIT`].
//!
//! [`Dispatcher`] runs a single exchange. [`Agent`] waits for magic links, runs one exchange
//! per link, and tells the user how it went.

use std::time::Duration;

use bytes::Bytes;
use http::{
    HeaderName, HeaderValue, Request, Response, StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION},
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use url::Url;

use crate::{
    auth::BearerTokenProvider,
    clock::Clock,
    error::{Category, DispatchError, TransportError},
    http::HttpTransport,
    platform::Platform,
    protocol::{ErrorCode, Execution, Operation, WorkRequest},
    queue::{MagicLinkMessage, MessageQueue},
};

/// How long to wait each time the portal responds with 202 Accepted.
pub const IDLE_STEP: Duration = Duration::from_secs(1);

/// How long the portal may keep the agent waiting, in total, before the exchange fails.
pub const IDLE_LIMIT: Duration = Duration::from_secs(5 * 60);

/// The hardware support dataset is requested at most this often.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How often the agent checks for new magic links.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Added to a fetch to ask the portal to include the hardware support dataset.
pub static HARDWARE_SYNC: HeaderName = HeaderName::from_static("x-hardware-sync");

/// How long the final notification of an exchange stays up.
const NOTIFICATION_DELAY: Duration = Duration::from_secs(5);

/// How an exchange ended without failing.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The portal closed the exchange. This is the last result posted to it, if any.
    Completed(Option<Execution<Value>>),
    /// The portal sent work from a session that didn't pass authentication; the work was
    /// refused and the exchange abandoned.
    SessionRejected,
}

impl Outcome {
    pub fn category(&self) -> Category {
        match self {
            Outcome::Completed(Some(execution)) if !execution.success => {
                if execution.error_code == Some(ErrorCode::UserCancelled) {
                    Category::Cancelled
                } else {
                    Category::Fatal
                }
            }
            Outcome::Completed(_) => Category::Success,
            Outcome::SessionRejected => Category::Fatal,
        }
    }
}

/// What the portal wants after a submission.
enum Next {
    Work(WorkRequest),
    Fetch(Url),
    Done,
}

/// Runs one exchange with the portal.
pub struct Dispatcher<'a, T, C, P> {
    tokens: BearerTokenProvider<T, C>,
    platform: &'a P,
    idle: Duration,
}

impl<'a, T: HttpTransport, C: Clock, P: Platform> Dispatcher<'a, T, C, P> {
    pub fn new(tokens: BearerTokenProvider<T, C>, platform: &'a P) -> Self {
        Self {
            tokens,
            platform,
            idle: Duration::ZERO,
        }
    }

    /// How long the portal has kept the dispatcher waiting since its last real response.
    pub fn idle(&self) -> Duration {
        self.idle
    }

    /// Run the exchange to completion.
    ///
    /// # Errors
    ///
    /// Any unexpected response from the portal, transport failure, or token problem ends the
    /// exchange. Refusals by the [`Platform`] do not; they're posted to the portal like any
    /// other result.
    #[instrument(skip_all, err)]
    pub async fn run(mut self) -> Result<Outcome, DispatchError> {
        let mut url = self.tokens.redirect_uri().await?;
        let mut last = None;

        'fetch: loop {
            let Some(mut request) = self.fetch(&url).await? else {
                tracing::info!("The portal has no more work");
                return Ok(Outcome::Completed(last));
            };

            loop {
                let Some(execution) = self.process(&url, request).await? else {
                    return Ok(Outcome::SessionRejected);
                };
                let next = self.submit(&url, &execution).await?;
                last = Some(execution);
                match next {
                    Next::Work(work) => request = work,
                    Next::Fetch(next_url) => {
                        url = next_url;
                        continue 'fetch;
                    }
                    Next::Done => {
                        tracing::info!("The portal closed the exchange");
                        return Ok(Outcome::Completed(last));
                    }
                }
            }
        }
    }

    /// Poll `url` until there's work, or the portal says there's none.
    async fn fetch(&mut self, url: &Url) -> Result<Option<WorkRequest>, DispatchError> {
        loop {
            let authorization = self.tokens.endpoint_authentication().await?;
            let mut builder = Request::get(url.as_str())
                .header(AUTHORIZATION, authorization)
                .header(ACCEPT, "application/json");
            if self.wants_hardware() {
                builder = builder.header(HARDWARE_SYNC.clone(), HeaderValue::from_static("request"));
            }
            let request = builder.body(Bytes::new()).map_err(TransportError::from)?;
            let response = self.send(request).await?;

            match response.status() {
                StatusCode::ACCEPTED => self.wait().await?,
                StatusCode::OK => return parse_work(response.body()),
                status => return Err(communication(status)),
            }
        }
    }

    /// Do the work in `request`.
    ///
    /// Returns [`None`] if the request was refused for not belonging to this exchange.
    async fn process(
        &mut self,
        url: &Url,
        request: WorkRequest,
    ) -> Result<Option<Execution<Value>>, DispatchError> {
        tracing::info!(operation = ?request.operation, step_id = ?request.step_id, "Received work");
        let check = self.platform.check_session(&request.session);
        if !check.success {
            tracing::warn!("Refusing work from an invalid session");
            let response = self.post(url, &check.into_json()?).await?;
            tracing::debug!(status = %response.status(), "Posted session refusal");
            return Ok(None);
        }

        self.platform
            .push_notification(&request.description, false, Duration::ZERO);

        if let Some(dataset) = &request.supported_hardware
            && self.wants_hardware()
        {
            self.platform
                .store_supported_hardware(dataset, self.tokens.clock().now());
        }

        let execution = match request.operation {
            Operation::GetCertificate => self.platform.get_certificate(&request).await.into_json()?,
            Operation::Sign => self
                .platform
                .sign(&request)
                .await
                .with_step_id(request.step_id.clone())
                .into_json()?,
            operation => return Err(DispatchError::UnsupportedOperation(operation)),
        };
        tracing::info!(success = execution.success, error_code = ?execution.error_code, "Completed work");
        Ok(Some(execution))
    }

    /// Post `execution` to `url` and work out what the portal wants next.
    async fn submit(
        &mut self,
        url: &Url,
        execution: &Execution<Value>,
    ) -> Result<Next, DispatchError> {
        let response = self.post(url, execution).await?;
        match response.status() {
            StatusCode::OK => Ok(parse_work(response.body())?.map_or(Next::Done, Next::Work)),
            StatusCode::NO_CONTENT => Ok(Next::Done),
            StatusCode::SEE_OTHER | StatusCode::TEMPORARY_REDIRECT => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|location| location.to_str().ok())
                    .and_then(|location| url.join(location).ok())
                    .ok_or(DispatchError::InvalidRedirect)?;
                tracing::info!(url = %location, "Redirected to new work URL");
                Ok(Next::Fetch(location))
            }
            StatusCode::ACCEPTED => {
                self.wait().await?;
                Ok(Next::Fetch(url.clone()))
            }
            status => Err(communication(status)),
        }
    }

    async fn post(
        &mut self,
        url: &Url,
        execution: &Execution<Value>,
    ) -> Result<Response<Bytes>, DispatchError> {
        let body = serde_json::to_vec(execution)?;
        let authorization = self.tokens.endpoint_authentication().await?;
        let request = Request::post(url.as_str())
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from(body))
            .map_err(TransportError::from)?;
        self.send(request).await
    }

    async fn send(&mut self, request: Request<Bytes>) -> Result<Response<Bytes>, DispatchError> {
        let method = request.method().clone();
        let response = self.tokens.transport().send(request).await?;
        tracing::debug!(%method, status = %response.status(), "Portal responded");
        if response.status() != StatusCode::ACCEPTED {
            self.idle = Duration::ZERO;
        }
        Ok(response)
    }

    async fn wait(&mut self) -> Result<(), DispatchError> {
        self.idle += IDLE_STEP;
        if self.idle > IDLE_LIMIT {
            return Err(DispatchError::IdleTimeout(IDLE_LIMIT));
        }
        tracing::trace!(idle = ?self.idle, "Portal asked the agent to wait");
        self.tokens.clock().sleep(IDLE_STEP).await;
        Ok(())
    }

    /// Whether the hardware support dataset is due for an update.
    fn wants_hardware(&self) -> bool {
        let now = self.tokens.clock().now();
        self.platform.last_hardware_sync().is_none_or(|last_sync| {
            now.duration_since(last_sync)
                .is_ok_and(|elapsed| elapsed > SYNC_INTERVAL)
        })
    }
}

/// A blank body or a JSON `null` means there's no more work.
fn parse_work(body: &Bytes) -> Result<Option<WorkRequest>, DispatchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(serde_json::from_slice::<Option<WorkRequest>>(body)?)
}

fn communication(status: StatusCode) -> DispatchError {
    DispatchError::Communication {
        status,
        reason: status.canonical_reason().unwrap_or_default().to_string(),
    }
}

fn notification(category: Category) -> &'static str {
    match category {
        Category::Success => "The signing request was completed.",
        Category::Cancelled => "The signing request was cancelled.",
        Category::Expired => "The signing request expired. Please start again from the portal.",
        Category::Fatal => "The signing request failed. See the agent's logs for details.",
    }
}

/// Waits for magic links and runs an exchange for each.
pub struct Agent<T, C, P> {
    transport: T,
    clock: C,
    platform: P,
    client_id: String,
}

impl<T, C, P> Agent<T, C, P>
where
    T: HttpTransport + Clone,
    C: Clock + Clone,
    P: Platform,
{
    pub fn new(transport: T, clock: C, platform: P, client_id: impl Into<String>) -> Self {
        Self {
            transport,
            clock,
            platform,
            client_id: client_id.into(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Handle messages from `queue` until `halt` is cancelled.
    ///
    /// Cancellation is noticed between exchanges; an exchange in progress runs to the end.
    pub async fn run(&self, queue: &mut MessageQueue, halt: CancellationToken) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = halt.cancelled() => {
                    tracing::info!("Shutting down the agent");
                    break;
                }
                _ = interval.tick() => {}
            }
            if let Some(payload) = queue.try_recv() {
                self.handle(&payload).await;
            }
        }
    }

    /// Run the exchange `payload` asks for.
    ///
    /// Returns how the exchange ended, or [`None`] if the message was discarded.
    pub async fn handle(&self, payload: &str) -> Option<Category> {
        let message = match payload.parse::<MagicLinkMessage>() {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "Discarding unreadable message");
                return None;
            }
        };
        if message.is_expired(self.clock.now()) {
            tracing::info!(expires_at = ?message.expires_at, "Discarding expired message");
            return None;
        }

        let span = tracing::info_span!("exchange", exchange_id = %uuid::Uuid::now_v7());
        Some(self.exchange(message).instrument(span).await)
    }

    async fn exchange(&self, message: MagicLinkMessage) -> Category {
        tracing::info!(locale = ?message.locale, "Starting exchange");
        self.platform.begin_exchange(message.locale.as_deref());
        let category = match self.dispatch(message.magic_link).await {
            Ok(outcome) => outcome.category(),
            Err(error) => {
                tracing::error!(%error, "Exchange failed");
                self.platform.handle_failure(&error).await;
                error.category()
            }
        };
        if category != Category::Success {
            self.platform.teardown();
        }
        self.platform.end_exchange();

        tracing::info!(?category, "Exchange finished");
        self.platform
            .push_notification(notification(category), true, NOTIFICATION_DELAY);
        category
    }

    async fn dispatch(&self, magic_link: Url) -> Result<Outcome, DispatchError> {
        let tokens = BearerTokenProvider::new(
            self.transport.clone(),
            self.clock.clone(),
            self.client_id.clone(),
            magic_link,
        )?;
        Dispatcher::new(tokens, &self.platform).run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_categories() {
        assert_eq!(Outcome::Completed(None).category(), Category::Success);
        assert_eq!(
            Outcome::Completed(Some(Execution::success(Value::Bool(true)))).category(),
            Category::Success
        );
        assert_eq!(
            Outcome::Completed(Some(Execution::failure(
                ErrorCode::UserCancelled,
                "the user cancelled the operation"
            )))
            .category(),
            Category::Cancelled
        );
        assert_eq!(
            Outcome::Completed(Some(Execution::failure(ErrorCode::NoKeyFound, "no key")))
                .category(),
            Category::Fatal
        );
        assert_eq!(Outcome::SessionRejected.category(), Category::Fatal);
    }

    #[test]
    fn blank_bodies_end_the_exchange() -> anyhow::Result<()> {
        assert!(parse_work(&Bytes::new())?.is_none());
        assert!(parse_work(&Bytes::from_static(b" \n"))?.is_none());
        assert!(parse_work(&Bytes::from_static(b"null"))?.is_none());
        assert!(parse_work(&Bytes::from_static(b" null\n"))?.is_none());
        assert!(matches!(
            parse_work(&Bytes::from_static(b"{\"operation\":")),
            Err(DispatchError::InvalidBody(_))
        ));
        Ok(())
    }

    #[test]
    fn unexpected_status_carries_reason() {
        let error = communication(StatusCode::BAD_GATEWAY);
        assert_eq!(
            error.to_string(),
            "the server responded with 502 Bad Gateway"
        );
    }
}
