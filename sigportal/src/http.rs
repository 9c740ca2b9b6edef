// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! HTTP(S) transport used to talk to the portal and its authorization server.
//!
//! The transport never follows redirects; the protocol gives them meaning, so they are handed
//! back to the caller like any other response.

use std::{
    error::Error as StdError,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_openssl::client::legacy::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::{error::TransportError, trust::TrustStore};

/// Sends a single HTTP request and returns the complete response.
pub trait HttpTransport: Send + Sync {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> impl Future<Output = Result<Response<Bytes>, TransportError>> + Send;
}

impl<T: HttpTransport> HttpTransport for Arc<T> {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> impl Future<Output = Result<Response<Bytes>, TransportError>> + Send {
        self.as_ref().send(request)
    }
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// A [`HttpTransport`] backed by hyper, trusting what the [`TrustStore`] trusts.
#[derive(Debug)]
pub struct HyperTransport {
    trust: Arc<TrustStore>,
    timeout: Duration,
    client: Mutex<Option<(u64, HttpsClient)>>,
}

impl HyperTransport {
    /// Create a transport that gives up on requests after `timeout`.
    ///
    /// The timeout applies separately to receiving the response head and to reading its body.
    pub fn new(trust: Arc<TrustStore>, timeout: Duration) -> Self {
        Self {
            trust,
            timeout,
            client: Mutex::new(None),
        }
    }

    /// Get a client, rebuilding it if the trust store learned something since the last request.
    fn client(&self) -> Result<HttpsClient, TransportError> {
        let generation = self.trust.generation();
        let mut client = self.client.lock().expect("lock is poisoned");
        if let Some((built_for, client)) = client.as_ref()
            && *built_for == generation
        {
            return Ok(client.clone());
        }

        let connector = self.trust.https_connector().map_err(|error| match error {
            crate::error::TrustError::Ssl(error) => TransportError::Ssl(error),
            other => TransportError::Client(other.to_string()),
        })?;
        let built = Client::builder(TokioExecutor::new()).build(connector);
        *client = Some((generation, built.clone()));
        Ok(built)
    }
}

impl HttpTransport for HyperTransport {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let host = request.uri().host().unwrap_or_default().to_string();
        let client = self.client()?;
        tracing::debug!(method = %request.method(), uri = %request.uri(), "Sending request");

        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, Full::new(body));
        let response = tokio::time::timeout(self.timeout, client.request(request))
            .await
            .map_err(|_| TransportError::Timeout {
                host: host.clone(),
                timeout: self.timeout,
            })?
            .map_err(|error| {
                let presented_chain = self
                    .trust
                    .presented_chain(&host)
                    .map(|presented| presented.certificates)
                    .unwrap_or_default();
                classify(&host, &error, presented_chain)
            })?;

        let (parts, body) = response.into_parts();
        let body = tokio::time::timeout(self.timeout, body.collect())
            .await
            .map_err(|_| TransportError::Timeout {
                host: host.clone(),
                timeout: self.timeout,
            })?
            .map_err(|error| TransportError::Client(error.to_string()))?
            .to_bytes();
        tracing::debug!(status = %parts.status, len = body.len(), "Received response");

        Ok(Response::from_parts(parts, body))
    }
}

/// Turn a client error into a [`TransportError`] by looking at what caused it.
fn classify(
    host: &str,
    error: &(dyn StdError + 'static),
    presented_chain: Vec<openssl::x509::X509>,
) -> TransportError {
    let mut io_kind = None;
    let mut current = Some(error);
    while let Some(error) = current {
        let tls = error.downcast_ref::<openssl::ssl::Error>().is_some()
            || error.downcast_ref::<openssl::error::ErrorStack>().is_some();
        if tls {
            return TransportError::Tls {
                host: host.to_string(),
                reason: error.to_string(),
                presented_chain,
            };
        }
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            io_kind.get_or_insert(io.kind());
            // io::Error::source() skips the wrapped error itself.
            if let Some(inner) = io.get_ref() {
                let inner: &(dyn StdError + 'static) = inner;
                if inner.downcast_ref::<openssl::ssl::Error>().is_some()
                    || inner.downcast_ref::<openssl::error::ErrorStack>().is_some()
                {
                    return TransportError::Tls {
                        host: host.to_string(),
                        reason: inner.to_string(),
                        presented_chain,
                    };
                }
            }
        }
        current = error.source();
    }

    match io_kind {
        Some(kind) => TransportError::Io(std::io::Error::new(kind, error.to_string())),
        None => TransportError::Client(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use anyhow::Result;
    use openssl::{
        ssl::{SslAcceptor, SslMethod},
        x509::X509,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::test_utils::{LeafUsage, Minted, mint_ca, mint_intermediate, mint_leaf};

    #[derive(Debug)]
    struct Wrapped(Box<dyn StdError + Send + Sync>);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "client error")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(self.0.as_ref())
        }
    }

    #[test]
    fn tls_errors_are_found_in_the_chain() {
        let error = Wrapped(Box::new(openssl::error::ErrorStack::get()));
        let classified = classify("portal.example.com", &error, vec![]);
        assert!(matches!(classified, TransportError::Tls { host, .. } if host == "portal.example.com"));

        let error = Wrapped(Box::new(std::io::Error::other(
            openssl::error::ErrorStack::get(),
        )));
        let classified = classify("portal.example.com", &error, vec![]);
        assert!(matches!(classified, TransportError::Tls { .. }));
    }

    #[test]
    fn io_errors_are_kept() {
        let error = Wrapped(Box::new(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )));
        let classified = classify("portal.example.com", &error, vec![]);
        assert!(
            matches!(classified, TransportError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused)
        );

        let error = Wrapped(Box::new(fmt::Error));
        let classified = classify("portal.example.com", &error, vec![]);
        assert!(matches!(classified, TransportError::Client(_)));
    }

    fn transport(dir: &std::path::Path, timeout: Duration) -> Result<HyperTransport> {
        let trust = TrustStore::load(None, &[], dir)?;
        Ok(HyperTransport::new(Arc::new(trust), timeout))
    }

    #[tokio::test]
    async fn redirects_are_not_followed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut request = vec![0; 1024];
            let _ = stream.read(&mut request).await?;
            stream
                .write_all(
                    b"HTTP/1.1 303 See Other\r\nLocation: /elsewhere\r\nContent-Length: 2\r\n\r\nok",
                )
                .await?;
            Ok::<_, std::io::Error>(())
        });

        let transport = transport(dir.path(), Duration::from_secs(10))?;
        let request = Request::get(format!("http://{address}/work")).body(Bytes::new())?;
        let response = transport.send(request).await?;
        assert_eq!(response.status(), http::StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[http::header::LOCATION], "/elsewhere");
        assert_eq!(response.body().as_ref(), b"ok");
        Ok(())
    }

    #[tokio::test]
    async fn silent_servers_time_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
            Ok::<_, std::io::Error>(())
        });

        let transport = transport(dir.path(), Duration::from_millis(200))?;
        let request = Request::get(format!("http://{address}/work")).body(Bytes::new())?;
        let result = transport.send(request).await;
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        Ok(())
    }

    /// Serve one TLS handshake presenting `leaf` followed by `extra`.
    fn serve_tls(leaf: &Minted, extra: &[&X509]) -> Result<std::net::SocketAddr> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?;
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor.set_private_key(&leaf.key)?;
        acceptor.set_certificate(&leaf.certificate)?;
        for certificate in extra {
            acceptor.add_extra_chain_cert((*certificate).clone())?;
        }
        let acceptor = acceptor.build();
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = acceptor.accept(stream);
            }
        });
        Ok(address)
    }

    #[tokio::test]
    async fn tls_failures_carry_the_sent_chain() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = mint_ca("Unknown Root")?;
        let intermediate = mint_intermediate("Unknown Issuing CA", &root)?;
        let server = mint_leaf("portal.example.com", &intermediate, LeafUsage::default())?;
        let address = serve_tls(&server, &[&intermediate.certificate])?;

        let transport = transport(dir.path(), Duration::from_secs(10))?;
        let request = Request::get(format!("https://{address}/work")).body(Bytes::new())?;
        let Err(TransportError::Tls {
            presented_chain, ..
        }) = transport.send(request).await
        else {
            panic!("handshake with an unknown root should fail");
        };

        let der = presented_chain
            .iter()
            .map(|certificate| certificate.to_der())
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(
            der,
            vec![
                server.certificate.to_der()?,
                intermediate.certificate.to_der()?
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn omitted_intermediate_leaves_only_the_leaf() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = mint_ca("Root CA")?;
        let intermediate = mint_intermediate("Issuing CA", &root)?;
        let server = mint_leaf("portal.example.com", &intermediate, LeafUsage::default())?;
        let address = serve_tls(&server, &[])?;

        let trust = Arc::new(TrustStore::load(None, &[], dir.path())?);
        let transport = HyperTransport::new(trust.clone(), Duration::from_secs(10));
        let request = Request::get(format!("https://{address}/work")).body(Bytes::new())?;
        let Err(TransportError::Tls {
            presented_chain, ..
        }) = transport.send(request).await
        else {
            panic!("handshake without the intermediate should fail");
        };

        assert_eq!(presented_chain.len(), 1);
        assert_eq!(presented_chain[0].to_der()?, server.certificate.to_der()?);
        assert!(trust.accept_chain(&presented_chain).is_err());
        Ok(())
    }
}
