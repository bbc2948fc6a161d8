//! Transport seams
//!
//! [`BackendTransport`] issues origin fetches and probe requests;
//! [`InboundExchange`] is one client request waiting for its response. The
//! reqwest-backed [`HttpTransport`] and the in-memory [`BufferedExchange`]
//! are the stock implementations.

use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::time::timeout;

use super::backend::Backend;
use super::context::{BackendRequest, BackendResponse, InboundRequest, Response};
use super::error::{TransportError, TransportResult};
use super::headers::Headers;

/// Outbound HTTP used by the fetch machine and the health probes.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Send `request` to `backend` and buffer the full response.
    async fn fetch(
        &self,
        backend: &Backend,
        request: &BackendRequest,
    ) -> TransportResult<BackendResponse>;

    /// GET `path` on `backend`, returning the status code.
    async fn probe(&self, backend: &Backend, path: &str, limit: Duration) -> TransportResult<u16>;
}

/// One client request and the slot its response is written to.
#[async_trait]
pub trait InboundExchange: Send {
    /// The request as received.
    fn request(&self) -> &InboundRequest;

    /// Write the final response.
    async fn respond(&mut self, response: &Response) -> TransportResult<()>;
}

/// Exchange that keeps the response in memory.
#[derive(Debug, Clone)]
pub struct BufferedExchange {
    request: InboundRequest,
    response: Option<Response>,
}

impl BufferedExchange {
    /// Wrap an inbound request.
    pub fn new(request: InboundRequest) -> Self {
        Self {
            request,
            response: None,
        }
    }

    /// The written response, if any.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Consume the exchange, returning the written response.
    pub fn into_response(self) -> Option<Response> {
        self.response
    }
}

#[async_trait]
impl InboundExchange for BufferedExchange {
    fn request(&self) -> &InboundRequest {
        &self.request
    }

    async fn respond(&mut self, response: &Response) -> TransportResult<()> {
        if self.response.is_some() {
            return Err(TransportError::Write("response already written".into()));
        }
        self.response = Some(response.clone());
        Ok(())
    }
}

/// reqwest-backed transport honoring each backend's timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransport;

impl HttpTransport {
    /// Create the transport.
    pub fn new() -> Self {
        Self
    }
}

fn map_reqwest(backend: &Backend, err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Connect {
            backend: backend.name().to_string(),
            detail: err.to_string(),
        }
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Http(err.to_string())
    }
}

fn millis(duration: Duration) -> u128 {
    duration.as_millis()
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn fetch(
        &self,
        backend: &Backend,
        request: &BackendRequest,
    ) -> TransportResult<BackendResponse> {
        let spec = backend.spec();
        let client = backend.client()?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;

        let mut builder = client.request(method, backend.url_for(&request.url));
        for (name, value) in request.headers.iter() {
            if name.eq_ignore_ascii_case("host") && spec.host_header.is_some() {
                continue;
            }
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(host) = &spec.host_header {
            builder = builder.header("Host", host.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let mut response = timeout(spec.first_byte_timeout, builder.send())
            .await
            .map_err(|_| TransportError::Timeout {
                phase: "first byte",
                millis: millis(spec.first_byte_timeout),
            })?
            .map_err(|err| map_reqwest(backend, err))?;

        let status = response.status();
        let proto = format!("{:?}", response.version());
        let headers: Headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut body = BytesMut::new();
        loop {
            let chunk = timeout(spec.between_bytes_timeout, response.chunk())
                .await
                .map_err(|_| TransportError::Timeout {
                    phase: "between bytes",
                    millis: millis(spec.between_bytes_timeout),
                })?
                .map_err(|err| map_reqwest(backend, err))?;
            match chunk {
                Some(bytes) => body.extend_from_slice(&bytes),
                None => break,
            }
        }

        Ok(BackendResponse {
            status: i64::from(status.as_u16()),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            proto,
            headers,
            body: body.freeze(),
            backend: Some(backend.name().to_string()),
            ..BackendResponse::default()
        })
    }

    async fn probe(&self, backend: &Backend, path: &str, limit: Duration) -> TransportResult<u16> {
        let client = backend.client()?;
        let mut request = client.get(backend.url_for(path)).timeout(limit);
        if let Some(host) = &backend.spec().host_header {
            request = request.header("Host", host.as_str());
        }
        let response = timeout(limit, request.send())
            .await
            .map_err(|_| TransportError::Timeout {
                phase: "probe",
                millis: millis(limit),
            })?
            .map_err(|err| map_reqwest(backend, err))?;
        Ok(response.status().as_u16())
    }
}
