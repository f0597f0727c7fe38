//! Standard HTTP transport over hyper.

use super::{Transport, TransportRequest, tls};
use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";
const JSON_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// TLS root certificate source for HTTPS URLs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// JSON-over-HTTP transport.
///
/// `data` travels in the query string for `GET`, `HEAD` and `DELETE` and as a
/// form body otherwise. Non-2xx statuses become [`FetchError::Status`].
///
/// The hyper client is built on first use, so constructing the transport never
/// fails and never needs a runtime.
#[derive(Debug)]
pub struct HttpTransport {
    tls_roots: TlsRootConfig,
    client: OnceLock<Result<HyperClient, FetchError>>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tls_roots(TlsRootConfig::default())
    }

    #[must_use]
    pub fn with_tls_roots(tls_roots: TlsRootConfig) -> Self {
        Self {
            tls_roots,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&HyperClient, FetchError> {
        self.client
            .get_or_init(|| {
                let https = tls::https_connector(self.tls_roots)?;
                let mut builder = Client::builder(TokioExecutor::new());
                // pool_idle_timeout only takes effect with a pool timer
                builder.pool_timer(TokioTimer::new()).http2_only(false);
                Ok(builder.build::<_, Full<Bytes>>(https))
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Send one request and buffer the whole response body.
    pub(super) async fn exchange(
        &self,
        method: Method,
        uri: &str,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
    ) -> Result<(StatusCode, Bytes), FetchError> {
        let client = self.client()?;

        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri)
            .header(ACCEPT, JSON_ACCEPT);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, FORM_CONTENT_TYPE);
        }
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Full::new(body.map(Bytes::from).unwrap_or_default()))
            .map_err(|e| FetchError::transport(format!("invalid request for '{uri}'"), e))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| FetchError::transport(format!("request to '{uri}' failed"), e))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::transport("failed to read response body", e))?
            .to_bytes();
        Ok((status, bytes))
    }
}

fn sends_data_in_query(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::DELETE
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<Value, FetchError> {
        let encoded = request.encoded_data();
        let (uri, body) = if sends_data_in_query(&request.method) {
            (request.url_with_query(&encoded), None)
        } else {
            (request.url_with_query(""), Some(encoded))
        };
        tracing::trace!(method = %request.method, url = %uri, "sending request");

        let (status, bytes) = self
            .exchange(request.method.clone(), &uri, &request.headers, body)
            .await?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unknown status").to_owned(),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::transport(format!("response from '{uri}' is not JSON"), e))
    }
}
