//! Script-callback (JSONP) transport.
//!
//! The request is always a `GET` carrying `<flag>=<callback name>`; the backend
//! answers with `callbackName(<json>)`. Anything else, including an unreachable
//! host or a non-2xx status, is reported as [`FetchError::NotAccessible`].

use super::{HttpTransport, Transport, TransportRequest};
use crate::error::FetchError;
use async_trait::async_trait;
use http::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Query key used when `jsonpFlag` is not configured.
pub const DEFAULT_JSONP_FLAG: &str = "callback";

/// Callback name pattern used when `jsonpCallbackName` is not configured.
pub const DEFAULT_CALLBACK_NAME: &str = "jsonp{id}";

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
pub struct JsonpTransport {
    http: HttpTransport,
}

impl JsonpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_http(http: HttpTransport) -> Self {
        Self { http }
    }
}

/// Expand `{id}` with a process-unique counter; patterns without it are used verbatim.
fn callback_name(pattern: &str) -> String {
    if pattern.contains("{id}") {
        let id = NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed);
        pattern.replace("{id}", &id.to_string())
    } else {
        pattern.to_owned()
    }
}

/// Extract the JSON argument of `name(...)`, tolerating whitespace and a trailing `;`.
fn unwrap_callback(body: &str, name: &str) -> Option<Value> {
    let rest = body.trim().strip_prefix(name)?.trim_start();
    let rest = rest.strip_prefix('(')?;
    let rest = rest.trim_end();
    let rest = rest.strip_suffix(';').unwrap_or(rest).trim_end();
    let inner = rest.strip_suffix(')')?;
    if inner.trim().is_empty() {
        return Some(Value::Null);
    }
    serde_json::from_str(inner).ok()
}

#[async_trait]
impl Transport for JsonpTransport {
    async fn send(&self, request: TransportRequest) -> Result<Value, FetchError> {
        let flag = request.jsonp_flag.as_deref().unwrap_or(DEFAULT_JSONP_FLAG);
        let name = callback_name(
            request
                .jsonp_callback_name
                .as_deref()
                .unwrap_or(DEFAULT_CALLBACK_NAME),
        );

        let mut query = request.encoded_data();
        let callback = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(flag, &name)
            .finish();
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&callback);
        let uri = request.url_with_query(&query);

        let not_accessible = || FetchError::NotAccessible {
            url: request.url.clone(),
        };

        let (status, bytes) = self
            .http
            .exchange(Method::GET, &uri, &request.headers, None)
            .await
            .map_err(|e| {
                tracing::debug!(url = %uri, error = %e, "jsonp script could not be loaded");
                not_accessible()
            })?;
        if !status.is_success() {
            tracing::debug!(url = %uri, status = status.as_u16(), "jsonp script returned error status");
            return Err(not_accessible());
        }

        let body = String::from_utf8_lossy(&bytes);
        unwrap_callback(&body, &name).ok_or_else(|| {
            tracing::debug!(url = %uri, callback = %name, "jsonp script did not invoke its callback");
            not_accessible()
        })
    }
}
