#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Declarative request orchestration for `ModKit`
//!
//! Endpoints are declared once, in named API groups inside a context, and each
//! call runs through a uniform lifecycle:
//! - Config resolved across global → context → endpoint scopes (shallow merge)
//! - URL prefixing, mock URL resolution and JSONP auto-detection at declaration
//! - Self-concurrency policies: ignore (dedup) or override (supersede)
//! - Sequential retries with per-attempt timeouts and optional backoff
//! - `willFetch` / `fit` / `process` hooks around pluggable transports
//! - `resolve` / `reject` broadcast to global, then context, then the caller
//!
//! # Example
//!
//! ```ignore
//! use modkit_fetch::{ConfigOverrides, create_context};
//!
//! let context = create_context(&ConfigOverrides::new().url_prefix("http://localhost:8001/"));
//! let order = context.create_api_group(
//!     "order",
//!     [("create", ConfigOverrides::new().method(http::Method::POST).url("api/order-create"))],
//! )?;
//!
//! let created = order.get("create").unwrap().call(serde_json::json!({"sku": 1})).await?;
//! ```

mod api;
mod config;
mod coordinator;
mod error;
mod events;
mod handle;
mod hooks;
mod pipeline;
mod retry;
pub mod transport;
pub mod urls;

pub use api::{
    ApiGroup, Context, Endpoint, EndpointDecl, FetchGlobal, create_context, get_global_config,
    get_global_config_value, on_reject, on_resolve, set_global_config,
};
pub use config::{
    ConcurrencyScope, ConfigOverrides, ExponentialBackoff, FetchConfig, GLOBAL_CONFIG_KEYS,
    JsonpOption,
};
pub use error::{DeclareError, FetchError, NOT_ACCESSIBLE_MARKER};
pub use events::{EventBus, EventScope, FetchEvent, Subscription};
pub use handle::{CallHandle, IgnoredCall};
pub use hooks::{CallArgs, Envelope, Fit, HookContext, Process, RequestFn, Vars, WillFetch};
pub use retry::{RetryController, calculate_backoff};
pub use transport::{
    HttpTransport, JsonpTransport, MockSource, StaticMocks, TlsRootConfig, Transport,
    TransportRequest, Transports,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
