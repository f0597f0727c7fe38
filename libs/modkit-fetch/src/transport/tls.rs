//! TLS connector construction for the hyper-based transports.
//!
//! Native root certificates are loaded from the OS store at most once per
//! process; repeated store lookups are slow on some platforms.

use super::standard::TlsRootConfig;
use crate::error::FetchError;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn load_native_roots() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }
    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }
    result.certs
}

/// Cached native root certificates (may be empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(load_native_roots).as_slice()
}

/// The globally installed crypto provider, or a fresh aws-lc-rs one without installing it.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_roots_client_config() -> Result<rustls::ClientConfig, FetchError> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err(FetchError::transport_msg(
            "no native root CA certificates found in OS certificate store",
        ));
    }

    let mut root_store = rustls::RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(FetchError::transport_msg(format!(
            "no valid native root CA certificates parsed ({ignored} rejected)"
        )));
    }

    Ok(
        rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| FetchError::transport("failed to set TLS protocol versions", e))?
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Build a connector that speaks both `http` and `https`.
///
/// # Errors
/// Returns [`FetchError::Transport`] when the requested root store is unusable.
pub fn https_connector(
    tls_roots: TlsRootConfig,
) -> Result<HttpsConnector<HttpConnector>, FetchError> {
    let connector = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| FetchError::transport("failed to configure TLS", e))?
            .https_or_http()
            .enable_all_versions()
            .build(),
        TlsRootConfig::Native => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(native_roots_client_config()?)
            .https_or_http()
            .enable_all_versions()
            .build(),
    };
    Ok(connector)
}
