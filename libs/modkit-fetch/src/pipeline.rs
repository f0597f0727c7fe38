//! One call's path from its vars to the value delivered to the caller.
//!
//! `will_fetch` → (attempt: source → `fit` → `process`) × retry budget.
//! The attempt source is, in order of precedence: the `request` hook, the mock
//! source, the JSONP transport, the standard transport.

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::hooks::{Envelope, HookContext, Vars};
use crate::retry::RetryController;
use crate::transport::{TransportRequest, Transports};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub(crate) struct Pipeline {
    config: Arc<FetchConfig>,
    transports: Transports,
}

impl Pipeline {
    pub(crate) fn new(config: Arc<FetchConfig>, transports: Transports) -> Self {
        Self { config, transports }
    }

    /// Run the whole call. Attempts are sequential; identity is not touched here.
    pub(crate) async fn run(&self, mut vars: Vars) -> Result<Value, FetchError> {
        if let Some(hook) = &self.config.will_fetch {
            hook.apply(&mut vars, &self.config)?;
        }
        let controller = RetryController::new(self.config.retry, self.config.retry_delay.clone());
        let vars = &vars;
        controller.run(move |n| self.attempt(vars, n)).await
    }

    async fn attempt(&self, vars: &Vars, attempt: usize) -> Result<Value, FetchError> {
        let config = &*self.config;
        tracing::trace!(url = %config.url, attempt, mock = config.mock, "attempt started");

        if let Some(request) = &config.request {
            return self
                .timed(request.call(vars.clone(), Arc::clone(&self.config), attempt))
                .await;
        }

        let raw = if config.mock {
            self.timed(self.transports.mock.load(&config.mock_url, vars))
                .await?
        } else {
            let transport = if config.jsonp {
                &self.transports.jsonp
            } else {
                &self.transports.standard
            };
            self.timed(transport.send(TransportRequest::new(config, vars)))
                .await?
        };

        let ctx = HookContext {
            mock: config.mock,
            attempt,
            config,
        };
        let envelope = match &config.fit {
            Some(fit) => fit.apply(raw, vars, &ctx)?,
            None => Envelope::from_standard(raw)?,
        };
        if !envelope.success {
            return Err(FetchError::from_envelope_error(envelope.error));
        }
        match &config.process {
            Some(process) => process.apply(envelope.content, vars, &ctx),
            None => Ok(envelope.content),
        }
    }

    /// Bound one attempt's source by the configured timeout; dropping the future aborts it.
    async fn timed<F>(&self, source: F) -> Result<Value, FetchError>
    where
        F: Future<Output = Result<Value, FetchError>>,
    {
        let timeout = self.config.timeout;
        if timeout.is_zero() {
            return source.await;
        }
        match tokio::time::timeout(timeout, source).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(timeout)),
        }
    }
}
