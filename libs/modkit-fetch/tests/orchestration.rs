#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end call lifecycle against scripted in-memory transports.

use async_trait::async_trait;
use modkit_fetch::{
    ConcurrencyScope, ConfigOverrides, Endpoint, FetchError, FetchGlobal, StaticMocks, Transport,
    TransportRequest, Transports,
};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

type Reply = dyn Fn(usize, &TransportRequest) -> Result<Value, FetchError> + Send + Sync;

/// Answers every request with `reply(call_index, request)` after `delay`.
struct Scripted {
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<Map<String, Value>>>,
    reply: Box<Reply>,
}

impl Scripted {
    fn new<F>(delay: Duration, reply: F) -> Arc<Self>
    where
        F: Fn(usize, &TransportRequest) -> Result<Value, FetchError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            reply: Box::new(reply),
        })
    }

    /// Echoes the request data back as successful content.
    fn echo(delay: Duration) -> Arc<Self> {
        Self::new(delay, |_, request| {
            Ok(json!({"success": true, "content": {"data": request.data}}))
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn send(&self, request: TransportRequest) -> Result<Value, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.data.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.reply)(n, &request)
    }
}

fn global_with(transport: Arc<Scripted>) -> FetchGlobal {
    FetchGlobal::with_transports(Transports::default().with_standard(transport))
}

fn endpoint(global: &FetchGlobal, overrides: ConfigOverrides) -> Endpoint {
    let context = global.context(&ConfigOverrides::new().url_prefix("http://localhost:8001/"));
    let group = context
        .create_api_group("test", [("call", overrides.url("api/test"))])
        .unwrap();
    group.get("call").unwrap().clone()
}

#[tokio::test]
async fn test_ignore_policy_single_attempt_and_shared_stub() {
    let transport = Scripted::echo(Duration::from_millis(50));
    let global = global_with(transport.clone());
    let endpoint = endpoint(&global, ConfigOverrides::new().ignore_self_concurrent(true));

    let first = endpoint.call(json!({"n": 1}));
    let second = endpoint.call(json!({"n": 2}));
    let third = endpoint.call(json!({"n": 3}));
    assert!(!first.is_ignored());
    assert!(second.is_ignored());
    assert!(Arc::ptr_eq(
        second.ignored_stub().unwrap(),
        third.ignored_stub().unwrap()
    ));

    let stub = Arc::clone(third.ignored_stub().unwrap());
    let chained = third
        .then(|_| panic!("ignored continuation must not run"))
        .catch(|_| panic!("ignored continuation must not run"));
    assert!(Arc::ptr_eq(chained.ignored_stub().unwrap(), &stub));

    let value = first.await.unwrap();
    assert_eq!(value, json!({"data": {"n": 1}}));
    assert_eq!(transport.calls(), 1);
    assert!(second.outcome().await.is_none());

    // the slot is free once the first call settled
    let again = endpoint.call(json!({"n": 4}));
    assert!(!again.is_ignored());
    again.await.unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_override_policy_supersedes_previous_call() {
    let transport = Scripted::echo(Duration::from_millis(30));
    let global = global_with(transport.clone());
    let resolved = Arc::new(AtomicUsize::new(0));
    let r = resolved.clone();
    let _global_resolve = global.on_resolve(move |_, _| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    let endpoint = endpoint(&global, ConfigOverrides::new().override_self_concurrent(true));

    let first_ran = Arc::new(AtomicBool::new(false));
    let flag = first_ran.clone();
    let first = endpoint.call(json!({"n": 1})).then(move |v| {
        flag.store(true, Ordering::SeqCst);
        Ok(v)
    });
    let second = endpoint.call(json!({"n": 2}));
    assert!(endpoint.pending());

    let value = second.await.unwrap();
    assert_eq!(value, json!({"data": {"n": 2}}), "vars of calls never mix");
    assert!(!endpoint.pending());

    let waited = tokio::time::timeout(Duration::from_millis(100), first).await;
    assert!(waited.is_err(), "superseded call never settles");
    assert!(!first_ran.load(Ordering::SeqCst));
    assert_eq!(resolved.load(Ordering::SeqCst), 1, "superseded call never broadcasts");
}

#[tokio::test]
async fn test_argument_scope_dedups_per_arguments() {
    let transport = Scripted::echo(Duration::from_millis(30));
    let global = global_with(transport.clone());
    let endpoint = endpoint(
        &global,
        ConfigOverrides::new()
            .ignore_self_concurrent(true)
            .concurrency_scope(ConcurrencyScope::Arguments),
    );

    let a = endpoint.call(json!({"id": 1}));
    let b = endpoint.call(json!({"id": 2}));
    let a_again = endpoint.call(json!({"id": 1}));
    assert!(!a.is_ignored());
    assert!(!b.is_ignored());
    assert!(a_again.is_ignored());

    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_retry_succeeds_on_third_attempt() {
    let transport = Scripted::new(Duration::ZERO, |n, _| {
        if n < 2 {
            Err(FetchError::transport_msg("connection reset"))
        } else {
            Ok(json!({"success": true, "content": "ok"}))
        }
    });
    let global = global_with(transport.clone());
    let endpoint = endpoint(&global, ConfigOverrides::new().retry(2));

    assert_eq!(endpoint.call(()).await.unwrap(), json!("ok"));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let transport = Scripted::new(Duration::ZERO, |_, _| {
        Ok(json!({"success": false, "error": {"code": 9, "message": "busy"}}))
    });
    let global = global_with(transport.clone());
    let rejected = Arc::new(AtomicUsize::new(0));
    let r = rejected.clone();
    let _global_reject = global.on_reject(move |_, _| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    let endpoint = endpoint(&global, ConfigOverrides::new().retry(1));

    let err = endpoint.call(()).await.unwrap_err();
    assert_eq!(err.code(), Some(&json!(9)));
    assert_eq!(transport.calls(), 2);
    assert_eq!(rejected.load(Ordering::SeqCst), 1, "one broadcast per call, not per attempt");
}

#[tokio::test]
async fn test_reject_broadcast_order() {
    let transport = Scripted::new(Duration::ZERO, |_, _| {
        Ok(json!({"success": false, "error": {"code": 1}}))
    });
    let global = global_with(transport);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    let _global_reject =
        global.on_reject(move |err, _| o.lock().push(("global", err.code().cloned())));
    let context = global.context(&ConfigOverrides::new());
    let o = order.clone();
    let _context_reject =
        context.on_reject(move |err, _| o.lock().push(("context", err.code().cloned())));
    let group = context
        .create_api_group("test", [("call", ConfigOverrides::new().url("http://h/x"))])
        .unwrap();

    let o = order.clone();
    let result = group
        .get("call")
        .unwrap()
        .call(())
        .catch(move |err| {
            o.lock().push(("caller", err.code().cloned()));
            Err(err)
        })
        .await;
    assert!(result.is_err());

    let order = order.lock();
    let scopes: Vec<&str> = order.iter().map(|(scope, _)| *scope).collect();
    assert_eq!(scopes, vec!["global", "context", "caller"]);
    assert!(order.iter().all(|(_, code)| *code == Some(json!(1))));
}

#[tokio::test]
async fn test_resolve_broadcast_order() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    let _global_resolve =
        global.on_resolve(move |value, _| o.lock().push(("global", value.clone())));
    let context = global.context(&ConfigOverrides::new());
    let o = order.clone();
    let _context_resolve =
        context.on_resolve(move |value, _| o.lock().push(("context", value.clone())));
    let group = context
        .create_api_group("test", [("call", ConfigOverrides::new().url("http://h/x"))])
        .unwrap();

    let o = order.clone();
    let value = group
        .get("call")
        .unwrap()
        .call(json!({"id": 5}))
        .then(move |value| {
            o.lock().push(("caller", value.clone()));
            Ok(value)
        })
        .await
        .unwrap();
    assert_eq!(value, json!({"data": {"id": 5}}));

    let order = order.lock();
    let scopes: Vec<&str> = order.iter().map(|(scope, _)| *scope).collect();
    assert_eq!(scopes, vec!["global", "context", "caller"]);
    assert!(order.iter().all(|(_, seen)| *seen == value));
}

#[tokio::test]
async fn test_panicking_hook_settles_with_programming_error() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport.clone());
    let rejected = Arc::new(AtomicBool::new(false));
    let r = rejected.clone();
    let _global_reject = global.on_reject(move |_, _| r.store(true, Ordering::SeqCst));
    let endpoint = endpoint(
        &global,
        ConfigOverrides::new().retry(2).process(|content, _, _| {
            let missing = content["missing"].as_i64().unwrap();
            Ok(json!(missing))
        }),
    );

    let result = tokio::time::timeout(Duration::from_secs(2), endpoint.call(()))
        .await
        .expect("a panicking hook must still settle the call");
    let err = result.unwrap_err();
    assert!(matches!(err, FetchError::Programming(ref m) if m.contains("panicked")), "{err}");
    assert!(!endpoint.pending());
    assert!(!rejected.load(Ordering::SeqCst));
    assert_eq!(transport.calls(), 1, "a panic is not retried");
}

#[tokio::test]
async fn test_resolve_listeners_see_config() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _global_resolve = global.on_resolve(move |value, config| {
        s.lock().push((config.url.clone(), value.clone()));
    });
    let endpoint = endpoint(&global, ConfigOverrides::new());

    endpoint.call(json!({"k": "v"})).await.unwrap();
    assert_eq!(
        *seen.lock(),
        vec![(
            "http://localhost:8001/api/test".to_owned(),
            json!({"data": {"k": "v"}})
        )]
    );
}

#[tokio::test]
async fn test_unsubscribed_listener_not_called() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport);
    let called = Arc::new(AtomicBool::new(false));
    let c = called.clone();
    let subscription = global.on_resolve(move |_, _| c.store(true, Ordering::SeqCst));
    assert!(subscription.unsubscribe());

    endpoint(&global, ConfigOverrides::new()).call(()).await.unwrap();
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_mock_bypasses_transport() {
    let transport = Scripted::echo(Duration::ZERO);
    let mocks = StaticMocks::new().with("./mock/pay", json!({"success": true, "content": "paid"}));
    let global = FetchGlobal::with_transports(
        Transports::default()
            .with_standard(transport.clone())
            .with_jsonp(transport.clone())
            .with_mock(Arc::new(mocks)),
    );
    let context = global.context(&ConfigOverrides::new().mock(true).mock_url_prefix("./mock/"));
    let group = context
        .create_api_group(
            "pay",
            [(
                "pay",
                ConfigOverrides::new()
                    .url("http://h/pay")
                    .mock_url("pay")
                    .process(|content, _, ctx| Ok(json!({"mock": ctx.mock, "content": content}))),
            )],
        )
        .unwrap();

    let value = group.get("pay").unwrap().call(()).await.unwrap();
    assert_eq!(value, json!({"mock": true, "content": "paid"}));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_pending_flag_lifecycle() {
    let transport = Scripted::echo(Duration::from_millis(20));
    let global = global_with(transport);
    let endpoint = endpoint(&global, ConfigOverrides::new());

    assert!(!endpoint.pending());
    let handle = endpoint.call(());
    assert!(endpoint.pending(), "pending is set synchronously by call");
    handle.await.unwrap();
    assert!(!endpoint.pending());
}

#[tokio::test]
async fn test_pending_false_inside_listeners() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport);
    let endpoint = endpoint(&global, ConfigOverrides::new());
    let observed = Arc::new(Mutex::new(None));
    let o = observed.clone();
    let e = endpoint.clone();
    let _global_resolve = global.on_resolve(move |_, _| *o.lock() = Some(e.pending()));

    endpoint.call(()).await.unwrap();
    assert_eq!(*observed.lock(), Some(false));
}

#[tokio::test]
async fn test_timeout_rejects_with_timeout_marker() {
    let transport = Scripted::echo(Duration::from_millis(200));
    let global = global_with(transport.clone());
    let timed_out = Arc::new(AtomicBool::new(false));
    let t = timed_out.clone();
    let _global_reject =
        global.on_reject(move |err, _| t.store(err.is_timeout(), Ordering::SeqCst));
    let endpoint = endpoint(&global, ConfigOverrides::new().timeout(Duration::from_millis(20)));

    let err = endpoint.call(()).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(timed_out.load(Ordering::SeqCst));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_programming_error_not_broadcast() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport.clone());
    let rejected = Arc::new(AtomicBool::new(false));
    let r = rejected.clone();
    let _global_reject = global.on_reject(move |_, _| r.store(true, Ordering::SeqCst));
    let endpoint = endpoint(
        &global,
        ConfigOverrides::new()
            .retry(3)
            .fit(|_, _, _| anyhow::bail!("unexpected backend shape")),
    );

    let err = endpoint.call(()).await.unwrap_err();
    assert!(matches!(err, FetchError::Programming(ref m) if m.contains("unexpected backend shape")));
    assert!(!rejected.load(Ordering::SeqCst));
    assert_eq!(transport.calls(), 1, "programming errors are not retried");
}

#[tokio::test]
async fn test_fixed_and_live_data_merged() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport.clone());
    let endpoint = endpoint(
        &global,
        ConfigOverrides::new().data(json!({"fixData": 1}).as_object().cloned().unwrap()),
    );

    let value = endpoint
        .call(modkit_fetch::CallArgs::deferred(|| {
            json!({"liveData": 1}).as_object().cloned().unwrap()
        }))
        .await
        .unwrap();
    assert_eq!(value, json!({"data": {"fixData": 1, "liveData": 1}}));
}

#[tokio::test]
async fn test_global_config_snapshot_at_declaration() {
    let transport = Scripted::echo(Duration::ZERO);
    let global = global_with(transport);
    global.set_config(&ConfigOverrides::new().retry(1));
    let endpoint = endpoint(&global, ConfigOverrides::new());
    global.set_config(&ConfigOverrides::new().retry(5));

    assert_eq!(endpoint.config().retry, 1);
    assert_eq!(global.config_value("retry"), Some(json!(5)));
}
