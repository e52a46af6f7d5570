//! Permission gating and quota enforcement, at the context level and
//! through the sandbox.

mod common;

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tether_plugins::{
    Backends, CapabilityFactory, ErrorKind, KvStore, PluginError, PluginManifest, RateLimiter,
};

use common::{CountingSheets, Harness, one_tool};

fn manifest(name: &str, permissions: &[&str]) -> PluginManifest {
    let text = format!(
        "name = \"{name}\"\nversion = \"1.0.0\"\npermissions = [{}]\n",
        permissions
            .iter()
            .map(|p| format!("\"{p}\""))
            .collect::<Vec<_>>()
            .join(", ")
    );
    PluginManifest::from_toml(&text, Path::new("plugin.toml")).unwrap()
}

fn factory(sheets: std::sync::Arc<CountingSheets>, rpm: u32) -> CapabilityFactory {
    CapabilityFactory::new(
        std::sync::Arc::new(RateLimiter::new(rpm)),
        Backends::none().with_sheets(sheets),
        std::sync::Arc::new(KvStore::new()),
    )
}

#[tokio::test]
async fn test_denied_methods_never_reach_backend() {
    let sheets = CountingSheets::new();
    let ctx = factory(sheets.clone(), 100).build(&manifest("reader", &["sheets.read"]));
    let api = ctx.sheets().unwrap();

    for result in [
        api.update("doc", "A1", json!([[1]])).await.map(|_| ()),
        api.create(json!({})).await.map(|_| ()),
        api.batch_update("doc", vec![json!({})]).await.map(|_| ()),
    ] {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
    assert_eq!(sheets.calls(), 0);

    api.get("doc", Some("A1")).await.unwrap();
    api.batch_get("doc", &["A1".to_owned()]).await.unwrap();
    assert_eq!(sheets.calls(), 2);
}

#[tokio::test]
async fn test_denied_call_does_not_consume_quota() {
    let sheets = CountingSheets::new();
    let f = factory(sheets.clone(), 2);
    let ctx = f.build(&manifest("reader", &["sheets.read"]));
    let api = ctx.sheets().unwrap();

    for _ in 0..5 {
        assert!(api.update("doc", "A1", json!([])).await.is_err());
    }
    assert_eq!(f.limiter().remaining_quota("reader"), 2);
}

#[tokio::test]
async fn test_capability_presence_follows_permissions() {
    let sheets = CountingSheets::new();
    let f = factory(sheets, 10);

    let none = f.build(&manifest("bare", &[]));
    assert!(none.sheets().is_none());
    assert!(none.drive().is_none());
    assert!(none.network().is_none());
    assert!(none.storage().is_some());

    let net = f.build(&manifest("net", &["network.fetch", "drive.read"]));
    assert!(net.network().is_some());
    assert!(net.drive().is_some());
    assert!(net.sheets().is_none());

    // Granted but unconfigured backend fails after the checks.
    let err = net.network().unwrap().fetch(Default::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.to_string().contains("not configured"));
}

#[tokio::test(start_paused = true)]
async fn test_quota_allows_exactly_ceiling() {
    let sheets = CountingSheets::new();
    let f = factory(sheets.clone(), 5);
    let ctx = f.build(&manifest("burst", &["sheets.read"]));
    let api = ctx.sheets().unwrap();

    for _ in 0..5 {
        api.get("doc", None).await.unwrap();
    }
    let err = api.get("doc", None).await.unwrap_err();
    assert!(matches!(err, PluginError::QuotaExceeded { remaining: 0, .. }));
    assert_eq!(err.details(), Some(json!({ "remaining": 0 })));
    assert!(err.kind().is_retryable());
    assert_eq!(sheets.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_quota_window_slides() {
    let sheets = CountingSheets::new();
    let f = factory(sheets.clone(), 2);
    let ctx = f.build(&manifest("slide", &["sheets.read"]));
    let api = ctx.sheets().unwrap();

    api.get("doc", None).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    api.get("doc", None).await.unwrap();
    assert!(api.get("doc", None).await.is_err());

    // Oldest entry leaves the window; one slot frees up with no call in between.
    tokio::time::advance(Duration::from_secs(31)).await;
    api.get("doc", None).await.unwrap();
    assert!(api.get("doc", None).await.is_err());

    tokio::time::advance(Duration::from_secs(30)).await;
    api.get("doc", None).await.unwrap();
    assert_eq!(sheets.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_plugins_have_separate_windows() {
    let sheets = CountingSheets::new();
    let f = factory(sheets, 1);
    let a = f.build(&manifest("a", &["sheets.read"]));
    let b = f.build(&manifest("b", &["sheets.read"]));

    a.sheets().unwrap().get("doc", None).await.unwrap();
    assert!(a.sheets().unwrap().get("doc", None).await.is_err());
    b.sheets().unwrap().get("doc", None).await.unwrap();
}

#[tokio::test]
async fn test_storage_is_namespaced_per_plugin() {
    let f = factory(CountingSheets::new(), 1);
    let a = f.build(&manifest("a", &[]));
    let b = f.build(&manifest("b", &[]));

    a.storage().unwrap().set("k", json!(1));
    assert_eq!(a.storage().unwrap().get("k"), Some(json!(1)));
    assert_eq!(b.storage().unwrap().get("k"), None);
    // Storage is never rate limited.
    for i in 0..10 {
        a.storage().unwrap().set(&format!("k{i}"), json!(i));
    }
    assert_eq!(f.limiter().remaining_quota("a"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_without_write_grant_inside_handler() {
    let h = Harness::new();
    let dir = h.write_plugin(
        "reader",
        &one_tool(
            "reader",
            &["sheets.read"],
            "write",
            "async (p, c) => c.sheets.update('doc', 'A1', [[1]])",
        ),
    );
    h.runtime.load_plugin(&dir).unwrap();

    let err = h
        .runtime
        .execute_tool_handler("reader", "write", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(err.kind().code(), "PLUGIN_PERMISSION_DENIED");
    assert_eq!(err.details(), Some(json!({ "permission": "sheets.write" })));
    assert_eq!(err.plugin(), Some("reader"));
    assert_eq!(h.sheets.calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_third_call_hits_quota_inside_handler() {
    let h = Harness::with_config(|c| c.requests_per_minute = 2);
    let dir = h.write_plugin(
        "burst",
        &one_tool(
            "burst",
            &["sheets.read"],
            "triple",
            "async function triple(p, c) {
                const first = await c.sheets.get('doc', 'A1');
                const second = await c.sheets.get('doc', 'A2');
                await c.sheets.get('doc', 'A3');
                return [first, second];
            }",
        ),
    );
    h.runtime.load_plugin(&dir).unwrap();

    let err = h
        .runtime
        .execute_tool_handler("burst", "triple", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert!(matches!(err, PluginError::QuotaExceeded { remaining: 0, .. }));
    assert_eq!(h.sheets.calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_can_catch_capability_errors() {
    let h = Harness::new();
    let dir = h.write_plugin(
        "careful",
        &one_tool(
            "careful",
            &["sheets.read", "sheets.write"],
            "try_batch",
            "async (p, c) => {
                try {
                    await c.sheets.batchUpdate('doc', [{}]);
                    return 'unexpected';
                } catch (e) {
                    return { caught: true, readOnly: e.message.includes('read-only') };
                }
            }",
        ),
    );
    h.runtime.load_plugin(&dir).unwrap();

    let out = h
        .runtime
        .execute_tool_handler("careful", "try_batch", json!({}))
        .await
        .unwrap();
    assert_eq!(out, json!({ "caught": true, "readOnly": true }));
    assert_eq!(h.sheets.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_capability_object_is_undefined() {
    let h = Harness::new();
    let dir = h.write_plugin(
        "bare",
        &one_tool(
            "bare",
            &[],
            "probe",
            "(p, c) => [typeof c.sheets, typeof c.drive, typeof c.network, typeof c.storage]",
        ),
    );
    h.runtime.load_plugin(&dir).unwrap();

    let out = h
        .runtime
        .execute_tool_handler("bare", "probe", json!({}))
        .await
        .unwrap();
    assert_eq!(out, json!(["undefined", "undefined", "undefined", "object"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_storage_round_trip_through_handlers() {
    let h = Harness::new();
    let dir = h.write_plugin(
        "counter",
        "name = \"counter\"\nversion = \"1.0.0\"\n\n\
[[tools]]\nname = \"bump\"\nhandler = '''async (p, c) => { const n = (await c.storage.get('n')) ?? 0; await c.storage.set('n', n + 1); return n + 1; }'''\n\n\
[[tools]]\nname = \"keys\"\nhandler = '''async (p, c) => c.storage.list()'''\n",
    );
    h.runtime.load_plugin(&dir).unwrap();

    for expected in 1..=3 {
        let out = h
            .runtime
            .execute_tool_handler("counter", "bump", json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!(expected));
    }
    let keys = h
        .runtime
        .execute_tool_handler("counter", "keys", json!({}))
        .await
        .unwrap();
    assert_eq!(keys, json!(["n"]));
}
