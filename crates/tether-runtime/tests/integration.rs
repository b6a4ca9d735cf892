//! End-to-end scenarios composing the space, collector and
//! synchronizer through the runtime facade.

use std::sync::Arc;

use tether_runtime::{
    CreateOptions, Endpoint, GcConfig, Key, LoadContext, MemoryNetwork, MemoryStore, ObserverFlow,
    PointerStore, Runtime, RuntimeConfig, SyncConfig, TrustedPermission, Value,
};

struct Node {
    endpoint: Endpoint,
    runtime: Arc<Runtime>,
    store: Arc<MemoryStore>,
}

fn node(network: &Arc<MemoryNetwork>, name: &str, config: RuntimeConfig) -> Node {
    let endpoint = config.endpoint.clone();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(network.transport(endpoint.clone()));
    let runtime = Runtime::new(transport, store.clone(), config);
    network.attach(&endpoint, runtime.sync().clone());
    Node {
        endpoint,
        runtime,
        store,
    }
}

fn config(name: &str) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(Endpoint::new(name));
    config.gc = GcConfig {
        grace_ms: 10,
        enabled: true,
    };
    config
}

#[tokio::test]
async fn test_remote_change_drives_local_transform() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice", config("alice"));
    let bob = node(&network, "bob", config("bob"));

    let source = alice
        .runtime
        .space()
        .create(Value::Int(10), CreateOptions::default())
        .unwrap();

    let replica = bob
        .runtime
        .sync()
        .load(source.id(), &LoadContext::new())
        .await
        .unwrap()
        .ready()
        .unwrap();
    let doubled = bob
        .runtime
        .space()
        .transform(&[replica.clone()], |inputs| match inputs[0] {
            Value::Int(n) => Value::Int(n * 2),
            _ => Value::Null,
        })
        .unwrap();
    assert_eq!(bob.runtime.space().value(&doubled).unwrap(), Value::Int(20));

    alice
        .runtime
        .space()
        .replace(&source, Value::Int(21))
        .unwrap();
    alice.runtime.tick(0).await;

    assert_eq!(bob.runtime.space().value(&doubled).unwrap(), Value::Int(42));
}

#[tokio::test]
async fn test_collected_replica_unsubscribes_at_origin() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice", config("alice"));
    let bob = node(&network, "bob", config("bob"));

    let ptr = alice
        .runtime
        .space()
        .create(Value::Int(1), CreateOptions::default())
        .unwrap();
    // The origin copy must not be collected underneath the test.
    alice.runtime.space().set_persistent(&ptr, true);

    let replica = bob
        .runtime
        .sync()
        .load(ptr.id(), &LoadContext::new())
        .await
        .unwrap()
        .ready()
        .unwrap();
    assert_eq!(ptr.subscribers(), vec![bob.endpoint.clone()]);

    // Touch retention so the replica shows up as collectable, then let
    // the grace window elapse across ticks.
    let observer = bob
        .runtime
        .space()
        .observe(&replica, |_| ObserverFlow::Continue);
    bob.runtime.space().unobserve(&replica, observer);
    bob.runtime.tick(0).await;
    bob.runtime.tick(10).await;
    bob.runtime.tick(11).await;

    assert!(bob.runtime.space().get(&ptr.id()).is_none());
    assert_eq!(bob.runtime.gc_stats().collected, 1);
    // The finalize descriptor reached the origin as an unsubscribe.
    assert!(ptr.subscribers().is_empty());
}

#[tokio::test]
async fn test_runtime_failover_rehomes_subscriptions() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice", config("alice"));
    let backup = node(&network, "backup", config("backup"));
    let mut bob_config = config("bob");
    bob_config.sync = SyncConfig::builder()
        .trust(
            Endpoint::new("backup"),
            vec![TrustedPermission::FallbackPointerSource],
        )
        .build();
    let bob = node(&network, "bob", bob_config);

    let ptr = alice
        .runtime
        .space()
        .create(Value::Int(5), CreateOptions::default())
        .unwrap();
    let mirrored = backup
        .runtime
        .space()
        .create_uninitialized(CreateOptions {
            id: Some(ptr.id()),
            origin: Some(alice.endpoint.clone()),
            ..Default::default()
        })
        .unwrap();
    backup
        .runtime
        .space()
        .init_value(&mirrored, Value::Int(5))
        .unwrap();
    backup.runtime.space().set_persistent(&mirrored, true);

    let replica = bob
        .runtime
        .sync()
        .load(ptr.id(), &LoadContext::new())
        .await
        .unwrap()
        .ready()
        .unwrap();
    bob.runtime.space().set_persistent(&replica, true);
    assert_eq!(replica.subscribed_to(), Some(alice.endpoint.clone()));

    network.set_online(&alice.endpoint, false);
    bob.runtime.tick(0).await;

    assert_eq!(replica.subscribed_to(), Some(backup.endpoint.clone()));
    assert_eq!(bob.runtime.sync_stats().failovers, 1);

    // Updates served by the fallback keep flowing.
    backup
        .runtime
        .space()
        .replace(&mirrored, Value::Int(6))
        .unwrap();
    backup.runtime.tick(0).await;
    assert_eq!(bob.runtime.space().value(&replica).unwrap(), Value::Int(6));
}

#[tokio::test]
async fn test_persisted_pointer_survives_restart() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice", config("alice"));

    let ptr = alice
        .runtime
        .space()
        .create(Value::Text("kept".into()), CreateOptions::default())
        .unwrap();
    let id = ptr.id();
    alice.runtime.sync().persist(&ptr).unwrap();
    assert!(alice.store.has_pointer(&id));

    // A fresh runtime over the same store stands in for a restart.
    let transport = Arc::new(network.transport(alice.endpoint.clone()));
    let restarted = Runtime::new(transport, alice.store.clone(), config("alice"));
    let reloaded = restarted
        .sync()
        .load(id, &LoadContext::new())
        .await
        .unwrap()
        .ready()
        .unwrap();
    assert_eq!(
        restarted.space().value(&reloaded).unwrap(),
        Value::Text("kept".into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_background_driver_propagates_updates() {
    let network = MemoryNetwork::new();
    let mut alice_config = config("alice");
    alice_config.tick_interval_ms = 10;
    let alice = node(&network, "alice", alice_config);
    let bob = node(&network, "bob", config("bob"));

    let ptr = alice
        .runtime
        .space()
        .create(Value::Int(1), CreateOptions::default())
        .unwrap();
    alice.runtime.space().set_persistent(&ptr, true);
    let replica = bob
        .runtime
        .sync()
        .load(ptr.id(), &LoadContext::new())
        .await
        .unwrap()
        .ready()
        .unwrap();

    let driver = alice.runtime.spawn_driver();
    alice.runtime.space().replace(&ptr, Value::Int(3)).unwrap();

    tokio::time::advance(std::time::Duration::from_millis(50)).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    assert_eq!(bob.runtime.space().value(&replica).unwrap(), Value::Int(3));
    driver.abort();
}

#[tokio::test]
async fn test_map_property_edits_replicate() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice", config("alice"));
    let bob = node(&network, "bob", config("bob"));

    let mut entries = indexmap::IndexMap::new();
    entries.insert("title".to_string(), Value::Text("draft".into()));
    let ptr = alice
        .runtime
        .space()
        .create(Value::Map(entries), CreateOptions::default())
        .unwrap();

    let replica = bob
        .runtime
        .sync()
        .load(ptr.id(), &LoadContext::new())
        .await
        .unwrap()
        .ready()
        .unwrap();

    alice.runtime.space().set(&ptr, "title", "final").unwrap();
    alice.runtime.space().set(&ptr, "pages", 12i64).unwrap();
    alice
        .runtime
        .space()
        .delete_property(&ptr, "title")
        .unwrap();
    alice.runtime.tick(0).await;

    assert_eq!(
        bob.runtime
            .space()
            .get_property(&replica, &Key::from("title"))
            .unwrap(),
        None
    );
    assert_eq!(
        bob.runtime
            .space()
            .get_property(&replica, &Key::from("pages"))
            .unwrap(),
        Some(Value::Int(12))
    );
}
