//! Dispatcher tests: resync, explicit triggers, and shutdown.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::*;
use tidescale_autoscale::{Dispatcher, Trigger};
use tidescale_core::{ControllerConfig, ResourceId};

const WAIT: Duration = Duration::from_secs(3);

fn start(h: &Harness, config: &ControllerConfig) -> (Trigger, watch::Sender<bool>, JoinHandle<()>) {
    let dispatcher = Dispatcher::new(h.flaky.clone(), h.reconciler.clone(), config);
    let trigger = dispatcher.trigger_handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(shutdown_rx));
    (trigger, shutdown_tx, handle)
}

#[tokio::test]
async fn resync_reconciles_stored_policies() {
    let h = Harness::new(fast_config());
    let id = ResourceId::new("default", "orders");
    h.seed(&id, &policy());

    let (_trigger, shutdown_tx, handle) = start(&h, &h.config);

    let store = h.store.clone();
    assert!(eventually(WAIT, || status(&store, &id).desired_nodes.is_some()).await);
    // The pass started a sync loop, which fills in observations.
    assert!(eventually(WAIT, || status(&store, &id).last_fetch_time.is_some()).await);

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(h.syncers.active().await.is_empty(), "shutdown must stop sync loops");
}

#[tokio::test]
async fn trigger_runs_a_pass_for_a_new_policy() {
    let config = ControllerConfig {
        resync_interval: Duration::from_secs(3600),
        ..quiet_config()
    };
    let h = Harness::new(config.clone());
    let (trigger, shutdown_tx, handle) = start(&h, &config);

    // Let the initial (empty) resync go by.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let id = ResourceId::new("default", "orders");
    h.seed(&id, &policy());
    assert!(trigger.trigger(id.clone()));

    let store = h.store.clone();
    assert!(eventually(WAIT, || status(&store, &id).desired_nodes == Some(1)).await);

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(!trigger.trigger(id), "trigger after shutdown is rejected");
}

#[tokio::test]
async fn deleted_policy_stops_its_syncer_on_resync() {
    let config = ControllerConfig {
        resync_interval: Duration::from_millis(30),
        ..quiet_config()
    };
    let h = Harness::new(config.clone());
    let id = ResourceId::new("default", "orders");
    h.seed(&id, &policy());
    let (_trigger, shutdown_tx, handle) = start(&h, &config);

    let mut running = false;
    for _ in 0..300 {
        if h.syncers.is_running(&id).await {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(running, "dispatcher never reconciled the policy");

    h.store.delete_policy(&id).unwrap();

    let mut stopped = false;
    for _ in 0..300 {
        if !h.syncers.is_running(&id).await {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(stopped, "sync loop outlived its deleted policy");

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_passes_are_retried() {
    let config = ControllerConfig {
        resync_interval: Duration::from_secs(3600),
        ..quiet_config()
    };
    let h = Harness::new(config.clone());
    let id = ResourceId::new("default", "orders");
    // Policy without a secret: every pass fails on credentials.
    seed_policy(&h.store, &id, &policy());

    let (_trigger, shutdown_tx, handle) = start(&h, &config);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status(&h.store, &id).desired_nodes, None);

    // Once the secret appears a backoff retry succeeds without a new trigger.
    seed_secret(&h.store, "default");
    let store = h.store.clone();
    assert!(eventually(WAIT, || status(&store, &id).desired_nodes.is_some()).await);
    assert!(h.factory.connects.load(Ordering::SeqCst) >= 1);

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn a_panicking_pass_does_not_wedge_its_identity() {
    let config = ControllerConfig {
        resync_interval: Duration::from_secs(3600),
        ..quiet_config()
    };
    let h = Harness::new(config.clone());
    let id = ResourceId::new("default", "orders");
    h.seed(&id, &policy());
    h.flaky.panic_on_next_read();

    // The first pass panics; the backoff retry must still run.
    let (_trigger, shutdown_tx, handle) = start(&h, &config);

    let store = h.store.clone();
    assert!(eventually(WAIT, || status(&store, &id).desired_nodes.is_some()).await);

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
}
