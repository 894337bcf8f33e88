// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::config::ControllerConfig;
use crate::crd::{Fleet, FleetSpec};
use crate::executable_model::api_server::{ExecutableApiServerModel, Verb};
use crate::fleet_controller::inventory::{Inventory, UNITS_FINALIZER};
use crate::fleet_controller::reconciler::FleetReconciler;
use crate::kubernetes_api_objects::error::APIError;
use crate::shim_layer::controller_runtime::{error_policy, forward_unit_deletion, reconcile_with, Data};
use crate::{Error, ReconcileError};
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{controller::Action, reflector::ObjectRef, watcher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

fn data_with(config: ControllerConfig) -> Arc<Data<ExecutableApiServerModel>> {
    Arc::new(Data {
        executor: ExecutableApiServerModel::new(),
        config,
    })
}

fn data() -> Arc<Data<ExecutableApiServerModel>> {
    data_with(ControllerConfig::default())
}

fn new_fleet(count: u32) -> Fleet {
    let mut fleet = Fleet::new("r", FleetSpec { count, unit_port: 6379 });
    fleet.metadata.namespace = Some("default".to_string());
    fleet
}

// The object kube-rs hands to reconcile: only its key matters, the rest is re-read from the store.
fn trigger() -> Arc<Fleet> {
    Arc::new(new_fleet(0))
}

async fn reconcile(data: &Arc<Data<ExecutableApiServerModel>>) -> Result<Action, Error> {
    reconcile_with::<Fleet, FleetReconciler, ExecutableApiServerModel>(trigger(), data.clone()).await
}

fn stored_fleet(data: &Arc<Data<ExecutableApiServerModel>>) -> Fleet {
    data.executor.get_object::<Fleet>("default", "r").unwrap()
}

fn tracked_units(data: &Arc<Data<ExecutableApiServerModel>>) -> Vec<String> {
    Inventory::from_fleet(&stored_fleet(data)).units().to_vec()
}

fn tracked_unit_count(data: &Arc<Data<ExecutableApiServerModel>>) -> Option<u32> {
    stored_fleet(data).status.map(|status| status.tracked_unit_count)
}

fn set_count(data: &Arc<Data<ExecutableApiServerModel>>, count: u32) {
    let mut fleet = stored_fleet(data);
    fleet.spec.count = count;
    data.executor.update_object(&fleet).unwrap();
}

fn unit_exists(data: &Arc<Data<ExecutableApiServerModel>>, name: &str) -> bool {
    data.executor.get_object::<Pod>("default", name).is_some()
}

fn unit_port(data: &Arc<Data<ExecutableApiServerModel>>, name: &str) -> Option<i32> {
    data.executor
        .get_object::<Pod>("default", name)?
        .spec?
        .containers
        .first()?
        .ports
        .as_ref()?
        .first()
        .map(|port| port.container_port)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[tokio::test]
async fn test_new_fleet_gets_its_units() {
    let data = data();
    data.executor.create_object(&new_fleet(2)).unwrap();

    let action = reconcile(&data).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert_eq!(
        data.executor.mutations(),
        strings(&[
            "Create Pod/default/r-0",
            "Create Pod/default/r-1",
            "Update Fleet/default/r",
            "UpdateStatus Fleet/default/r",
        ])
    );
    assert_eq!(data.executor.event_reasons(), strings(&["ScaleUp", "Updated"]));
    assert_eq!(tracked_units(&data), strings(&["r-0", "r-1"]));
    assert_eq!(stored_fleet(&data).metadata.finalizers, Some(strings(&[UNITS_FINALIZER])));
    assert_eq!(tracked_unit_count(&data), Some(2));
}

#[tokio::test]
async fn test_matched_fleet_is_not_written() {
    let data = data();
    data.executor.create_object(&new_fleet(2)).unwrap();
    reconcile(&data).await.unwrap();
    data.executor.clear_mutations();

    reconcile(&data).await.unwrap();
    assert!(data.executor.mutations().is_empty());
}

#[tokio::test]
async fn test_scale_up() {
    let data = data();
    data.executor.create_object(&new_fleet(2)).unwrap();
    reconcile(&data).await.unwrap();
    data.executor.clear_mutations();

    set_count(&data, 4);
    reconcile(&data).await.unwrap();
    assert_eq!(
        data.executor.mutations(),
        strings(&[
            "Create Pod/default/r-2",
            "Create Pod/default/r-3",
            "Update Fleet/default/r",
            "UpdateStatus Fleet/default/r",
        ])
    );
    assert_eq!(tracked_units(&data), strings(&["r-0", "r-1", "r-2", "r-3"]));
    assert_eq!(tracked_unit_count(&data), Some(4));
}

#[tokio::test]
async fn test_scale_down_deletes_in_order() {
    let data = data();
    data.executor.create_object(&new_fleet(4)).unwrap();
    reconcile(&data).await.unwrap();
    data.executor.clear_mutations();

    set_count(&data, 2);
    reconcile(&data).await.unwrap();
    assert_eq!(
        data.executor.mutations(),
        strings(&[
            "Delete Pod/default/r-2",
            "Delete Pod/default/r-3",
            "Update Fleet/default/r",
            "UpdateStatus Fleet/default/r",
        ])
    );
    assert!(data.executor.event_reasons().contains(&"ScaleDown".to_string()));
    assert_eq!(tracked_units(&data), strings(&["r-0", "r-1"]));
    assert_eq!(tracked_unit_count(&data), Some(2));
    assert!(!unit_exists(&data, "r-2"));
    assert!(!unit_exists(&data, "r-3"));
}

#[tokio::test]
async fn test_scale_to_zero_releases_finalizer() {
    let data = data();
    data.executor.create_object(&new_fleet(1)).unwrap();
    reconcile(&data).await.unwrap();

    set_count(&data, 0);
    reconcile(&data).await.unwrap();
    assert!(tracked_units(&data).is_empty());
    assert_eq!(stored_fleet(&data).metadata.finalizers, None);
    assert_eq!(tracked_unit_count(&data), Some(0));
}

#[tokio::test]
async fn test_port_change_only_reaches_new_units() {
    let data = data();
    data.executor.create_object(&new_fleet(2)).unwrap();
    reconcile(&data).await.unwrap();
    data.executor.clear_mutations();

    let mut fleet = stored_fleet(&data);
    fleet.spec.unit_port = 7000;
    data.executor.update_object(&fleet).unwrap();
    reconcile(&data).await.unwrap();
    // Live units keep their configuration.
    assert!(data.executor.mutations().is_empty());
    assert_eq!(unit_port(&data, "r-0"), Some(6379));
    assert_eq!(unit_port(&data, "r-1"), Some(6379));

    set_count(&data, 3);
    reconcile(&data).await.unwrap();
    assert_eq!(unit_port(&data, "r-0"), Some(6379));
    assert_eq!(unit_port(&data, "r-2"), Some(7000));
    assert_eq!(tracked_units(&data), strings(&["r-0", "r-1", "r-2"]));
}

#[tokio::test]
async fn test_scale_down_removes_inventory_tail_by_position() {
    let data = data();
    data.executor.create_object(&new_fleet(2)).unwrap();
    reconcile(&data).await.unwrap();

    // An inventory recorded out of order, then a shrink to one unit.
    let mut fleet = Inventory::parse("r-1,r-0").apply_to(&stored_fleet(&data));
    fleet.spec.count = 1;
    data.executor.update_object(&fleet).unwrap();
    data.executor.clear_mutations();

    reconcile(&data).await.unwrap();
    assert_eq!(
        data.executor.mutations(),
        strings(&[
            "Delete Pod/default/r-0",
            "Update Fleet/default/r",
            "UpdateStatus Fleet/default/r",
        ])
    );
    assert_eq!(tracked_units(&data), strings(&["r-0"]));
    assert!(!unit_exists(&data, "r-0"));
    // r-1 was past the desired length in the inventory, so it survives untracked.
    assert!(unit_exists(&data, "r-1"));
}

#[tokio::test]
async fn test_deleted_unit_is_recreated() {
    let data = data();
    data.executor.create_object(&new_fleet(2)).unwrap();
    reconcile(&data).await.unwrap();
    data.executor.clear_mutations();
    let original = data.executor.get_object::<Pod>("default", "r-1").unwrap();

    data.executor.delete_object::<Pod>("default", "r-1").unwrap();
    let (requeue_tx, mut requeue_rx) = mpsc::unbounded();
    assert!(forward_unit_deletion::<FleetReconciler>(
        watcher::Event::Deleted(original.clone()),
        &requeue_tx
    ));
    assert_eq!(requeue_rx.next().await, Some(ObjectRef::<Fleet>::new("r").within("default")));

    reconcile(&data).await.unwrap();
    // r-1 is still tracked, so the fleet itself is not written again.
    assert_eq!(data.executor.mutations(), strings(&["Create Pod/default/r-1"]));
    let recreated = data.executor.get_object::<Pod>("default", "r-1").unwrap();
    assert_eq!(recreated.spec, original.spec);
    assert_eq!(recreated.metadata.owner_references, original.metadata.owner_references);
    assert_eq!(tracked_units(&data), strings(&["r-0", "r-1"]));
}

#[tokio::test]
async fn test_unit_changes_other_than_deletion_do_not_requeue() {
    let (requeue_tx, mut requeue_rx) = mpsc::unbounded::<ObjectRef<Fleet>>();
    let data = data();
    data.executor.create_object(&new_fleet(1)).unwrap();
    reconcile(&data).await.unwrap();
    let unit = data.executor.get_object::<Pod>("default", "r-0").unwrap();

    assert!(forward_unit_deletion::<FleetReconciler>(watcher::Event::Applied(unit.clone()), &requeue_tx));
    // Empty but still open.
    assert!(requeue_rx.try_recv().is_err());
    drop(requeue_rx);
    // Nobody listens anymore: the observer should stop.
    assert!(!forward_unit_deletion::<FleetReconciler>(watcher::Event::Deleted(unit), &requeue_tx));
}

#[tokio::test]
async fn test_deletion_cascade_tolerates_failures() {
    let data = data();
    data.executor.create_object(&new_fleet(2)).unwrap();
    reconcile(&data).await.unwrap();
    data.executor.clear_mutations();

    data.executor.inject_failure(Verb::Delete, "Pod/default/r-0", APIError::Forbidden);
    data.executor.delete_object::<Fleet>("default", "r").unwrap();
    // The finalizer holds the fleet back until its units are cleaned up.
    assert!(stored_fleet(&data).metadata.deletion_timestamp.is_some());

    reconcile(&data).await.unwrap();
    assert_eq!(
        data.executor.mutations(),
        strings(&[
            "Delete Pod/default/r-0",
            "Delete Pod/default/r-1",
            "Update Fleet/default/r",
        ])
    );
    assert_eq!(data.executor.event_reasons().last(), Some(&"CleanupFailed".to_string()));
    assert!(data.executor.get_object::<Fleet>("default", "r").is_none());
    // r-0 survived the failed delete but goes away with its owner.
    assert!(data.executor.keys().is_empty());
}

#[tokio::test]
async fn test_missing_fleet_ends_quietly() {
    let data = data();
    let action = reconcile(&data).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(data.executor.mutations().is_empty());
}

#[tokio::test]
async fn test_create_failure_aborts_and_next_reconcile_catches_up() {
    let data = data();
    data.executor.create_object(&new_fleet(3)).unwrap();
    data.executor.inject_failure(Verb::Create, "Pod/default/r-1", APIError::Forbidden);

    let result = reconcile(&data).await;
    assert!(matches!(
        result,
        Err(Error::ReconcileCoreError(ReconcileError::CreateFailed { .. }))
    ));
    // r-0 was created, but nothing was recorded.
    assert!(unit_exists(&data, "r-0"));
    assert!(!unit_exists(&data, "r-2"));
    assert!(tracked_units(&data).is_empty());

    data.executor.clear_failures();
    reconcile(&data).await.unwrap();
    assert_eq!(tracked_units(&data), strings(&["r-0", "r-1", "r-2"]));
    assert_eq!(tracked_unit_count(&data), Some(3));
}

#[tokio::test]
async fn test_crash_after_create_loses_no_unit() {
    let data = data_with(ControllerConfig::default().with_fault_injection(true));
    data.executor.create_object(&new_fleet(2)).unwrap();
    data.executor.crash_at_mutation(1);

    let crashed = AssertUnwindSafe(reconcile(&data)).catch_unwind().await;
    assert!(crashed.is_err());
    assert!(unit_exists(&data, "r-0"));
    assert!(tracked_units(&data).is_empty());

    reconcile(&data).await.unwrap();
    assert_eq!(tracked_units(&data), strings(&["r-0", "r-1"]));
    assert_eq!(tracked_unit_count(&data), Some(2));
}

#[tokio::test]
async fn test_stale_fleet_write_is_a_conflict() {
    let data = data();
    data.executor.create_object(&new_fleet(1)).unwrap();
    data.executor.inject_failure(Verb::Update, "Fleet/default/r", APIError::Conflict);

    let result = reconcile(&data).await;
    assert!(matches!(
        result,
        Err(Error::ReconcileCoreError(ReconcileError::StoreConflict { .. }))
    ));
}

#[test]
fn test_error_policy_requeues_after_configured_delay() {
    let config = ControllerConfig {
        error_requeue_after: Duration::from_secs(3),
        ..ControllerConfig::default()
    };
    let data = data_with(config);
    let error = Error::ShimLayerError("boom".to_string());
    assert_eq!(
        error_policy(trigger(), &error, data),
        Action::requeue(Duration::from_secs(3))
    );
}
