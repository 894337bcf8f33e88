// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::crd::{Fleet, FleetStatus};
use crate::fleet_controller::inventory::Inventory;
use crate::fleet_controller::self_healing::owner_fleet_refs;
use crate::fleet_controller::step::*;
use crate::fleet_controller::unit::{desired_unit_names, is_controlled_by, make_unit};
use crate::kubernetes_api_objects::api_method::*;
use crate::kubernetes_api_objects::error::APIError;
use crate::kubernetes_api_objects::marshal::{marshal, unmarshal};
use crate::reconciler::exec::{io::*, reconciler::*};
use crate::ReconcileError;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ApiResource;
use kube::runtime::reflector::ObjectRef;
use tracing::{info, warn};

// FleetReconcileState describes the local state with which reconcile_core makes decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetReconcileState {
    pub reconcile_step: FleetReconcileStep,
    pub phase: ReconcilePhase,
    // The units that should exist, computed once per reconcile.
    pub desired: Vec<String>,
    // Working copy of the fleet's inventory; persisted only at the end of a sync.
    pub inventory: Inventory,
    // Units created by this reconcile.
    pub created: Vec<String>,
    pub is_edit: bool,
}

pub struct FleetReconciler {}

impl Reconciler for FleetReconciler {
    type K = Fleet;
    type S = FleetReconcileState;

    fn reconcile_init_state() -> FleetReconcileState {
        reconcile_init_state()
    }

    fn reconcile_core(
        fleet: &Fleet,
        resp_o: Option<Response>,
        state: FleetReconcileState,
    ) -> (FleetReconcileState, Option<Request>) {
        reconcile_core(fleet, resp_o, state)
    }

    fn reconcile_done(state: &FleetReconcileState) -> bool {
        reconcile_done(state)
    }

    fn reconcile_error(state: &FleetReconcileState) -> Option<ReconcileError> {
        reconcile_error(state)
    }

    fn owners_to_requeue(unit: &Pod) -> Vec<ObjectRef<Fleet>> {
        owner_fleet_refs(unit)
    }
}

pub fn reconcile_init_state() -> FleetReconcileState {
    FleetReconcileState {
        reconcile_step: FleetReconcileStep::Init,
        phase: ReconcilePhase::Syncing,
        desired: Vec::new(),
        inventory: Inventory::default(),
        created: Vec::new(),
        is_edit: false,
    }
}

pub fn reconcile_done(state: &FleetReconcileState) -> bool {
    matches!(state.reconcile_step, FleetReconcileStep::Done)
}

pub fn reconcile_error(state: &FleetReconcileState) -> Option<ReconcileError> {
    match &state.reconcile_step {
        FleetReconcileStep::Error(err) => Some(err.clone()),
        _ => None,
    }
}

pub fn reconcile_core(
    fleet: &Fleet,
    resp_o: Option<Response>,
    state: FleetReconcileState,
) -> (FleetReconcileState, Option<Request>) {
    match state.reconcile_step.clone() {
        FleetReconcileStep::Init => {
            if let Err(err) = well_formed(fleet) {
                return (error_state(state, err), None);
            }
            let inventory = Inventory::from_fleet(fleet);
            if fleet.metadata.deletion_timestamp.is_some() {
                let state_prime = FleetReconcileState {
                    phase: ReconcilePhase::Deleting,
                    inventory,
                    ..state
                };
                return delete_tracked_unit_or_clear(fleet, state_prime, 0);
            }
            let desired = desired_unit_names(fleet_name(fleet), fleet.spec.count);
            let state_prime = FleetReconcileState {
                phase: ReconcilePhase::Syncing,
                desired,
                inventory,
                ..state
            };
            ensure_unit_or_shrink(fleet, state_prime, 0)
        }
        FleetReconcileStep::AfterGetUnit(index) => {
            let Some(resp) = get_response(&resp_o) else {
                return unexpected_response(state);
            };
            let unit_name = state.desired[index].clone();
            match &resp.res {
                Ok(obj) => {
                    // The unit is already present. If we created it but crashed before recording it,
                    // it still carries our owner reference and is recorded now.
                    let mut state_prime = state;
                    let owned = unmarshal::<Pod>(obj)
                        .map(|unit| is_controlled_by(&unit, fleet))
                        .unwrap_or(false);
                    if owned && state_prime.inventory.record_created(&unit_name) {
                        info!("Recording unit {} that was created but never tracked", unit_name);
                        state_prime.is_edit = true;
                    }
                    ensure_unit_or_shrink(fleet, state_prime, index + 1)
                }
                Err(APIError::ObjectNotFound) => {
                    let unit = make_unit(fleet, &unit_name);
                    let obj = match marshal(&unit) {
                        Ok(obj) => obj,
                        Err(err) => {
                            return (
                                error_state(state, ReconcileError::MarshalFailed(format!("{}: {}", unit_name, err))),
                                None,
                            )
                        }
                    };
                    info!("Create unit {}", unit_name);
                    let req = KubeAPIRequest::CreateRequest(KubeCreateRequest {
                        api_resource: unit_api_resource(),
                        namespace: fleet_namespace(fleet).to_string(),
                        obj,
                    });
                    let state_prime = FleetReconcileState {
                        reconcile_step: FleetReconcileStep::AfterCreateUnit(index),
                        ..state
                    };
                    (state_prime, Some(Request::KRequest(req)))
                }
                Err(err) => {
                    let err = ReconcileError::GetFailed {
                        key: unit_key(fleet, &unit_name),
                        error: err.clone(),
                    };
                    (error_state(state, err), None)
                }
            }
        }
        FleetReconcileStep::AfterCreateUnit(index) => {
            let Some(resp) = create_response(&resp_o) else {
                return unexpected_response(state);
            };
            let unit_name = state.desired[index].clone();
            match &resp.res {
                Ok(_) => {
                    let mut state_prime = state;
                    if state_prime.inventory.record_created(&unit_name) {
                        state_prime.is_edit = true;
                    }
                    state_prime.created.push(unit_name);
                    ensure_unit_or_shrink(fleet, state_prime, index + 1)
                }
                // Someone else created it between our get and create: it is already present.
                Err(APIError::ObjectAlreadyExists) => ensure_unit_or_shrink(fleet, state, index + 1),
                Err(err) => {
                    let err = ReconcileError::CreateFailed {
                        key: unit_key(fleet, &unit_name),
                        error: err.clone(),
                    };
                    (error_state(state, err), None)
                }
            }
        }
        FleetReconcileStep::AfterScaleDownEvent => {
            if !is_event_response(&resp_o) {
                return unexpected_response(state);
            }
            let surplus_start = state.desired.len();
            delete_surplus_unit_or_truncate(fleet, state, surplus_start)
        }
        FleetReconcileStep::AfterDeleteSurplusUnit(index) => {
            let Some(resp) = delete_response(&resp_o) else {
                return unexpected_response(state);
            };
            match &resp.res {
                Ok(()) | Err(APIError::ObjectNotFound) => {
                    delete_surplus_unit_or_truncate(fleet, state, index + 1)
                }
                Err(err) => {
                    let err = ReconcileError::DeleteFailed {
                        key: unit_key(fleet, &state.inventory.units()[index]),
                        error: err.clone(),
                    };
                    (error_state(state, err), None)
                }
            }
        }
        FleetReconcileStep::AfterScaleUpEvent => {
            if !is_event_response(&resp_o) {
                return unexpected_response(state);
            }
            updated_event(state)
        }
        FleetReconcileStep::AfterUpdatedEvent => {
            if !is_event_response(&resp_o) {
                return unexpected_response(state);
            }
            let updated = state.inventory.apply_to(fleet);
            update_fleet(fleet, &updated, state, FleetReconcileStep::AfterUpdateFleet)
        }
        FleetReconcileStep::AfterUpdateFleet => {
            let Some(resp) = update_response(&resp_o) else {
                return unexpected_response(state);
            };
            match &resp.res {
                Ok(obj) => {
                    // The status write must build on the object the first write returned,
                    // otherwise it would carry a stale resource version.
                    let mut updated = match unmarshal::<Fleet>(obj) {
                        Ok(updated) => updated,
                        Err(err) => {
                            let err = ReconcileError::MarshalFailed(format!("{}: {}", fleet_key(fleet), err));
                            return (error_state(state, err), None);
                        }
                    };
                    updated.status = Some(FleetStatus {
                        tracked_unit_count: state.inventory.len() as u32,
                    });
                    update_fleet_status(fleet, &updated, state)
                }
                Err(err) => (error_state(state, update_error(fleet, err)), None),
            }
        }
        FleetReconcileStep::AfterUpdateFleetStatus => {
            let Some(resp) = update_status_response(&resp_o) else {
                return unexpected_response(state);
            };
            match &resp.res {
                Ok(_) => {
                    info!("Fleet {} now tracks {} units", fleet_key(fleet), state.inventory.len());
                    done_state(state)
                }
                Err(err) => (error_state(state, update_error(fleet, err)), None),
            }
        }
        FleetReconcileStep::AfterDeleteTrackedUnit(index) => {
            let Some(resp) = delete_response(&resp_o) else {
                return unexpected_response(state);
            };
            match &resp.res {
                Ok(()) | Err(APIError::ObjectNotFound) => delete_tracked_unit_or_clear(fleet, state, index + 1),
                // Cleanup is best effort: one undeletable unit must not block the rest.
                Err(err) => {
                    let unit_name = state.inventory.units()[index].clone();
                    warn!("Failed to delete unit {} during cleanup: {}", unit_key(fleet, &unit_name), err);
                    let event = EventRequest::warning(
                        "CleanupFailed",
                        "Delete",
                        format!("Failed to delete unit {}: {}", unit_name, err),
                    );
                    let state_prime = FleetReconcileState {
                        reconcile_step: FleetReconcileStep::AfterCleanupFailedEvent(index),
                        ..state
                    };
                    (state_prime, Some(Request::EventRequest(event)))
                }
            }
        }
        FleetReconcileStep::AfterCleanupFailedEvent(index) => {
            if !is_event_response(&resp_o) {
                return unexpected_response(state);
            }
            delete_tracked_unit_or_clear(fleet, state, index + 1)
        }
        FleetReconcileStep::AfterClearInventory => {
            let Some(resp) = update_response(&resp_o) else {
                return unexpected_response(state);
            };
            match &resp.res {
                Ok(_) => {
                    info!("Released fleet {} for deletion", fleet_key(fleet));
                    done_state(state)
                }
                Err(err) => (error_state(state, update_error(fleet, err)), None),
            }
        }
        FleetReconcileStep::Done | FleetReconcileStep::Error(_) => (state, None),
    }
}

// Syncing: make sure the unit at `index` of the desired sequence exists;
// once every desired unit is present, shrink if the inventory is longer.
fn ensure_unit_or_shrink(
    fleet: &Fleet,
    state: FleetReconcileState,
    index: usize,
) -> (FleetReconcileState, Option<Request>) {
    if index < state.desired.len() {
        let req = KubeAPIRequest::GetRequest(KubeGetRequest {
            api_resource: unit_api_resource(),
            name: state.desired[index].clone(),
            namespace: fleet_namespace(fleet).to_string(),
        });
        let state_prime = FleetReconcileState {
            reconcile_step: FleetReconcileStep::AfterGetUnit(index),
            ..state
        };
        (state_prime, Some(Request::KRequest(req)))
    } else if state.inventory.len() > state.desired.len() {
        info!(
            "Scale down fleet {} from {} to {} units",
            fleet_key(fleet),
            state.inventory.len(),
            state.desired.len()
        );
        let event = EventRequest::normal(
            "ScaleDown",
            "Scale",
            format!(
                "Scaling down from {} to {} units, removing {}",
                state.inventory.len(),
                state.desired.len(),
                state.inventory.surplus(state.desired.len()).join(", ")
            ),
        );
        let state_prime = FleetReconcileState {
            reconcile_step: FleetReconcileStep::AfterScaleDownEvent,
            ..state
        };
        (state_prime, Some(Request::EventRequest(event)))
    } else {
        persist_or_finish(state)
    }
}

// Syncing: delete the inventory tail one unit at a time, in order,
// then cut the inventory back to exactly the desired sequence.
// The tail is chosen by position, not by name: an inventory recorded out of order
// loses whatever sits past the desired length, even a unit that is still desired.
fn delete_surplus_unit_or_truncate(
    fleet: &Fleet,
    state: FleetReconcileState,
    index: usize,
) -> (FleetReconcileState, Option<Request>) {
    if index < state.inventory.len() {
        let unit_name = state.inventory.units()[index].clone();
        info!("Delete surplus unit {}", unit_name);
        let req = delete_unit_request(fleet, unit_name);
        let state_prime = FleetReconcileState {
            reconcile_step: FleetReconcileStep::AfterDeleteSurplusUnit(index),
            ..state
        };
        (state_prime, Some(Request::KRequest(req)))
    } else {
        let mut state_prime = state;
        let desired = state_prime.desired.clone();
        state_prime.inventory.truncate_to(&desired);
        state_prime.is_edit = true;
        persist_or_finish(state_prime)
    }
}

// Syncing ends here: write only if something changed, so that an unchanged fleet
// does not trigger another reconcile through its own update event.
fn persist_or_finish(state: FleetReconcileState) -> (FleetReconcileState, Option<Request>) {
    if !state.is_edit {
        let state_prime = FleetReconcileState {
            phase: ReconcilePhase::Idle,
            ..state
        };
        return done_state(state_prime);
    }
    if state.created.is_empty() {
        return updated_event(state);
    }
    let event = EventRequest::normal(
        "ScaleUp",
        "Scale",
        format!("Created units {}", state.created.join(", ")),
    );
    let state_prime = FleetReconcileState {
        reconcile_step: FleetReconcileStep::AfterScaleUpEvent,
        ..state
    };
    (state_prime, Some(Request::EventRequest(event)))
}

fn updated_event(state: FleetReconcileState) -> (FleetReconcileState, Option<Request>) {
    let event = EventRequest::normal(
        "Updated",
        "Update",
        format!("Tracking {} units", state.inventory.len()),
    );
    let state_prime = FleetReconcileState {
        reconcile_step: FleetReconcileStep::AfterUpdatedEvent,
        ..state
    };
    (state_prime, Some(Request::EventRequest(event)))
}

// Deleting: delete every tracked unit, tolerating failures,
// then clear the inventory which also releases the finalizer.
fn delete_tracked_unit_or_clear(
    fleet: &Fleet,
    state: FleetReconcileState,
    index: usize,
) -> (FleetReconcileState, Option<Request>) {
    if index < state.inventory.len() {
        let unit_name = state.inventory.units()[index].clone();
        info!("Delete tracked unit {}", unit_name);
        let req = delete_unit_request(fleet, unit_name);
        let state_prime = FleetReconcileState {
            reconcile_step: FleetReconcileStep::AfterDeleteTrackedUnit(index),
            ..state
        };
        (state_prime, Some(Request::KRequest(req)))
    } else {
        let cleared = Inventory::default().apply_to(fleet);
        let state_prime = FleetReconcileState {
            inventory: Inventory::default(),
            ..state
        };
        update_fleet(fleet, &cleared, state_prime, FleetReconcileStep::AfterClearInventory)
    }
}

fn update_fleet(
    fleet: &Fleet,
    updated: &Fleet,
    state: FleetReconcileState,
    next_step: FleetReconcileStep,
) -> (FleetReconcileState, Option<Request>) {
    let obj = match marshal(updated) {
        Ok(obj) => obj,
        Err(err) => {
            let err = ReconcileError::MarshalFailed(format!("{}: {}", fleet_key(fleet), err));
            return (error_state(state, err), None);
        }
    };
    let req = KubeAPIRequest::UpdateRequest(KubeUpdateRequest {
        api_resource: fleet_api_resource(),
        name: fleet_name(fleet).to_string(),
        namespace: fleet_namespace(fleet).to_string(),
        obj,
    });
    let state_prime = FleetReconcileState {
        reconcile_step: next_step,
        ..state
    };
    (state_prime, Some(Request::KRequest(req)))
}

fn update_fleet_status(
    fleet: &Fleet,
    updated: &Fleet,
    state: FleetReconcileState,
) -> (FleetReconcileState, Option<Request>) {
    let obj = match marshal(updated) {
        Ok(obj) => obj,
        Err(err) => {
            let err = ReconcileError::MarshalFailed(format!("{}: {}", fleet_key(fleet), err));
            return (error_state(state, err), None);
        }
    };
    let req = KubeAPIRequest::UpdateStatusRequest(KubeUpdateStatusRequest {
        api_resource: fleet_api_resource(),
        name: fleet_name(fleet).to_string(),
        namespace: fleet_namespace(fleet).to_string(),
        obj,
    });
    let state_prime = FleetReconcileState {
        reconcile_step: FleetReconcileStep::AfterUpdateFleetStatus,
        ..state
    };
    (state_prime, Some(Request::KRequest(req)))
}

fn delete_unit_request(fleet: &Fleet, unit_name: String) -> KubeAPIRequest {
    KubeAPIRequest::DeleteRequest(KubeDeleteRequest {
        api_resource: unit_api_resource(),
        name: unit_name,
        namespace: fleet_namespace(fleet).to_string(),
    })
}

fn update_error(fleet: &Fleet, err: &APIError) -> ReconcileError {
    if err.is_conflict() {
        ReconcileError::StoreConflict { key: fleet_key(fleet) }
    } else {
        ReconcileError::UpdateFailed {
            key: fleet_key(fleet),
            error: err.clone(),
        }
    }
}

fn done_state(state: FleetReconcileState) -> (FleetReconcileState, Option<Request>) {
    let state_prime = FleetReconcileState {
        reconcile_step: FleetReconcileStep::Done,
        ..state
    };
    (state_prime, None)
}

pub fn error_state(state: FleetReconcileState, err: ReconcileError) -> FleetReconcileState {
    FleetReconcileState {
        reconcile_step: FleetReconcileStep::Error(err),
        ..state
    }
}

fn unexpected_response(state: FleetReconcileState) -> (FleetReconcileState, Option<Request>) {
    let err = ReconcileError::UnexpectedResponse(format!("{:?}", state.reconcile_step));
    (error_state(state, err), None)
}

// The fleet is fetched from the API server, so these are always set;
// units cannot be owned by a fleet without a uid.
fn well_formed(fleet: &Fleet) -> Result<(), ReconcileError> {
    let missing = if fleet.metadata.name.is_none() {
        ".metadata.name"
    } else if fleet.metadata.namespace.is_none() {
        ".metadata.namespace"
    } else if fleet.metadata.uid.is_none() {
        ".metadata.uid"
    } else {
        return Ok(());
    };
    Err(ReconcileError::MalformedResource(format!("fleet misses {}", missing)))
}

fn fleet_name(fleet: &Fleet) -> &str {
    fleet.metadata.name.as_deref().unwrap_or_default()
}

fn fleet_namespace(fleet: &Fleet) -> &str {
    fleet.metadata.namespace.as_deref().unwrap_or_default()
}

fn fleet_key(fleet: &Fleet) -> String {
    format!("Fleet/{}/{}", fleet_namespace(fleet), fleet_name(fleet))
}

fn unit_key(fleet: &Fleet, unit_name: &str) -> String {
    format!("Pod/{}/{}", fleet_namespace(fleet), unit_name)
}

fn unit_api_resource() -> ApiResource {
    ApiResource::erase::<Pod>(&())
}

fn fleet_api_resource() -> ApiResource {
    ApiResource::erase::<Fleet>(&())
}
