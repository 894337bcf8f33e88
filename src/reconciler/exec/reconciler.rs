// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::reconciler::exec::io::*;
use crate::ReconcileError;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;

// Reconciler is the interface between a controller's logic and the shim layer.
//
// reconcile_core is a step function: given the custom resource, the response to the
// previous request (if any) and the local state, it returns the next local state and
// the next request to issue (if any). The shim layer keeps calling it until
// reconcile_done or reconcile_error reports that the reconcile has ended.
pub trait Reconciler {
    // The custom resource type this reconciler manages.
    type K: Resource<DynamicType = ()>;
    // The local state carried across reconcile_core invocations within one reconcile.
    type S;

    fn reconcile_init_state() -> Self::S;

    fn reconcile_core(cr: &Self::K, resp_o: Option<Response>, state: Self::S) -> (Self::S, Option<Request>);

    fn reconcile_done(state: &Self::S) -> bool;

    // Some(err) when the reconcile ended with an error that should be retried.
    fn reconcile_error(state: &Self::S) -> Option<ReconcileError>;

    // The custom resources to reconcile again after one of their units was deleted.
    fn owners_to_requeue(_unit: &Pod) -> Vec<ObjectRef<Self::K>> {
        Vec::new()
    }
}
