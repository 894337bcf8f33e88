// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::crd::Fleet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;

// The owner kinds whose units trigger a resync when they disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Fleet,
}

impl OwnerKind {
    // Resolved through the kube::Resource metadata of each owner type
    // so a renamed group or kind cannot silently stop matching.
    pub fn of(owner_ref: &OwnerReference) -> Option<OwnerKind> {
        let registered = [(Fleet::api_version(&()), Fleet::kind(&()), OwnerKind::Fleet)];
        registered
            .into_iter()
            .find(|(api_version, kind, _)| owner_ref.api_version == *api_version && owner_ref.kind == *kind)
            .map(|(_, _, owner_kind)| owner_kind)
    }
}

/// The fleets to reconcile again because `unit` was deleted.
/// Units live in the namespace of their owner, so the key takes the unit's namespace.
pub fn owner_fleet_refs(unit: &Pod) -> Vec<ObjectRef<Fleet>> {
    let Some(namespace) = unit.metadata.namespace.as_deref() else {
        return Vec::new();
    };
    unit.metadata
        .owner_references
        .iter()
        .flatten()
        .filter(|owner_ref| OwnerKind::of(owner_ref) == Some(OwnerKind::Fleet))
        .map(|owner_ref| ObjectRef::new(&owner_ref.name).within(namespace))
        .collect()
}
