// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::crd::Fleet;
use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;

pub const UNIT_IMAGE: &str = "redis:5-alpine";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "fleet-controller";
pub const FLEET_LABEL: &str = "fleet.anvil.dev/fleet";

/// The units a fleet should have, in order: `<name>-0` up to `<name>-(count-1)`.
pub fn desired_unit_names(fleet_name: &str, count: u32) -> Vec<String> {
    (0..count).map(|index| format!("{}-{}", fleet_name, index)).collect()
}

// The fleet is the controller owner of every unit it creates, so the garbage collector
// removes the units if the fleet is ever deleted without going through the cascade.
pub fn make_owner_references(fleet: &Fleet) -> Vec<OwnerReference> {
    fleet
        .controller_owner_ref(&())
        .map(|owner_ref| OwnerReference {
            block_owner_deletion: Some(true),
            ..owner_ref
        })
        .into_iter()
        .collect()
}

pub fn make_unit(fleet: &Fleet, unit_name: &str) -> Pod {
    let fleet_name = fleet.metadata.name.clone().unwrap_or_default();
    Pod {
        metadata: ObjectMeta {
            name: Some(unit_name.to_string()),
            namespace: fleet.metadata.namespace.clone(),
            owner_references: Some(make_owner_references(fleet)),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
                (FLEET_LABEL.to_string(), fleet_name),
            ])),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: unit_name.to_string(),
                image: Some(UNIT_IMAGE.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: i32::from(fleet.spec.unit_port),
                    ..ContainerPort::default()
                }]),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// Whether the unit's controller owner reference points at this very fleet (same uid).
pub fn is_controlled_by(unit: &Pod, fleet: &Fleet) -> bool {
    let Some(uid) = fleet.metadata.uid.as_ref() else {
        return false;
    };
    unit.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner_ref| owner_ref.controller == Some(true) && &owner_ref.uid == uid)
}
