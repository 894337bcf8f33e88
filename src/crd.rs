// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// A Fleet declares how many worker units should run and which port each of them exposes.
// The controller owns everything else about the units.
#[derive(CustomResource, Default, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "anvil.dev", version = "v1", kind = "Fleet")]
#[kube(shortname = "fleet", namespaced)]
#[kube(status = "FleetStatus")]
#[kube(derive = "PartialEq")]
#[kube(printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.count"}"#)]
#[kube(printcolumn = r#"{"name":"Tracked", "type":"integer", "jsonPath":".status.trackedUnitCount"}"#)]
pub struct FleetSpec {
    pub count: u32,
    #[serde(rename = "unitPort")]
    pub unit_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FleetStatus {
    #[serde(rename = "trackedUnitCount")]
    pub tracked_unit_count: u32,
}

impl Default for Fleet {
    fn default() -> Self {
        Self {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta::default(),
            spec: FleetSpec::default(),
            status: None,
        }
    }
}
