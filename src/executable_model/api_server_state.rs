// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use kube::api::DynamicObject;
use std::collections::BTreeMap;

// Objects are keyed by "Kind/namespace/name", the same key KubeAPIRequest::key() produces.
pub type ObjectKey = String;

pub fn object_key(kind: &str, namespace: &str, name: &str) -> ObjectKey {
    format!("{}/{}/{}", kind, namespace, name)
}

// ApiServerState is the "state" of the executable API server model:
// the stored objects plus the counters used to stamp uids and resource versions.
#[derive(Debug, Clone, Default)]
pub struct ApiServerState {
    pub resources: BTreeMap<ObjectKey, DynamicObject>,
    pub uid_counter: i64,
    pub resource_version_counter: i64,
}
