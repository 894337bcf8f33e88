// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use kube::api::DynamicObject;
use serde::{de::DeserializeOwned, Serialize};

// Requests and responses carry DynamicObject so that one shim can serve every object kind.
// marshal and unmarshal convert between DynamicObject and the typed objects the reconciler works with.

pub fn marshal<K: Serialize>(obj: &K) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

pub fn unmarshal<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}
