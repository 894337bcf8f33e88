// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod config;
pub mod crd;
pub mod executable_model;
pub mod fleet_controller;
pub mod kubernetes_api_objects;
pub mod reconciler;
pub mod shim_layer;
#[cfg(test)]
pub mod unit_tests;

use kubernetes_api_objects::error::APIError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get custom resource {0}: {1}")]
    CustomResourceGetFailed(String, #[source] APIError),
    #[error("ReconcileCoreError: {0}")]
    ReconcileCoreError(#[from] ReconcileError),
    #[error("ShimLayerError: {0}")]
    ShimLayerError(String),
}

// ReconcileError is how reconcile_core reports why a reconcile was aborted.
// Every variant is retryable; the next reconcile re-derives everything from scratch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Failed to get {key}: {error}")]
    GetFailed { key: String, error: APIError },
    #[error("Failed to create {key}: {error}")]
    CreateFailed { key: String, error: APIError },
    #[error("Failed to delete {key}: {error}")]
    DeleteFailed { key: String, error: APIError },
    #[error("Stale update of {key} was rejected")]
    StoreConflict { key: String },
    #[error("Failed to update {key}: {error}")]
    UpdateFailed { key: String, error: APIError },
    #[error("Failed to marshal {0}")]
    MarshalFailed(String),
    #[error("Unexpected response at step {0}")]
    UnexpectedResponse(String),
    #[error("Malformed resource: {0}")]
    MalformedResource(String),
}
