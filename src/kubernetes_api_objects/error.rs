// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use kube_core::ErrorResponse;
use thiserror::Error;

// APIError is the store-level failure carried back to the reconciler inside a response.
// It is deliberately detached from kube::Error so that responses stay cloneable and
// the in-memory API server model can produce the same values as a real cluster.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum APIError {
    #[error("ObjectNotFound")]
    ObjectNotFound,
    #[error("ObjectAlreadyExists")]
    ObjectAlreadyExists,
    #[error("BadRequest")]
    BadRequest,
    #[error("Conflict")]
    Conflict,
    #[error("Invalid")]
    Invalid,
    #[error("Forbidden")]
    Forbidden,
    #[error("InternalError")]
    InternalError,
    #[error("Timeout")]
    Timeout,
    #[error("ServerTimeout")]
    ServerTimeout,
    #[error("Other: {0}")]
    Other(String),
}

impl APIError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, APIError::Conflict)
    }
}

// kube_error_to_api_error translates the error returned by kube-rs APIs
// to the form that can be processed by reconcile_core.
pub fn kube_error_to_api_error(error: &kube_client::Error) -> APIError {
    match error {
        kube_client::Error::Api(error_resp) => api_error_from_response(error_resp),
        other => APIError::Other(other.to_string()),
    }
}

fn api_error_from_response(error_resp: &ErrorResponse) -> APIError {
    match error_resp.reason.as_str() {
        "NotFound" => APIError::ObjectNotFound,
        "AlreadyExists" => APIError::ObjectAlreadyExists,
        "BadRequest" => APIError::BadRequest,
        "Conflict" => APIError::Conflict,
        "Invalid" => APIError::Invalid,
        "Forbidden" => APIError::Forbidden,
        "InternalError" => APIError::InternalError,
        "Timeout" => APIError::Timeout,
        "ServerTimeout" => APIError::ServerTimeout,
        _ => APIError::Other(error_resp.message.clone()),
    }
}
