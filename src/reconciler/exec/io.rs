// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::kubernetes_api_objects::api_method::*;

// Request is what reconcile_core asks the shim layer to do next:
// either talk to the Kubernetes API or record an event on the custom resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    KRequest(KubeAPIRequest),
    EventRequest(EventRequest),
}

// Response is what the shim layer feeds back to the next reconcile_core invocation.
// Events are advisory, so publishing one always yields EventResponse even if it failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    KResponse(KubeAPIResponse),
    EventResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

// EventRequest describes a human-readable event attached to the custom resource under reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest {
    pub type_: EventType,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl EventRequest {
    pub fn normal(reason: &str, action: &str, note: String) -> EventRequest {
        EventRequest {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: String) -> EventRequest {
        EventRequest {
            type_: EventType::Warning,
            ..EventRequest::normal(reason, action, note)
        }
    }
}

impl Response {
    pub fn as_k_response(&self) -> Option<&KubeAPIResponse> {
        match self {
            Response::KResponse(resp) => Some(resp),
            Response::EventResponse => None,
        }
    }
}

// The helpers below pull a specific response kind out of the optional response that
// reconcile_core receives. They return None when the response is missing or of another kind.

pub fn get_response(resp_o: &Option<Response>) -> Option<&KubeGetResponse> {
    match resp_o.as_ref().and_then(Response::as_k_response) {
        Some(KubeAPIResponse::GetResponse(resp)) => Some(resp),
        _ => None,
    }
}

pub fn create_response(resp_o: &Option<Response>) -> Option<&KubeCreateResponse> {
    match resp_o.as_ref().and_then(Response::as_k_response) {
        Some(KubeAPIResponse::CreateResponse(resp)) => Some(resp),
        _ => None,
    }
}

pub fn delete_response(resp_o: &Option<Response>) -> Option<&KubeDeleteResponse> {
    match resp_o.as_ref().and_then(Response::as_k_response) {
        Some(KubeAPIResponse::DeleteResponse(resp)) => Some(resp),
        _ => None,
    }
}

pub fn update_response(resp_o: &Option<Response>) -> Option<&KubeUpdateResponse> {
    match resp_o.as_ref().and_then(Response::as_k_response) {
        Some(KubeAPIResponse::UpdateResponse(resp)) => Some(resp),
        _ => None,
    }
}

pub fn update_status_response(resp_o: &Option<Response>) -> Option<&KubeUpdateStatusResponse> {
    match resp_o.as_ref().and_then(Response::as_k_response) {
        Some(KubeAPIResponse::UpdateStatusResponse(resp)) => Some(resp),
        _ => None,
    }
}

pub fn is_event_response(resp_o: &Option<Response>) -> bool {
    matches!(resp_o, Some(Response::EventResponse))
}
