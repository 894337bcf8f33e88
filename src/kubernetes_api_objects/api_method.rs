// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::kubernetes_api_objects::error::APIError;
use kube::api::{ApiResource, DynamicObject};

// KubeAPIRequest represents API requests issued by reconcile_core.
//
// kube-rs uses a generic type kube::api::Api as an api handle to send
// requests to the Kubernetes API.
// So KubeAPIRequest wraps around the variables used to instantiate kube::api::Api
// (api_resource and namespace) and to call its methods.
#[derive(Debug, Clone, PartialEq)]
pub enum KubeAPIRequest {
    GetRequest(KubeGetRequest),
    CreateRequest(KubeCreateRequest),
    DeleteRequest(KubeDeleteRequest),
    UpdateRequest(KubeUpdateRequest),
    UpdateStatusRequest(KubeUpdateStatusRequest),
}

impl KubeAPIRequest {
    pub fn key(&self) -> String {
        match self {
            KubeAPIRequest::GetRequest(req) => req.key(),
            KubeAPIRequest::CreateRequest(req) => req.key(),
            KubeAPIRequest::DeleteRequest(req) => req.key(),
            KubeAPIRequest::UpdateRequest(req) => req.key(),
            KubeAPIRequest::UpdateStatusRequest(req) => req.key(),
        }
    }

    // Everything except Get changes the stored state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, KubeAPIRequest::GetRequest(_))
    }
}

fn object_key(api_resource: &ApiResource, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", api_resource.kind, namespace, name)
}

// KubeGetRequest has the name as the parameter of Api.get(), and namespace to instantiate an Api.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeGetRequest {
    pub api_resource: ApiResource,
    pub name: String,
    pub namespace: String,
}

impl KubeGetRequest {
    pub fn key(&self) -> String {
        object_key(&self.api_resource, &self.namespace, &self.name)
    }
}

// KubeCreateRequest has the obj as the parameter of Api.create().
#[derive(Debug, Clone, PartialEq)]
pub struct KubeCreateRequest {
    pub api_resource: ApiResource,
    pub namespace: String,
    pub obj: DynamicObject,
}

impl KubeCreateRequest {
    pub fn key(&self) -> String {
        let name = self.obj.metadata.name.as_deref().unwrap_or_default();
        object_key(&self.api_resource, &self.namespace, name)
    }
}

// KubeDeleteRequest has the name as the parameter of Api.delete().
#[derive(Debug, Clone, PartialEq)]
pub struct KubeDeleteRequest {
    pub api_resource: ApiResource,
    pub name: String,
    pub namespace: String,
}

impl KubeDeleteRequest {
    pub fn key(&self) -> String {
        object_key(&self.api_resource, &self.namespace, &self.name)
    }
}

// KubeUpdateRequest has the obj as the parameter of Api.replace().
// The stored object is only replaced if obj carries its current resource version.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeUpdateRequest {
    pub api_resource: ApiResource,
    pub name: String,
    pub namespace: String,
    pub obj: DynamicObject,
}

impl KubeUpdateRequest {
    pub fn key(&self) -> String {
        object_key(&self.api_resource, &self.namespace, &self.name)
    }
}

// KubeUpdateStatusRequest has the obj as the parameter of Api.replace_status().
#[derive(Debug, Clone, PartialEq)]
pub struct KubeUpdateStatusRequest {
    pub api_resource: ApiResource,
    pub name: String,
    pub namespace: String,
    pub obj: DynamicObject,
}

impl KubeUpdateStatusRequest {
    pub fn key(&self) -> String {
        object_key(&self.api_resource, &self.namespace, &self.name)
    }
}

// KubeAPIResponse wraps around the results returned by the methods of kube::api::Api.
#[derive(Debug, Clone, PartialEq)]
pub enum KubeAPIResponse {
    GetResponse(KubeGetResponse),
    CreateResponse(KubeCreateResponse),
    DeleteResponse(KubeDeleteResponse),
    UpdateResponse(KubeUpdateResponse),
    UpdateStatusResponse(KubeUpdateStatusResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KubeGetResponse {
    pub res: Result<DynamicObject, APIError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KubeCreateResponse {
    pub res: Result<DynamicObject, APIError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KubeDeleteResponse {
    pub res: Result<(), APIError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KubeUpdateResponse {
    pub res: Result<DynamicObject, APIError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KubeUpdateStatusResponse {
    pub res: Result<DynamicObject, APIError>,
}
