// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::kubernetes_api_objects::api_method::*;
use crate::kubernetes_api_objects::error::{kube_error_to_api_error, APIError};
use crate::reconciler::exec::io::{EventRequest, EventType};
use crate::shim_layer::fault_injection::crash_or_continue;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams},
    runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter},
    Client,
};
use tracing::{info, warn};

/// ApiServerExecutor is where the requests issued by reconcile_core end up.
///
/// [`KubeClientExecutor`] sends them to a real Kubernetes API server through kube-rs;
/// the executable model in `crate::executable_model` serves them from memory.
#[async_trait]
pub trait ApiServerExecutor: Send + Sync {
    async fn get(&self, api_resource: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject, APIError>;

    async fn create(&self, api_resource: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, APIError>;

    async fn delete(&self, api_resource: &ApiResource, namespace: &str, name: &str) -> Result<(), APIError>;

    // Replaces the whole object except its status; rejected with Conflict if obj carries a stale resource version.
    async fn update(
        &self,
        api_resource: &ApiResource,
        namespace: &str,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, APIError>;

    // Replaces only the status of the object.
    async fn update_status(
        &self,
        api_resource: &ApiResource,
        namespace: &str,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, APIError>;

    async fn publish_event(&self, regarding: ObjectReference, event: &EventRequest) -> Result<(), APIError>;

    // Called after every mutating request when fault injection is on.
    // Panics when it is time to crash.
    async fn crash_or_continue(&self, log_header: &str) -> Result<(), String>;
}

// handle_request performs one request issued by reconcile_core and wraps the result
// into the response fed back to the next reconcile_core invocation.
pub async fn handle_request<E>(executor: &E, req: KubeAPIRequest, log_header: &str) -> KubeAPIResponse
where
    E: ApiServerExecutor + ?Sized,
{
    let key = req.key();
    match req {
        KubeAPIRequest::GetRequest(get_req) => {
            let res = executor
                .get(&get_req.api_resource, &get_req.namespace, &get_req.name)
                .await;
            log_outcome(log_header, "Get", &key, &res);
            KubeAPIResponse::GetResponse(KubeGetResponse { res })
        }
        KubeAPIRequest::CreateRequest(create_req) => {
            let res = executor
                .create(&create_req.api_resource, &create_req.namespace, &create_req.obj)
                .await;
            log_outcome(log_header, "Create", &key, &res);
            KubeAPIResponse::CreateResponse(KubeCreateResponse { res })
        }
        KubeAPIRequest::DeleteRequest(delete_req) => {
            let res = executor
                .delete(&delete_req.api_resource, &delete_req.namespace, &delete_req.name)
                .await;
            log_outcome(log_header, "Delete", &key, &res);
            KubeAPIResponse::DeleteResponse(KubeDeleteResponse { res })
        }
        KubeAPIRequest::UpdateRequest(update_req) => {
            let res = executor
                .update(
                    &update_req.api_resource,
                    &update_req.namespace,
                    &update_req.name,
                    &update_req.obj,
                )
                .await;
            log_outcome(log_header, "Update", &key, &res);
            KubeAPIResponse::UpdateResponse(KubeUpdateResponse { res })
        }
        KubeAPIRequest::UpdateStatusRequest(update_status_req) => {
            let res = executor
                .update_status(
                    &update_status_req.api_resource,
                    &update_status_req.namespace,
                    &update_status_req.name,
                    &update_status_req.obj,
                )
                .await;
            log_outcome(log_header, "UpdateStatus", &key, &res);
            KubeAPIResponse::UpdateStatusResponse(KubeUpdateStatusResponse { res })
        }
    }
}

fn log_outcome<T>(log_header: &str, verb: &str, key: &str, res: &Result<T, APIError>) {
    match res {
        Ok(_) => info!("{} {} {} done", log_header, verb, key),
        Err(err) => warn!("{} {} {} failed with error: {}", log_header, verb, key, err),
    }
}

// KubeClientExecutor talks to the Kubernetes API through kube::api::Api<DynamicObject>,
// instantiated per request from the api_resource and namespace the request carries.
pub struct KubeClientExecutor {
    client: Client,
    reporter: Reporter,
}

impl KubeClientExecutor {
    pub fn new(client: Client, reporter: &str) -> KubeClientExecutor {
        KubeClientExecutor {
            client,
            reporter: Reporter::from(reporter),
        }
    }

    fn api(&self, api_resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, api_resource)
    }
}

#[async_trait]
impl ApiServerExecutor for KubeClientExecutor {
    async fn get(&self, api_resource: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject, APIError> {
        self.api(api_resource, namespace)
            .get(name)
            .await
            .map_err(|err| kube_error_to_api_error(&err))
    }

    async fn create(&self, api_resource: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, APIError> {
        self.api(api_resource, namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|err| kube_error_to_api_error(&err))
    }

    async fn delete(&self, api_resource: &ApiResource, namespace: &str, name: &str) -> Result<(), APIError> {
        self.api(api_resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| kube_error_to_api_error(&err))
    }

    async fn update(
        &self,
        api_resource: &ApiResource,
        namespace: &str,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, APIError> {
        self.api(api_resource, namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|err| kube_error_to_api_error(&err))
    }

    async fn update_status(
        &self,
        api_resource: &ApiResource,
        namespace: &str,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, APIError> {
        let data = serde_json::to_vec(obj).map_err(|err| APIError::Other(err.to_string()))?;
        self.api(api_resource, namespace)
            .replace_status(name, &PostParams::default(), data)
            .await
            .map_err(|err| kube_error_to_api_error(&err))
    }

    async fn publish_event(&self, regarding: ObjectReference, event: &EventRequest) -> Result<(), APIError> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding);
        let type_ = match event.type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };
        recorder
            .publish(Event {
                type_,
                reason: event.reason.clone(),
                note: Some(event.note.clone()),
                action: event.action.clone(),
                secondary: None,
            })
            .await
            .map_err(|err| kube_error_to_api_error(&err))
    }

    async fn crash_or_continue(&self, log_header: &str) -> Result<(), String> {
        crash_or_continue(&self.client, log_header).await
    }
}
