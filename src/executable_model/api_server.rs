// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::executable_model::api_server_state::{object_key, ApiServerState, ObjectKey};
use crate::kubernetes_api_objects::error::APIError;
use crate::kubernetes_api_objects::marshal::{marshal, unmarshal};
use crate::reconciler::exec::io::EventRequest;
use crate::shim_layer::executor::ApiServerExecutor;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::api::{ApiResource, DynamicObject};
use kube::Resource;
use kube_core::TypeMeta;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

// The request handlers below mirror how the Kubernetes API server processes
// get, create, delete, update and update_status, restricted to the checks a controller can observe:
// admission (names, namespaces, existence, resource versions), finalizer-gated deletion
// and owner-reference based garbage collection.

pub fn handle_get_request(
    api_resource: &ApiResource,
    namespace: &str,
    name: &str,
    s: &ApiServerState,
) -> Result<DynamicObject, APIError> {
    s.resources
        .get(&object_key(&api_resource.kind, namespace, name))
        .cloned()
        .ok_or(APIError::ObjectNotFound)
}

fn create_request_admission_check(
    api_resource: &ApiResource,
    namespace: &str,
    obj: &DynamicObject,
    s: &ApiServerState,
) -> Result<ObjectKey, APIError> {
    let name = obj.metadata.name.as_deref().ok_or(APIError::Invalid)?;
    if obj.metadata.namespace.as_deref().is_some_and(|ns| ns != namespace) {
        return Err(APIError::BadRequest);
    }
    let key = object_key(&api_resource.kind, namespace, name);
    if s.resources.contains_key(&key) {
        return Err(APIError::ObjectAlreadyExists);
    }
    Ok(key)
}

// At most one owner reference may be the controller.
fn metadata_validity_check(obj: &DynamicObject) -> Result<(), APIError> {
    let controllers = obj
        .metadata
        .owner_references
        .iter()
        .flatten()
        .filter(|owner_ref| owner_ref.controller == Some(true))
        .count();
    if controllers > 1 {
        Err(APIError::Invalid)
    } else {
        Ok(())
    }
}

pub fn handle_create_request(
    api_resource: &ApiResource,
    namespace: &str,
    obj: &DynamicObject,
    s: &mut ApiServerState,
) -> Result<DynamicObject, APIError> {
    let key = create_request_admission_check(api_resource, namespace, obj, s)?;
    let mut created_obj = obj.clone();
    created_obj.types = Some(TypeMeta {
        api_version: api_resource.api_version.clone(),
        kind: api_resource.kind.clone(),
    });
    created_obj.metadata.namespace = Some(namespace.to_string());
    created_obj.metadata.resource_version = Some(s.resource_version_counter.to_string());
    created_obj.metadata.uid = Some(format!("uid-{}", s.uid_counter));
    created_obj.metadata.deletion_timestamp = None;
    metadata_validity_check(&created_obj)?;

    s.resources.insert(key, created_obj.clone());
    s.uid_counter += 1;
    s.resource_version_counter += 1;
    Ok(created_obj)
}

// An object with finalizers is only stamped with a deletion timestamp;
// it is removed once an update leaves it without finalizers.
pub fn handle_delete_request(
    api_resource: &ApiResource,
    namespace: &str,
    name: &str,
    s: &mut ApiServerState,
) -> Result<(), APIError> {
    let key = object_key(&api_resource.kind, namespace, name);
    let Some(obj) = s.resources.get_mut(&key) else {
        return Err(APIError::ObjectNotFound);
    };
    if has_finalizers(obj) {
        if obj.metadata.deletion_timestamp.is_none() {
            obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
            obj.metadata.resource_version = Some(s.resource_version_counter.to_string());
            s.resource_version_counter += 1;
        }
    } else {
        remove_and_collect_garbage(&key, s);
        s.resource_version_counter += 1;
    }
    Ok(())
}

// Core kinds accept updates without a resource version; custom resources do not.
fn allow_unconditional_update(api_resource: &ApiResource) -> bool {
    api_resource.group.is_empty()
}

fn update_request_admission_check(
    api_resource: &ApiResource,
    namespace: &str,
    name: &str,
    obj: &DynamicObject,
    s: &ApiServerState,
) -> Result<(ObjectKey, DynamicObject), APIError> {
    match obj.metadata.name.as_deref() {
        Some(obj_name) if obj_name == name => {}
        _ => return Err(APIError::BadRequest),
    }
    if obj.metadata.namespace.as_deref().is_some_and(|ns| ns != namespace) {
        return Err(APIError::BadRequest);
    }
    let key = object_key(&api_resource.kind, namespace, name);
    let old_obj = s.resources.get(&key).ok_or(APIError::ObjectNotFound)?;
    match obj.metadata.resource_version.as_ref() {
        None if !allow_unconditional_update(api_resource) => return Err(APIError::Invalid),
        Some(rv) if Some(rv) != old_obj.metadata.resource_version.as_ref() => return Err(APIError::Conflict),
        _ => {}
    }
    if obj.metadata.uid.is_some() && obj.metadata.uid != old_obj.metadata.uid {
        return Err(APIError::InternalError);
    }
    Ok((key, old_obj.clone()))
}

// Once deletion has started, finalizers can only be removed, never added.
fn metadata_transition_validity_check(obj: &DynamicObject, old_obj: &DynamicObject) -> Result<(), APIError> {
    if old_obj.metadata.deletion_timestamp.is_none() {
        return Ok(());
    }
    let old_finalizers = old_obj.metadata.finalizers.clone().unwrap_or_default();
    let added = obj
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|finalizer| !old_finalizers.contains(finalizer));
    if added {
        Err(APIError::Forbidden)
    } else {
        Ok(())
    }
}

fn updated_object(namespace: &str, obj: &DynamicObject, old_obj: &DynamicObject) -> DynamicObject {
    let mut updated_obj = obj.clone();
    updated_obj.types = old_obj.types.clone();
    updated_obj.metadata.namespace = Some(namespace.to_string());
    updated_obj.metadata.resource_version = old_obj.metadata.resource_version.clone();
    updated_obj.metadata.uid = old_obj.metadata.uid.clone();
    updated_obj.metadata.deletion_timestamp = old_obj.metadata.deletion_timestamp.clone();
    set_status_from(&mut updated_obj, old_obj);
    updated_obj
}

pub fn handle_update_request(
    api_resource: &ApiResource,
    namespace: &str,
    name: &str,
    obj: &DynamicObject,
    s: &mut ApiServerState,
) -> Result<DynamicObject, APIError> {
    let (key, old_obj) = update_request_admission_check(api_resource, namespace, name, obj, s)?;
    let mut updated_obj = updated_object(namespace, obj, &old_obj);
    if updated_obj == old_obj {
        return Ok(old_obj);
    }
    updated_obj.metadata.resource_version = Some(s.resource_version_counter.to_string());
    metadata_validity_check(&updated_obj)?;
    metadata_transition_validity_check(&updated_obj, &old_obj)?;

    if updated_obj.metadata.deletion_timestamp.is_some() && !has_finalizers(&updated_obj) {
        remove_and_collect_garbage(&key, s);
    } else {
        s.resources.insert(key, updated_obj.clone());
    }
    s.resource_version_counter += 1;
    Ok(updated_obj)
}

pub fn handle_update_status_request(
    api_resource: &ApiResource,
    namespace: &str,
    name: &str,
    obj: &DynamicObject,
    s: &mut ApiServerState,
) -> Result<DynamicObject, APIError> {
    let (key, old_obj) = update_request_admission_check(api_resource, namespace, name, obj, s)?;
    let mut status_updated_obj = old_obj.clone();
    set_status_from(&mut status_updated_obj, obj);
    if status_updated_obj == old_obj {
        return Ok(old_obj);
    }
    status_updated_obj.metadata.resource_version = Some(s.resource_version_counter.to_string());
    s.resources.insert(key, status_updated_obj.clone());
    s.resource_version_counter += 1;
    Ok(status_updated_obj)
}

fn has_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata.finalizers.as_ref().is_some_and(|finalizers| !finalizers.is_empty())
}

fn set_status_from(obj: &mut DynamicObject, source: &DynamicObject) {
    let status = source.data.get("status").cloned();
    if let Some(data) = obj.data.as_object_mut() {
        match status {
            Some(status) => data.insert("status".to_string(), status),
            None => data.remove("status"),
        };
    }
}

// The real garbage collector removes dependents in the background once their owner is gone;
// the model removes them right away.
fn remove_and_collect_garbage(key: &ObjectKey, s: &mut ApiServerState) {
    let mut pending = vec![key.clone()];
    while let Some(key) = pending.pop() {
        let Some(removed) = s.resources.remove(&key) else {
            continue;
        };
        let Some(uid) = removed.metadata.uid else {
            continue;
        };
        pending.extend(
            s.resources
                .iter()
                .filter(|(_, obj)| {
                    obj.metadata
                        .owner_references
                        .iter()
                        .flatten()
                        .any(|owner_ref| owner_ref.uid == uid)
                })
                .map(|(dependent, _)| dependent.clone()),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    Get,
    Create,
    Delete,
    Update,
    UpdateStatus,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Verb::Get => "Get",
            Verb::Create => "Create",
            Verb::Delete => "Delete",
            Verb::Update => "Update",
            Verb::UpdateStatus => "UpdateStatus",
        };
        f.write_str(verb)
    }
}

#[derive(Default)]
struct ModelInner {
    state: ApiServerState,
    // "<verb> <key>" of every mutating request served, in order
    mutations: Vec<String>,
    events: Vec<EventRequest>,
    failures: BTreeMap<(Verb, ObjectKey), APIError>,
    mutation_count: usize,
    crash_at_mutation: Option<usize>,
}

/// ExecutableApiServerModel serves controller requests from memory.
///
/// Requests are handled by the same admission and storage rules as above. On top of that, tests can
/// inject a failure for a verb and object key, inspect the mutating requests and events the
/// controller issued, and make the next crash point panic after a given number of mutations.
#[derive(Default)]
pub struct ExecutableApiServerModel {
    inner: Mutex<ModelInner>,
}

impl ExecutableApiServerModel {
    pub fn new() -> ExecutableApiServerModel {
        ExecutableApiServerModel::default()
    }

    fn lock(&self) -> MutexGuard<'_, ModelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Every request with this verb on this key fails with err until clear_failures is called.
    pub fn inject_failure(&self, verb: Verb, key: &str, err: APIError) {
        self.lock().failures.insert((verb, key.to_string()), err);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    // Panic at the crash point following the n-th mutating request from now on.
    pub fn crash_at_mutation(&self, n: usize) {
        let mut inner = self.lock();
        inner.crash_at_mutation = Some(inner.mutation_count + n);
    }

    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.lock().events.iter().map(|event| event.reason.clone()).collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().state.resources.keys().cloned().collect()
    }

    // The typed helpers below act on the store directly, the way a user or another
    // component would, so they are not recorded as controller mutations.

    pub fn create_object<K>(&self, obj: &K) -> Result<K, APIError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let obj = marshal(obj).map_err(|err| APIError::Other(err.to_string()))?;
        let created = handle_create_request(&ApiResource::erase::<K>(&()), &namespace, &obj, &mut self.lock().state)?;
        unmarshal(&created).map_err(|err| APIError::Other(err.to_string()))
    }

    pub fn get_object<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let obj = handle_get_request(&ApiResource::erase::<K>(&()), namespace, name, &self.lock().state).ok()?;
        unmarshal(&obj).ok()
    }

    pub fn update_object<K>(&self, obj: &K) -> Result<K, APIError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let obj = marshal(obj).map_err(|err| APIError::Other(err.to_string()))?;
        let updated = handle_update_request(&ApiResource::erase::<K>(&()), &namespace, &name, &obj, &mut self.lock().state)?;
        unmarshal(&updated).map_err(|err| APIError::Other(err.to_string()))
    }

    pub fn delete_object<K>(&self, namespace: &str, name: &str) -> Result<(), APIError>
    where
        K: Resource<DynamicType = ()>,
    {
        handle_delete_request(&ApiResource::erase::<K>(&()), namespace, name, &mut self.lock().state)
    }

    fn serve<T>(
        &self,
        verb: Verb,
        key: ObjectKey,
        handler: impl FnOnce(&mut ApiServerState) -> Result<T, APIError>,
    ) -> Result<T, APIError> {
        let mut inner = self.lock();
        if verb != Verb::Get {
            inner.mutations.push(format!("{} {}", verb, key));
        }
        if let Some(err) = inner.failures.get(&(verb, key)) {
            return Err(err.clone());
        }
        handler(&mut inner.state)
    }
}

#[async_trait]
impl ApiServerExecutor for ExecutableApiServerModel {
    async fn get(&self, api_resource: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject, APIError> {
        let key = object_key(&api_resource.kind, namespace, name);
        self.serve(Verb::Get, key, |s| handle_get_request(api_resource, namespace, name, s))
    }

    async fn create(&self, api_resource: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, APIError> {
        let key = object_key(&api_resource.kind, namespace, obj.metadata.name.as_deref().unwrap_or_default());
        self.serve(Verb::Create, key, |s| handle_create_request(api_resource, namespace, obj, s))
    }

    async fn delete(&self, api_resource: &ApiResource, namespace: &str, name: &str) -> Result<(), APIError> {
        let key = object_key(&api_resource.kind, namespace, name);
        self.serve(Verb::Delete, key, |s| handle_delete_request(api_resource, namespace, name, s))
    }

    async fn update(
        &self,
        api_resource: &ApiResource,
        namespace: &str,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, APIError> {
        let key = object_key(&api_resource.kind, namespace, name);
        self.serve(Verb::Update, key, |s| handle_update_request(api_resource, namespace, name, obj, s))
    }

    async fn update_status(
        &self,
        api_resource: &ApiResource,
        namespace: &str,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, APIError> {
        let key = object_key(&api_resource.kind, namespace, name);
        self.serve(Verb::UpdateStatus, key, |s| {
            handle_update_status_request(api_resource, namespace, name, obj, s)
        })
    }

    async fn publish_event(&self, _regarding: ObjectReference, event: &EventRequest) -> Result<(), APIError> {
        self.lock().events.push(event.clone());
        Ok(())
    }

    async fn crash_or_continue(&self, log_header: &str) -> Result<(), String> {
        let crash_at = {
            let mut inner = self.lock();
            inner.mutation_count += 1;
            if inner.crash_at_mutation == Some(inner.mutation_count) {
                inner.crash_at_mutation = None;
                Some(inner.mutation_count)
            } else {
                None
            }
        };
        if let Some(mutation) = crash_at {
            panic!("{} fault injection: crash at mutation {}", log_header, mutation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[test]
    fn test_create_twice_is_already_exists() {
        let model = ExecutableApiServerModel::new();
        let created = model.create_object(&config_map("c")).unwrap();
        assert_eq!(created.metadata.uid.as_deref(), Some("uid-0"));
        assert_eq!(created.metadata.resource_version.as_deref(), Some("0"));
        assert_eq!(model.create_object(&config_map("c")), Err(APIError::ObjectAlreadyExists));
    }

    #[test]
    fn test_stale_update_conflicts() {
        let model = ExecutableApiServerModel::new();
        let created = model.create_object(&config_map("c")).unwrap();
        let mut changed = created.clone();
        changed.data = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        let updated = model.update_object(&changed).unwrap();
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);
        // created still carries the old resource version.
        assert_eq!(model.update_object(&created), Err(APIError::Conflict));
    }

    #[test]
    fn test_finalizer_gates_deletion() {
        let model = ExecutableApiServerModel::new();
        let mut cm = config_map("c");
        cm.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        model.create_object(&cm).unwrap();

        model.delete_object::<ConfigMap>("default", "c").unwrap();
        let stamped = model.get_object::<ConfigMap>("default", "c").unwrap();
        assert!(stamped.metadata.deletion_timestamp.is_some());

        // Adding a finalizer to an object being deleted is forbidden.
        let mut more = stamped.clone();
        more.metadata.finalizers = Some(vec!["example.com/hold".to_string(), "example.com/other".to_string()]);
        assert_eq!(model.update_object(&more), Err(APIError::Forbidden));

        let mut released = stamped;
        released.metadata.finalizers = None;
        model.update_object(&released).unwrap();
        assert!(model.get_object::<ConfigMap>("default", "c").is_none());
        assert_eq!(model.delete_object::<ConfigMap>("default", "c"), Err(APIError::ObjectNotFound));
    }

    #[test]
    fn test_owner_removal_collects_dependents() {
        let model = ExecutableApiServerModel::new();
        let owner = model.create_object(&config_map("owner")).unwrap();
        let dependent = Pod {
            metadata: ObjectMeta {
                name: Some("dependent".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "ConfigMap".to_string(),
                    name: "owner".to_string(),
                    uid: owner.metadata.uid.clone().unwrap(),
                    controller: Some(true),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        model.create_object(&dependent).unwrap();
        model.create_object(&config_map("bystander")).unwrap();

        model.delete_object::<ConfigMap>("default", "owner").unwrap();
        assert_eq!(model.keys(), vec!["ConfigMap/default/bystander".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_failure_is_recorded() {
        let model = ExecutableApiServerModel::new();
        model.create_object(&config_map("c")).unwrap();
        let api_resource = ApiResource::erase::<ConfigMap>(&());
        model.inject_failure(Verb::Delete, "ConfigMap/default/c", APIError::Forbidden);

        assert_eq!(model.delete(&api_resource, "default", "c").await, Err(APIError::Forbidden));
        assert!(model.get(&api_resource, "default", "c").await.is_ok());
        model.clear_failures();
        assert_eq!(model.delete(&api_resource, "default", "c").await, Ok(()));
        assert_eq!(
            model.mutations(),
            vec!["Delete ConfigMap/default/c".to_string(), "Delete ConfigMap/default/c".to_string()]
        );
    }
}
