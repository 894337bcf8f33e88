// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::config::ControllerConfig;
use crate::kubernetes_api_objects::error::APIError;
use crate::kubernetes_api_objects::marshal::unmarshal;
use crate::reconciler::exec::{io::*, reconciler::Reconciler};
use crate::shim_layer::executor::{handle_request, ApiServerExecutor, KubeClientExecutor};
use crate::Error;
use core::fmt::Debug;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ApiResource},
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher, WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use kube_core::NamespaceResourceScope;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The shim layer connects reconcile_core to the kube-rs controller runtime.
/// The key is to implement the reconcile function (impl FnMut(Arc<K>, Arc<Ctx>) -> ReconcilerFut),
/// which is required by kube-rs to build a controller, on top of reconcile_core.

/// run_controller prepares and runs the controller until it receives a termination signal.
/// Besides changes to K, a reconcile of K is triggered whenever one of its units is deleted.
pub async fn run_controller<K, R>(config: ControllerConfig) -> anyhow::Result<()>
where
    K: Clone
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    R: Reconciler<K = K> + 'static,
    R::S: Send,
{
    let client = Client::try_default().await?;
    let crs = Api::<K>::all(client.clone());
    let (requeue_tx, requeue_rx) = mpsc::unbounded();
    let data = Arc::new(Data {
        executor: KubeClientExecutor::new(client.clone(), &config.reporter),
        config,
    });

    info!("starting controller");
    let controller = Controller::new(crs, watcher::Config::default())
        .reconcile_on(requeue_rx)
        .shutdown_on_signal()
        .run(
            reconcile_with::<K, R, KubeClientExecutor>,
            error_policy::<K, KubeClientExecutor>,
            data,
        )
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => info!("reconciled {}", obj),
                Err(err) => warn!("reconcile failed: {}", err),
            }
        });

    tokio::select! {
        _ = controller => {},
        _ = observe_unit_deletions::<R>(client, requeue_tx) => warn!("unit deletion observer terminated"),
    }
    info!("controller terminated");
    Ok(())
}

// reconcile_with implements the reconcile function by repeatedly invoking R::reconcile_core.
// It starts with R::reconcile_init_state and, in each iteration, feeds reconcile_core the state and
// the response returned by the previous one. Each request reconcile_core issues is performed through
// the executor. The loop ends when R reports the reconcile is done (R::reconcile_done)
// or has hit an error (R::reconcile_error).
pub async fn reconcile_with<K, R, E>(cr: Arc<K>, ctx: Arc<Data<E>>) -> Result<Action, Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
    R: Reconciler<K = K>,
    E: ApiServerExecutor,
{
    let executor = &ctx.executor;

    let cr_name = cr.meta().name.as_deref().ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let cr_namespace = cr
        .meta()
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let cr_key = format!("{}/{}/{}", K::kind(&()), cr_namespace, cr_name);
    let log_header = format!("Reconciling {}:", cr_key);

    // Get the custom resource by a quorum read so reconcile_core never works on a stale cached copy
    let cr = match executor.get(&ApiResource::erase::<K>(&()), cr_namespace, cr_name).await {
        Err(APIError::ObjectNotFound) => {
            info!("{} Custom resource {} not found, end reconcile", log_header, cr_name);
            return Ok(Action::await_change());
        }
        Err(err) => {
            warn!("{} Get custom resource {} failed with error: {}", log_header, cr_name, err);
            return Err(Error::CustomResourceGetFailed(cr_key, err));
        }
        Ok(obj) => unmarshal::<K>(&obj).map_err(|err| Error::ShimLayerError(format!("{} {}", log_header, err)))?,
    };
    debug!("{} Get cr {:?}", log_header, cr.meta());

    let mut state = R::reconcile_init_state();
    let mut resp_o: Option<Response> = None;
    loop {
        if R::reconcile_done(&state) {
            info!("{} done", log_header);
            break;
        }
        if let Some(err) = R::reconcile_error(&state) {
            warn!("{} error: {}", log_header, err);
            return Err(Error::ReconcileCoreError(err));
        }
        let (state_prime, req_o) = R::reconcile_core(&cr, resp_o, state);
        // Only set right after a create, update or delete request went out
        let mut check_fault_timing = false;
        resp_o = match req_o {
            Some(Request::KRequest(req)) => {
                check_fault_timing = req.is_mutation();
                Some(Response::KResponse(handle_request(executor, req, &log_header).await))
            }
            Some(Request::EventRequest(event)) => {
                if let Err(err) = executor.publish_event(cr.object_ref(&()), &event).await {
                    warn!("{} Publish event {} failed with error: {}", log_header, event.reason, err);
                }
                Some(Response::EventResponse)
            }
            None => None,
        };
        if check_fault_timing && ctx.config.fault_injection {
            if let Err(err) = executor.crash_or_continue(&log_header).await {
                warn!("{} crash_or_continue fails due to {}", log_header, err);
            }
        }
        state = state_prime;
    }

    Ok(Action::requeue(ctx.config.requeue_after))
}

// error_policy defines the controller's behavior when the reconcile ends with an error.
// Retries are rate limited by a fixed delay (error_requeue_after), not an exponential backoff.
pub fn error_policy<K, E>(cr: Arc<K>, error: &Error, ctx: Arc<Data<E>>) -> Action
where
    K: Resource,
{
    warn!("{} will be reconciled again: {}", cr.name_any(), error);
    Action::requeue(ctx.config.error_requeue_after)
}

// observe_unit_deletions watches units in all namespaces and, for every deleted unit,
// sends the keys of the custom resources R wants reconciled again into requeue.
pub async fn observe_unit_deletions<R>(client: Client, requeue: UnboundedSender<ObjectRef<R::K>>)
where
    R: Reconciler,
{
    let mut events = watcher(Api::<Pod>::all(client), watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if !forward_unit_deletion::<R>(event, &requeue) {
                    return;
                }
            }
            Err(err) => warn!("unit watcher error: {}", err),
        }
    }
}

// Returns false once nobody listens on requeue anymore.
pub fn forward_unit_deletion<R>(event: watcher::Event<Pod>, requeue: &UnboundedSender<ObjectRef<R::K>>) -> bool
where
    R: Reconciler,
{
    let watcher::Event::Deleted(unit) = event else {
        return true;
    };
    for owner in R::owners_to_requeue(&unit) {
        info!("unit {} deleted, requeue {}", unit.name_any(), owner);
        if requeue.unbounded_send(owner).is_err() {
            return false;
        }
    }
    true
}

// Data is passed to reconcile_with.
// It carries the executor that performs requests and the controller configuration.
pub struct Data<E> {
    pub executor: E,
    pub config: ControllerConfig,
}
