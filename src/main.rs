// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use anyhow::Result;
use fleet_controller::config::ControllerConfig;
use fleet_controller::crd::Fleet;
use fleet_controller::fleet_controller::reconciler::FleetReconciler;
use fleet_controller::shim_layer::controller_runtime::run_controller;
use kube::CustomResourceExt;
use std::env;
use tracing::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or_default();
    if cmd == "export" {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&Fleet::crd())?);
    } else if cmd == "run" {
        info!("running fleet-controller");
        run_controller::<Fleet, FleetReconciler>(ControllerConfig::from_env()).await?;
    } else if cmd == "crash" {
        info!("running fleet-controller in crash-testing mode");
        run_controller::<Fleet, FleetReconciler>(ControllerConfig::from_env().with_fault_injection(true)).await?;
    } else {
        warn!("wrong command; please use \"export\", \"run\" or \"crash\"");
    }
    Ok(())
}
