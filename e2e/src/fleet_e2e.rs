use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DynamicObject, ListParams, ResourceExt},
    core::GroupVersionKind,
    discovery::{ApiResource, Discovery},
    Client,
};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::*;

use crate::common::*;

const FLEET_LABEL: &str = "fleet.anvil.dev/fleet";

pub fn fleet() -> String {
    "
    apiVersion: anvil.dev/v1
    kind: Fleet
    metadata:
      name: redis-fleet
      namespace: default
    spec:
      count: 3
      unitPort: 6379
    "
    .to_string()
}

fn fleet_api(client: Client) -> Api<DynamicObject> {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("anvil.dev", "v1", "Fleet"));
    Api::namespaced_with(client, "default", &ar)
}

fn unit_names(fleet_name: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}-{}", fleet_name, i)).collect()
}

async fn list_units(client: Client, fleet_name: &str) -> Result<Vec<Pod>, kube::Error> {
    let pod_api: Api<Pod> = Api::default_namespaced(client);
    let lp = ListParams::default().labels(&format!("{}={}", FLEET_LABEL, fleet_name));
    Ok(pod_api.list(&lp).await?.items)
}

// Waits until the fleet has exactly the units <fleet_name>-0 .. <fleet_name>-(count-1)
// and reports count tracked units in its status.
async fn wait_for_units(client: Client, fleet_name: &str, count: usize, timeout: Duration) -> Result<(), Error> {
    let start = Instant::now();
    let expected = unit_names(fleet_name, count);
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            error!("Time out waiting for {} units", count);
            return Err(Error::Timeout);
        }
        let units = match list_units(client.clone(), fleet_name).await {
            Err(e) => {
                info!("List units failed with error {}.", e);
                continue;
            }
            Ok(units) => units,
        };
        // Units being deleted still show up in the list for a while.
        let mut names: Vec<String> = units
            .iter()
            .filter(|unit| unit.metadata.deletion_timestamp.is_none())
            .map(|unit| unit.name_any())
            .collect();
        names.sort();
        if names != expected {
            info!("Units are {:?}, waiting for {:?}.", names, expected);
            continue;
        }
        let fleet = match fleet_api(client.clone()).get(fleet_name).await {
            Err(e) => {
                info!("Get fleet failed with error {}.", e);
                continue;
            }
            Ok(fleet) => fleet,
        };
        let tracked = fleet.data["status"]["trackedUnitCount"].as_u64();
        if tracked != Some(count as u64) {
            info!("Fleet tracks {:?} units, waiting for {}.", tracked, count);
            continue;
        }
        break;
    }
    info!("We have {} units now.", count);
    Ok(())
}

pub async fn desired_state_test(client: Client, fleet_name: String) -> Result<(), Error> {
    wait_for_units(client.clone(), &fleet_name, 3, Duration::from_secs(360)).await?;
    for unit in list_units(client.clone(), &fleet_name).await? {
        let owned = unit
            .owner_references()
            .iter()
            .any(|owner| owner.kind == "Fleet" && owner.name == fleet_name && owner.controller == Some(true));
        if !owned {
            return Err(Error::FleetUnitsFailed(format!("{} is not owned by the fleet", unit.name_any())));
        }
        let port = unit
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .and_then(|container| container.ports.as_ref())
            .and_then(|ports| ports.first())
            .map(|port| port.container_port);
        if port != Some(6379) {
            return Err(Error::FleetUnitsFailed(format!("{} exposes port {:?}", unit.name_any(), port)));
        }
    }
    info!("Desired state test passed.");
    Ok(())
}

pub async fn scaling_test(client: Client, fleet_name: String) -> Result<(), Error> {
    let timeout = Duration::from_secs(600);
    run_command(
        "kubectl",
        vec![
            "patch",
            "fleet",
            &fleet_name,
            "--type=json",
            "-p",
            "[{\"op\": \"replace\", \"path\": \"/spec/count\", \"value\": 5}]",
        ],
    )?;
    wait_for_units(client.clone(), &fleet_name, 5, timeout).await?;

    run_command(
        "kubectl",
        vec![
            "patch",
            "fleet",
            &fleet_name,
            "--type=json",
            "-p",
            "[{\"op\": \"replace\", \"path\": \"/spec/count\", \"value\": 2}]",
        ],
    )?;
    wait_for_units(client.clone(), &fleet_name, 2, timeout).await?;

    info!("Scaling test passed.");
    Ok(())
}

pub async fn self_healing_test(client: Client, fleet_name: String) -> Result<(), Error> {
    let timeout = Duration::from_secs(360);
    let pod_api: Api<Pod> = Api::default_namespaced(client.clone());
    let victim = format!("{}-1", fleet_name);
    let old_uid = pod_api.get(&victim).await?.uid();

    run_command("kubectl", vec!["delete", "pod", &victim, "--wait=false"])?;

    let start = Instant::now();
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            error!("Time out on self-healing test");
            return Err(Error::Timeout);
        }
        match pod_api.get(&victim).await {
            Err(e) => info!("Get {} failed with error {}.", victim, e),
            Ok(unit) if unit.uid() == old_uid || unit.metadata.deletion_timestamp.is_some() => {
                info!("{} is not replaced yet.", victim);
            }
            Ok(_) => break,
        }
    }

    info!("Self-healing test passed.");
    Ok(())
}

pub async fn deletion_test(client: Client, fleet_name: String) -> Result<(), Error> {
    let timeout = Duration::from_secs(360);
    run_command("kubectl", vec!["delete", "fleet", &fleet_name, "--wait=false"])?;

    let start = Instant::now();
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            error!("Time out on deletion test");
            return Err(Error::Timeout);
        }
        match fleet_api(client.clone()).get_opt(&fleet_name).await {
            Err(e) => {
                info!("Get fleet failed with error {}.", e);
                continue;
            }
            Ok(Some(_)) => {
                info!("Fleet {} still exists.", fleet_name);
                continue;
            }
            Ok(None) => {}
        }
        let units = list_units(client.clone(), &fleet_name).await?;
        if !units.is_empty() {
            info!("{} units left.", units.len());
            continue;
        }
        break;
    }

    info!("Deletion test passed.");
    Ok(())
}

async fn apply_fleet() -> Result<(Client, String), Error> {
    // check if the CRD is already registered
    let client = Client::try_default().await?;
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    if let Err(e) = crd_api.get("fleets.anvil.dev").await {
        error!("No CRD found, create one before run the e2e test.");
        return Err(Error::CRDGetFailed(e));
    }
    info!("CRD found, continue to run the e2e test.");

    let discovery = Discovery::new(client.clone()).run().await?;
    let fleet_name = apply(fleet(), client.clone(), &discovery).await?;
    Ok((client, fleet_name))
}

pub async fn fleet_e2e_test() -> Result<(), Error> {
    let (client, fleet_name) = apply_fleet().await?;

    desired_state_test(client.clone(), fleet_name.clone()).await?;
    self_healing_test(client.clone(), fleet_name.clone()).await?;
    wait_for_units(client.clone(), &fleet_name, 3, Duration::from_secs(360)).await?;

    info!("E2e test passed.");
    Ok(())
}

pub async fn fleet_scaling_e2e_test() -> Result<(), Error> {
    let (client, fleet_name) = apply_fleet().await?;

    desired_state_test(client.clone(), fleet_name.clone()).await?;
    scaling_test(client.clone(), fleet_name.clone()).await?;

    info!("E2e test passed.");
    Ok(())
}

pub async fn fleet_deletion_e2e_test() -> Result<(), Error> {
    let (client, fleet_name) = apply_fleet().await?;

    desired_state_test(client.clone(), fleet_name.clone()).await?;
    deletion_test(client.clone(), fleet_name.clone()).await?;

    info!("E2e test passed.");
    Ok(())
}
