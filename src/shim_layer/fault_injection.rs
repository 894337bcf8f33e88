// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, PostParams},
    Client,
};
use tracing::{debug, error};

pub const FAULT_INJECTION_CONFIG: &str = "fault-injection-config";
pub const FAULT_INJECTION_NAMESPACE: &str = "default";

// crash_or_continue counts the mutating requests issued so far in the "current" entry of
// the fault-injection-config ConfigMap and crashes the controller once it reaches "expected".
pub async fn crash_or_continue(client: &Client, log_header: &str) -> Result<(), String> {
    let config_map_api = Api::<ConfigMap>::namespaced(client.clone(), FAULT_INJECTION_NAMESPACE);
    let mut config_map = config_map_api
        .get(FAULT_INJECTION_CONFIG)
        .await
        .map_err(|err| format!("Fail to get fault injection config: {}", err))?;
    debug!("{} Get {}: {:?}", log_header, FAULT_INJECTION_CONFIG, config_map.data);

    let data = config_map.data.get_or_insert_with(Default::default);
    let current = parse_counter(data.get("current"), "current")?;
    let expected = parse_counter(data.get("expected"), "expected")?;
    data.insert("current".to_string(), (current + 1).to_string());
    config_map_api
        .replace(FAULT_INJECTION_CONFIG, &PostParams::default(), &config_map)
        .await
        .map_err(|err| format!("Fail to update fault injection config: {}", err))?;

    if current == expected {
        error!("{} Crashing at mutation {} as configured", log_header, current);
        panic!("fault injection: crash at mutation {}", current);
    }
    Ok(())
}

fn parse_counter(value: Option<&String>, key: &str) -> Result<i32, String> {
    value
        .ok_or_else(|| format!("Fail to get {}", key))?
        .parse::<i32>()
        .map_err(|err| format!("Fail to parse {} value to i32: {}", key, err))
}
