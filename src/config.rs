// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use std::env;
use std::time::Duration;
use tracing::warn;

pub const REPORTER_ENV: &str = "FLEET_CONTROLLER_REPORTER";
pub const REQUEUE_SECS_ENV: &str = "FLEET_REQUEUE_SECS";
pub const ERROR_REQUEUE_SECS_ENV: &str = "FLEET_ERROR_REQUEUE_SECS";

/// Knobs of the controller process. Connection settings are not here:
/// the kube client reads them from the kubeconfig or the in-cluster environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Name recorded as the reporting controller on published events.
    pub reporter: String,
    /// Resync period after a successful reconcile.
    pub requeue_after: Duration,
    /// Delay before retrying a reconcile that ended with an error.
    pub error_requeue_after: Duration,
    /// Crash after the n-th mutating request, as configured by the fault-injection ConfigMap.
    pub fault_injection: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            reporter: "fleet-controller".to_string(),
            requeue_after: Duration::from_secs(60),
            error_requeue_after: Duration::from_secs(10),
            fault_injection: false,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    // Unset or malformed values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = ControllerConfig::default();
        ControllerConfig {
            reporter: lookup(REPORTER_ENV)
                .filter(|reporter| !reporter.is_empty())
                .unwrap_or(default.reporter),
            requeue_after: secs_from(&lookup, REQUEUE_SECS_ENV).unwrap_or(default.requeue_after),
            error_requeue_after: secs_from(&lookup, ERROR_REQUEUE_SECS_ENV)
                .unwrap_or(default.error_requeue_after),
            fault_injection: default.fault_injection,
        }
    }

    pub fn with_fault_injection(self, fault_injection: bool) -> Self {
        ControllerConfig {
            fault_injection,
            ..self
        }
    }
}

fn secs_from(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            warn!("Ignoring {}={}: {}", key, raw, e);
            None
        }
    }
}
