// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::config::ControllerConfig;
use crate::crd::{Fleet, FleetSpec};
use crate::executable_model::api_server::ExecutableApiServerModel;
use crate::fleet_controller::inventory::{Inventory, UNITS_FINALIZER};
use crate::fleet_controller::reconciler::FleetReconciler;
use crate::fleet_controller::unit::desired_unit_names;
use crate::shim_layer::controller_runtime::{reconcile_with, Data};
use k8s_openapi::api::core::v1::Pod;
use proptest::prelude::*;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn fleet(count: u32) -> Fleet {
    let mut fleet = Fleet::new("r", FleetSpec { count, unit_port: 6379 });
    fleet.metadata.namespace = Some("default".to_string());
    fleet
}

proptest! {
    // Each case edits the desired count a number of times, reconciling after every edit.
    #![proptest_config(ProptestConfig::with_cases(50))]
    #[test]
    fn test_fleet_converges(counts in prop::collection::vec(0u32..6, 1..8)) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let data = Arc::new(Data {
                executor: ExecutableApiServerModel::new(),
                config: ControllerConfig::default(),
            });
            data.executor.create_object(&fleet(counts[0])).unwrap();
            for (i, count) in counts.iter().copied().enumerate() {
                if i > 0 {
                    let mut stored = data.executor.get_object::<Fleet>("default", "r").unwrap();
                    stored.spec.count = count;
                    data.executor.update_object(&stored).unwrap();
                }
                reconcile_with::<Fleet, FleetReconciler, ExecutableApiServerModel>(
                    Arc::new(fleet(0)), data.clone()
                ).await.unwrap();

                let desired = desired_unit_names("r", count);
                let stored = data.executor.get_object::<Fleet>("default", "r").unwrap();
                let inventory = Inventory::from_fleet(&stored);
                assert_eq!(inventory.units(), desired.as_slice());
                // The finalizer is present exactly while units are tracked.
                let has_finalizer = stored.metadata.finalizers.iter().flatten().any(|f| f == UNITS_FINALIZER);
                assert_eq!(has_finalizer, !inventory.is_empty());
                assert_eq!(stored.status.map(|s| s.tracked_unit_count).unwrap_or(0), count);
                // Units are exactly the desired ones.
                let units: Vec<String> = data.executor.keys().into_iter()
                    .filter_map(|key| key.strip_prefix("Pod/default/").map(str::to_string))
                    .collect();
                let mut expected = desired.clone();
                expected.sort();
                assert_eq!(units, expected);
                assert!(desired.iter().all(|name| data.executor.get_object::<Pod>("default", name).is_some()));

                // A second pass over a converged fleet writes nothing.
                data.executor.clear_mutations();
                reconcile_with::<Fleet, FleetReconciler, ExecutableApiServerModel>(
                    Arc::new(fleet(0)), data.clone()
                ).await.unwrap();
                assert!(data.executor.mutations().is_empty());
            }
        });
    }
}
