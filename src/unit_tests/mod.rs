// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod fleet_properties;
pub mod fleet_scenarios;
