// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod inventory;
pub mod reconciler;
pub mod self_healing;
pub mod step;
pub mod unit;
