// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::ReconcileError;

// FleetReconcileStep records which request reconcile_core is waiting on.
// Indices point into the desired sequence (AfterGetUnit, AfterCreateUnit)
// or into the inventory (AfterDeleteSurplusUnit, AfterDeleteTrackedUnit,
// AfterCleanupFailedEvent).
#[derive(Debug, Clone, PartialEq)]
pub enum FleetReconcileStep {
    Init,
    AfterGetUnit(usize),
    AfterCreateUnit(usize),
    AfterScaleDownEvent,
    AfterDeleteSurplusUnit(usize),
    AfterScaleUpEvent,
    AfterUpdatedEvent,
    AfterUpdateFleet,
    AfterUpdateFleetStatus,
    AfterDeleteTrackedUnit(usize),
    AfterCleanupFailedEvent(usize),
    AfterClearInventory,
    Done,
    Error(ReconcileError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Syncing,
    Deleting,
    // A sync that found nothing to change and wrote nothing.
    Idle,
}
