// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::crd::Fleet;

pub const INVENTORY_ANNOTATION: &str = "fleet.anvil.dev/inventory";
pub const UNITS_FINALIZER: &str = "fleet.anvil.dev/units";

/// The units the controller believes it has created for a fleet, in creation order.
///
/// The inventory is persisted on the fleet itself as the `fleet.anvil.dev/inventory`
/// annotation. It is coupled to the `fleet.anvil.dev/units` finalizer: the finalizer is
/// present exactly while the inventory is non-empty, so a fleet cannot disappear while
/// units it created may still exist. [`Inventory::apply_to`] writes both together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    units: Vec<String>,
}

impl Inventory {
    pub fn from_fleet(fleet: &Fleet) -> Inventory {
        fleet
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(INVENTORY_ANNOTATION))
            .map(|raw| Inventory::parse(raw))
            .unwrap_or_default()
    }

    // Unit names are DNS-1123 names, so they never contain a comma.
    pub fn parse(raw: &str) -> Inventory {
        let mut inventory = Inventory::default();
        for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            inventory.record_created(name);
        }
        inventory
    }

    pub fn render(&self) -> String {
        self.units.join(",")
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.iter().any(|unit| unit == name)
    }

    /// Appends the unit unless it is already tracked. Returns whether the inventory changed.
    pub fn record_created(&mut self, name: &str) -> bool {
        if self.contains(name) {
            false
        } else {
            self.units.push(name.to_string());
            true
        }
    }

    pub fn truncate_to(&mut self, desired: &[String]) {
        self.units = desired.to_vec();
    }

    /// The tracked units beyond the first `desired_len`, in inventory order.
    pub fn surplus(&self, desired_len: usize) -> &[String] {
        self.units.get(desired_len..).unwrap_or_default()
    }

    /// A copy of the fleet carrying this inventory and the matching finalizer.
    /// Finalizers owned by other parties are left in place.
    pub fn apply_to(&self, fleet: &Fleet) -> Fleet {
        let mut fleet = fleet.clone();

        let mut annotations = fleet.metadata.annotations.take().unwrap_or_default();
        if self.is_empty() {
            annotations.remove(INVENTORY_ANNOTATION);
        } else {
            annotations.insert(INVENTORY_ANNOTATION.to_string(), self.render());
        }
        fleet.metadata.annotations = (!annotations.is_empty()).then_some(annotations);

        let mut finalizers: Vec<String> = fleet
            .metadata
            .finalizers
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|finalizer| finalizer != UNITS_FINALIZER)
            .collect();
        if !self.is_empty() {
            finalizers.push(UNITS_FINALIZER.to_string());
        }
        fleet.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);

        fleet
    }
}

impl FromIterator<String> for Inventory {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut inventory = Inventory::default();
        for name in iter {
            inventory.record_created(&name);
        }
        inventory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::FleetSpec;
    use std::collections::BTreeMap;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_record_created_is_append_if_absent() {
        let mut inventory = Inventory::default();
        assert!(inventory.record_created("r-0"));
        assert!(inventory.record_created("r-1"));
        assert!(!inventory.record_created("r-0"));
        assert_eq!(inventory.units(), names(&["r-0", "r-1"]).as_slice());
    }

    #[test]
    fn test_surplus_and_truncate() {
        let mut inventory: Inventory = names(&["r-0", "r-1", "r-2", "r-3"]).into_iter().collect();
        assert_eq!(inventory.surplus(2), names(&["r-2", "r-3"]).as_slice());
        assert!(inventory.surplus(4).is_empty());
        assert!(inventory.surplus(7).is_empty());

        inventory.truncate_to(&names(&["r-0", "r-1"]));
        assert_eq!(inventory.units(), names(&["r-0", "r-1"]).as_slice());
    }

    #[test]
    fn test_parse_skips_blanks_and_duplicates() {
        let inventory = Inventory::parse(" r-0,,r-1, r-0 ,");
        assert_eq!(inventory.units(), names(&["r-0", "r-1"]).as_slice());
        assert_eq!(inventory.render(), "r-0,r-1");
        assert!(Inventory::parse("").is_empty());
    }

    #[test]
    fn test_apply_to_couples_finalizer() {
        let mut fleet = Fleet::new("r", FleetSpec { count: 2, unit_port: 6379 });
        fleet.metadata.finalizers = Some(names(&["example.com/other"]));
        fleet.metadata.annotations =
            Some(BTreeMap::from([("note".to_string(), "keep".to_string())]));

        let tracked: Inventory = names(&["r-0", "r-1"]).into_iter().collect();
        let fleet = tracked.apply_to(&fleet);
        assert_eq!(Inventory::from_fleet(&fleet), tracked);
        assert_eq!(
            fleet.metadata.finalizers,
            Some(names(&["example.com/other", UNITS_FINALIZER]))
        );
        // Applying twice does not duplicate the finalizer.
        assert_eq!(tracked.apply_to(&fleet), fleet);

        let fleet = Inventory::default().apply_to(&fleet);
        assert!(Inventory::from_fleet(&fleet).is_empty());
        assert_eq!(fleet.metadata.finalizers, Some(names(&["example.com/other"])));
        let annotations = fleet.metadata.annotations.as_ref().unwrap();
        assert!(!annotations.contains_key(INVENTORY_ANNOTATION));
        assert_eq!(annotations.get("note").map(String::as_str), Some("keep"));
    }

    #[test]
    fn test_apply_empty_to_bare_fleet() {
        let fleet = Fleet::new("r", FleetSpec { count: 0, unit_port: 6379 });
        let fleet = Inventory::default().apply_to(&fleet);
        assert_eq!(fleet.metadata.finalizers, None);
        assert_eq!(fleet.metadata.annotations, None);
    }
}
