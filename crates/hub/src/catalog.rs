//! Append-only catalog of monitored plants.
//!
//! Devices reference plants by their 1-based index, so an index is never
//! reissued or moved once handed out.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::HubError;

/// Per-plant duration recorded for new plants.
pub const DEFAULT_PLANT_DURATION_SEC: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plant {
    pub index: u32,
    pub name: String,
    pub remaining_duration: i64,
    pub configured_duration: i64,
}

#[derive(Debug, Default)]
pub struct PlantCatalog {
    plants: Vec<Plant>, // sorted by index
}

impl PlantCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted plants. Records reusing an index or a name
    /// already seen are dropped with a warning; gaps left by dropped records
    /// stay gaps.
    pub fn restore(mut plants: Vec<Plant>) -> Self {
        plants.sort_by_key(|p| p.index);
        let mut catalog = Self::new();
        for plant in plants {
            if plant.index == 0 || catalog.get(plant.index).is_some() {
                warn!(index = plant.index, name = %plant.name, "catalog: duplicate or zero plant index, skipping");
                continue;
            }
            if catalog.contains_name(&plant.name) {
                warn!(index = plant.index, name = %plant.name, "catalog: duplicate plant name, skipping");
                continue;
            }
            catalog.plants.push(plant);
        }
        catalog
    }

    pub fn len(&self) -> usize {
        self.plants.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.plants.is_empty()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.plants.iter().any(|p| p.name == name)
    }

    /// Index the next added plant will receive, `None` once `u32::MAX` has
    /// been issued.
    pub fn next_index(&self) -> Option<u32> {
        match self.plants.last() {
            Some(p) => p.index.checked_add(1),
            None => Some(1),
        }
    }

    /// Append a plant. Names are compared exactly (case-sensitive) after
    /// trimming surrounding whitespace.
    pub fn add(&mut self, name: &str) -> Result<&Plant, HubError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::EmptyPlantName);
        }
        if self.contains_name(name) {
            return Err(HubError::DuplicatePlant(name.to_string()));
        }

        let index = self.next_index().ok_or(HubError::CatalogFull)?;
        self.plants.push(Plant {
            index,
            name: name.to_string(),
            remaining_duration: 0,
            configured_duration: DEFAULT_PLANT_DURATION_SEC,
        });
        Ok(&self.plants[self.plants.len() - 1])
    }

    pub fn get(&self, index: u32) -> Option<&Plant> {
        self.plants
            .binary_search_by_key(&index, |p| p.index)
            .ok()
            .map(|pos| &self.plants[pos])
    }

    /// Plants in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Plant> {
        self.plants.iter()
    }

    pub fn list(&self) -> Vec<Plant> {
        self.plants.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn plant(index: u32, name: &str) -> Plant {
        Plant {
            index,
            name: name.into(),
            remaining_duration: 0,
            configured_duration: DEFAULT_PLANT_DURATION_SEC,
        }
    }

    #[test]
    fn add_issues_sequential_indices() {
        let mut cat = PlantCatalog::new();
        assert_eq!(cat.add("Basil").unwrap().index, 1);
        assert_eq!(cat.add("Mint").unwrap().index, 2);
        assert_eq!(cat.get(2).unwrap().name, "Mint");
    }

    #[test]
    fn add_uses_default_durations() {
        let mut cat = PlantCatalog::new();
        let p = cat.add("Basil").unwrap().clone();
        assert_eq!(p.remaining_duration, 0);
        assert_eq!(p.configured_duration, 3600);
    }

    #[test]
    fn add_duplicate_rejected_without_mutation() {
        let mut cat = PlantCatalog::new();
        cat.add("Basil").unwrap();
        assert_eq!(
            cat.add("Basil"),
            Err(HubError::DuplicatePlant("Basil".into()))
        );
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.iter().filter(|p| p.name == "Basil").count(), 1);
    }

    #[test]
    fn add_is_case_sensitive() {
        let mut cat = PlantCatalog::new();
        cat.add("Basil").unwrap();
        assert!(cat.add("basil").is_ok());
        assert_eq!(cat.len(), 2);
    }

    #[test]
    fn add_empty_name_rejected() {
        let mut cat = PlantCatalog::new();
        assert_eq!(cat.add("  "), Err(HubError::EmptyPlantName));
        assert!(cat.is_empty());
    }

    #[test]
    fn get_out_of_range_is_none() {
        let mut cat = PlantCatalog::new();
        cat.add("Basil").unwrap();
        assert!(cat.get(0).is_none());
        assert!(cat.get(2).is_none());
    }

    #[test]
    fn restore_keeps_indices_across_gaps() {
        let mut cat = PlantCatalog::restore(vec![plant(3, "Thyme"), plant(1, "Basil")]);
        assert_eq!(cat.get(1).unwrap().name, "Basil");
        assert!(cat.get(2).is_none());
        assert_eq!(cat.get(3).unwrap().name, "Thyme");
        assert_eq!(cat.add("Sage").unwrap().index, 4);
    }

    #[test]
    fn restore_drops_duplicates() {
        let cat = PlantCatalog::restore(vec![
            plant(1, "Basil"),
            plant(1, "Mint"),
            plant(2, "Basil"),
            plant(0, "Zero"),
        ]);
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.get(1).unwrap().name, "Basil");
    }

    #[test]
    fn add_after_highest_index_is_rejected() {
        let mut cat = PlantCatalog::restore(vec![plant(u32::MAX, "Basil")]);
        assert_eq!(cat.next_index(), None);
        assert_eq!(cat.add("Mint"), Err(HubError::CatalogFull));
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.get(u32::MAX).unwrap().name, "Basil");
    }

    #[test]
    fn iter_is_index_ordered() {
        let cat = PlantCatalog::restore(vec![plant(2, "b"), plant(1, "a"), plant(5, "c")]);
        let order: Vec<u32> = cat.iter().map(|p| p.index).collect();
        assert_eq!(order, vec![1, 2, 5]);
    }
}
