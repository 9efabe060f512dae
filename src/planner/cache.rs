//! Cache of finished contraction plans, keyed by a fingerprint of the
//! network topology (plus strategy and seed). Entries can be persisted
//! across runs as JSON at the user's request.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::planner::ContractionPlan;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: u64,
    plan: ContractionPlan,
}

/// In-memory plan cache with hit/miss accounting.
#[derive(Debug, Default)]
pub struct PlanCache {
    entries: FxHashMap<u64, ContractionPlan>,
    hits: u64,
    misses: u64,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn lookup(&mut self, key: u64) -> Option<ContractionPlan> {
        match self.entries.get(&key) {
            Some(plan) => {
                self.hits += 1;
                Some(plan.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: u64, plan: ContractionPlan) {
        self.entries.insert(key, plan);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Writes every entry to `path` as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let entries: Vec<CacheEntry> = self
            .entries
            .iter()
            .map(|(&key, plan)| CacheEntry {
                key,
                plan: plan.clone(),
            })
            .collect();
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), &entries)
            .map_err(|e| crate::error::Error::FileFormat(e.to_string()))?;
        debug!("saved {} contraction plans to {}", entries.len(), path.display());
        Ok(())
    }

    /// Merges entries previously written with [`PlanCache::save`].
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let file = File::open(path)?;
        let entries: Vec<CacheEntry> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| crate::error::Error::FileFormat(e.to_string()))?;
        let count = entries.len();
        for entry in entries {
            self.entries.insert(entry.key, entry.plan);
        }
        debug!("loaded {count} contraction plans from {}", path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContractionTriple;

    fn sample_plan() -> ContractionPlan {
        ContractionPlan {
            triples: vec![
                ContractionTriple::new(1, 2, 4),
                ContractionTriple::new(4, 3, 5),
            ],
            flops: 123.0,
            max_intermediate_volume: 16.0,
            result_id: 5,
        }
    }

    #[test]
    fn test_lookup_accounting() {
        let mut cache = PlanCache::new();
        assert!(cache.lookup(7).is_none());
        cache.insert(7, sample_plan());
        assert_eq!(cache.lookup(7).unwrap(), sample_plan());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let mut cache = PlanCache::new();
        cache.insert(7, sample_plan());
        let dir = std::env::temp_dir();
        let path = dir.join("tennet_plan_cache_test.json");
        cache.save(&path).unwrap();

        let mut restored = PlanCache::new();
        let count = restored.load(&path).unwrap();
        assert_eq!(count, 1);
        assert_eq!(restored.lookup(7).unwrap(), sample_plan());
        std::fs::remove_file(&path).ok();
    }
}
