use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::KitSeed;
use crate::kits::{Kit, KitSource, NewKit};
use crate::kits_repo::KitsRepository;

/// The logical set of kits, materialised from three sources: the YAML seed
/// file, admin CRUD, and ingest auto-registration. Readers get a lock-free
/// copy-on-update snapshot; every mutation goes through the repository and
/// then swaps in a fresh snapshot under a single async mutex.
#[derive(Clone)]
pub struct KitRegistry {
    repo: KitsRepository,
    snapshot: Arc<ArcSwap<Vec<Kit>>>,
    mutate: Arc<tokio::sync::Mutex<()>>,
}

impl KitRegistry {
    pub fn new(repo: KitsRepository) -> Self {
        Self {
            repo,
            snapshot: Arc::new(ArcSwap::from_pointee(Vec::new())),
            mutate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn repo(&self) -> &KitsRepository {
        &self.repo
    }

    /// Current snapshot. Cheap; safe to call from any handler or loop.
    pub fn kits(&self) -> Arc<Vec<Kit>> {
        self.snapshot.load_full()
    }

    pub fn get(&self, kit_id: &str) -> Option<Kit> {
        self.kits().iter().find(|k| k.kit_id == kit_id).cloned()
    }

    /// Reload the snapshot from the store.
    pub fn refresh(&self) -> Result<()> {
        let kits = self.repo.get_all().context("loading kit registry")?;
        self.snapshot.store(Arc::new(kits));
        Ok(())
    }

    /// Serialised mutation + snapshot refresh, for admin paths that need
    /// their write visible to the next read.
    pub async fn mutate_and_refresh<T>(
        &self,
        op: impl FnOnce(&KitsRepository) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.mutate.lock().await;
        let out = op(&self.repo)?;
        self.refresh()?;
        Ok(out)
    }

    /// Apply the YAML seed list: add-if-missing only, so admin edits and
    /// tombstones survive every restart. Returns how many kits were added.
    pub fn seed_from_config(&self, seeds: &[KitSeed]) -> Result<usize> {
        let mut added = 0usize;
        for seed in seeds {
            let Some(kit_id) = seed.resolved_id() else {
                warn!("Skipping kit seed with neither kit_id nor api_url");
                continue;
            };
            let new_kit = NewKit {
                name: seed.name.clone().unwrap_or_else(|| kit_id.clone()),
                kit_id,
                location: seed.location.clone(),
                api_url: seed.api_url.clone(),
                source: if seed.api_url.is_some() {
                    KitSource::Http
                } else {
                    KitSource::Mqtt
                },
                enabled: seed.enabled,
            };
            if self.repo.seed(&new_kit)? {
                info!("Seeded kit {} from config", new_kit.kit_id);
                added += 1;
            }
        }
        self.refresh()?;
        Ok(added)
    }
}
