//! Decides which newly visible external ids become pending work.

use std::ops::RangeInclusive;

use tracing::{info, warn};

use crate::models::EntityStatus;
use crate::repository::{DieselError, StatusStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedConfig {
    /// How many of the most recent ids to take on the first run.
    pub window: u32,
    /// Starting id for the first run; overrides `window` when set.
    pub min_id: Option<i64>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            window: 10,
            min_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedPlan {
    Nothing,
    Range(RangeInclusive<i64>),
}

impl SeedPlan {
    pub fn ids(&self) -> Vec<i64> {
        match self {
            Self::Nothing => Vec::new(),
            Self::Range(range) => range.clone().collect(),
        }
    }
}

/// Plan the ids to seed given the highest stored id and the highest id the
/// external system currently shows.
pub fn plan_seed(known_max: Option<i64>, external_max: i64, config: &SeedConfig) -> SeedPlan {
    match known_max {
        Some(known) if external_max > known => SeedPlan::Range(known + 1..=external_max),
        Some(_) => SeedPlan::Nothing,
        None => match config.min_id {
            Some(min) if external_max < min => SeedPlan::Nothing,
            Some(min) => SeedPlan::Range(min..=external_max),
            None if config.window == 0 || external_max < 1 => SeedPlan::Nothing,
            None => {
                let start = (external_max - i64::from(config.window) + 1).max(1);
                SeedPlan::Range(start..=external_max)
            }
        },
    }
}

pub struct Seeder {
    store: StatusStore,
    config: SeedConfig,
}

impl Seeder {
    pub fn new(store: StatusStore, config: SeedConfig) -> Self {
        Self { store, config }
    }

    /// Register new ids up to `external_max` as pending. Returns the ids created.
    pub async fn seed(&self, external_max: i64) -> Result<Vec<i64>, DieselError> {
        let known_max = self.store.max_id().await?;
        let plan = plan_seed(known_max, external_max, &self.config);

        if plan == SeedPlan::Nothing {
            if known_max.is_none() {
                if let Some(min) = self.config.min_id {
                    warn!(
                        external_max,
                        min_id = min,
                        "Newest external id is below the configured minimum; nothing seeded"
                    );
                }
            }
            return Ok(Vec::new());
        }

        let ids = plan.ids();
        let inserted = self.store.insert_absent(&ids, EntityStatus::Pending).await?;
        info!(
            stage = %self.store.stage(),
            first = ids.first().copied(),
            last = ids.last().copied(),
            inserted,
            "Seeded new ids"
        );
        Ok(ids)
    }
}
