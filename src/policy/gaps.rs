//! Gap healing: ids skipped between the lowest and highest known id are
//! registered as pending so they are eventually processed.

use tracing::info;

use crate::models::EntityStatus;
use crate::repository::{DieselError, StatusStore};

/// Ids in `min..=max` of `known` that are not in `known`.
///
/// `known` may be unsorted and contain duplicates.
pub fn missing_ids(known: &[i64]) -> Vec<i64> {
    let mut sorted = known.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut missing = Vec::new();
    for pair in sorted.windows(2) {
        missing.extend(pair[0] + 1..pair[1]);
    }
    missing
}

/// Registers missing ids without touching rows that already exist.
pub struct GapHealer {
    store: StatusStore,
}

impl GapHealer {
    pub fn new(store: StatusStore) -> Self {
        Self { store }
    }

    /// Insert every gap as pending. Returns the ids that were created.
    pub async fn heal(&self) -> Result<Vec<i64>, DieselError> {
        let known = self.store.all_ids().await?;
        let missing = missing_ids(&known);
        if missing.is_empty() {
            return Ok(missing);
        }

        let inserted = self
            .store
            .insert_absent(&missing, EntityStatus::Pending)
            .await?;
        info!(
            stage = %self.store.stage(),
            gaps = missing.len(),
            inserted,
            "Healed id gaps"
        );
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ids() {
        assert_eq!(missing_ids(&[1, 2, 5, 7]), vec![3, 4, 6]);
        assert_eq!(missing_ids(&[7, 1, 5, 2, 5]), vec![3, 4, 6]);
        assert!(missing_ids(&[]).is_empty());
        assert!(missing_ids(&[42]).is_empty());
        assert!(missing_ids(&[10, 11, 12]).is_empty());
    }
}
