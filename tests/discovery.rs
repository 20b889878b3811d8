//! Gap healing and seeding against a migrated database.

use osflow::models::{EntityStatus, Stage};
use osflow::policy::{GapHealer, SeedConfig, Seeder};
use osflow::repository::{migrations, DbContext, StatusStore};
use tempfile::{tempdir, TempDir};

async fn download_store() -> (TempDir, StatusStore) {
    let dir = tempdir().unwrap();
    let db = dir.path().join("osflow.db");
    migrations::run_migrations(&db.display().to_string())
        .await
        .unwrap();
    let ctx = DbContext::from_sqlite_path(&db).unwrap();
    (dir, ctx.status_store(Stage::Download))
}

async fn pending_sorted(store: &StatusStore) -> Vec<i64> {
    let mut ids = store.list_ids(&[EntityStatus::Pending], None).await.unwrap();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn test_heal_fills_gaps_without_touching_existing_rows() {
    let (_dir, store) = download_store().await;
    store.upsert(1, EntityStatus::Done, None).await.unwrap();
    store.upsert(2, EntityStatus::Failed, None).await.unwrap();
    store.upsert(5, EntityStatus::Awaiting, None).await.unwrap();
    store.upsert(7, EntityStatus::Pending, None).await.unwrap();

    let healer = GapHealer::new(store.clone());
    assert_eq!(healer.heal().await.unwrap(), vec![3, 4, 6]);

    assert_eq!(store.all_ids().await.unwrap(), vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(pending_sorted(&store).await, vec![3, 4, 6, 7]);
    assert_eq!(store.get(1).await.unwrap().unwrap().status, EntityStatus::Done);
    assert_eq!(store.get(2).await.unwrap().unwrap().status, EntityStatus::Failed);
    assert_eq!(store.get(5).await.unwrap().unwrap().status, EntityStatus::Awaiting);

    assert!(healer.heal().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_first_seed_takes_recent_window_then_extends() {
    let (_dir, store) = download_store().await;
    let seeder = Seeder::new(
        store.clone(),
        SeedConfig {
            window: 10,
            min_id: None,
        },
    );

    assert_eq!(seeder.seed(100).await.unwrap(), (91..=100).collect::<Vec<_>>());
    assert_eq!(pending_sorted(&store).await, (91..=100).collect::<Vec<_>>());

    // Later runs pick up only what is new.
    store.upsert(100, EntityStatus::Done, None).await.unwrap();
    assert_eq!(seeder.seed(103).await.unwrap(), vec![101, 102, 103]);
    assert!(seeder.seed(103).await.unwrap().is_empty());
    assert!(seeder.seed(90).await.unwrap().is_empty());
    assert_eq!(store.get(100).await.unwrap().unwrap().status, EntityStatus::Done);
    assert_eq!(store.max_id().await.unwrap(), Some(103));
}

#[tokio::test]
async fn test_first_seed_honors_minimum_id() {
    let (_dir, store) = download_store().await;
    let config = SeedConfig {
        window: 10,
        min_id: Some(50),
    };

    // Portal still below the minimum: nothing happens, and nothing is stored.
    assert!(Seeder::new(store.clone(), config)
        .seed(40)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.max_id().await.unwrap(), None);

    let seeded = Seeder::new(store.clone(), config).seed(60).await.unwrap();
    assert_eq!(seeded, (50..=60).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_small_portal_seeds_from_one() {
    let (_dir, store) = download_store().await;
    let seeded = Seeder::new(store.clone(), SeedConfig::default())
        .seed(4)
        .await
        .unwrap();
    assert_eq!(seeded, vec![1, 2, 3, 4]);
}
