// GC sweeps: shared-object reclamation, partial failures, policies and exclusion.

mod common;

use common::{TestEngine, seeded_bytes, test_store_path};
use larder_core::config::GcConfig;
use larder_core::{CacheName, NarHash};
use larder_engine::{CacheSettings, EngineError, GcPolicy, PushOptions, ReclaimTarget};
use larder_metadata::models::{GcSweepRow, GcSweepState};
use std::collections::HashSet;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[tokio::test]
async fn test_shared_object_survives_until_last_entry_is_gone() {
    let t = TestEngine::new().await;
    let team_a = t.create_cache("team-a").await;
    let team_b = t.create_cache("team-b").await;
    let foo = test_store_path("foo");
    let data = seeded_bytes(500, 500 * 1024);

    let a = t
        .engine
        .push_bytes(team_a, &foo, data.clone(), PushOptions::default())
        .await
        .unwrap();
    let b = t
        .engine
        .push_bytes(team_b, &foo, data.clone(), PushOptions::default())
        .await
        .unwrap();
    assert_eq!(a.nar_hash, b.nar_hash);
    assert!(b.deduplicated);
    assert_eq!(b.chunks_new, 0);

    // One physical copy.
    let manifest = t.engine.objects().get_object(&a.nar_hash).await.unwrap().manifest;
    let distinct: HashSet<_> = manifest.chunks.iter().map(|c| c.hash).collect();
    assert_eq!(t.store.chunk_keys().await.len(), distinct.len());
    assert_eq!(t.store.blob_writes(), distinct.len());

    t.engine.delete_cache_entry(team_a, &foo).await.unwrap();
    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.objects_reclaimed, 0);
    assert_eq!(report.chunks_reclaimed, 0);
    assert_eq!(report.bytes_freed, 0);

    let (_, pulled) = t.engine.pull_to_bytes(team_b, &foo).await.unwrap();
    assert_eq!(pulled, data);

    t.engine.delete_cache_entry(team_b, &foo).await.unwrap();
    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.objects_reclaimed, 1);
    assert_eq!(report.chunks_reclaimed, distinct.len() as u64);
    assert_eq!(report.bytes_freed, data.len() as u64);
    assert_eq!(report.chunk_delete_failures, 0);

    assert!(!t.engine.objects().contains(&a.nar_hash).await.unwrap());
    assert!(t.store.chunk_keys().await.is_empty());
    for hash in &distinct {
        assert_eq!(t.refcount(hash).await, None);
    }
}

#[tokio::test]
async fn test_failed_chunk_delete_is_retried_next_sweep() {
    let t = TestEngine::new().await;
    let cache = t.create_cache("flaky").await;
    let path = test_store_path("flaky-pkg");
    let pushed = t
        .engine
        .push_bytes(cache, &path, seeded_bytes(21, 100_000), PushOptions::default())
        .await
        .unwrap();
    let manifest = t.engine.objects().get_object(&pushed.nar_hash).await.unwrap().manifest;
    let stuck = manifest.chunks[0].hash;
    t.store.fail_deletes_for(&stuck.to_object_key());

    t.engine.delete_cache_entry(cache, &path).await.unwrap();
    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.objects_reclaimed, 1);
    assert_eq!(report.chunk_delete_failures, 1);
    assert_eq!(report.chunks_reclaimed, manifest.chunk_count() as u64 - 1);

    // Left at refcount 0 and claimable again.
    let row = t.engine.chunks().info(&stuck).await.unwrap().unwrap();
    assert_eq!(row.refcount, 0);
    assert_eq!(row.state, "valid");
    assert_eq!(t.store.chunk_keys().await, vec![stuck.to_object_key()]);

    t.store.heal();
    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.chunks_reclaimed, 1);
    assert_eq!(report.chunk_delete_failures, 0);
    assert!(t.store.chunk_keys().await.is_empty());
    assert!(t.engine.chunks().info(&stuck).await.unwrap().is_none());
}

#[tokio::test]
async fn test_only_one_sweep_runs_at_a_time() {
    let t = TestEngine::new().await;
    let cache = t.create_cache("exclusive").await;
    let path = test_store_path("busy");
    t.engine
        .push_bytes(cache, &path, seeded_bytes(4, 60_000), PushOptions::default())
        .await
        .unwrap();
    t.engine.delete_cache_entry(cache, &path).await.unwrap();

    let (first, second) = tokio::join!(
        t.engine.run_gc_sweep(Some(GcPolicy::immediate())),
        t.engine.run_gc_sweep(Some(GcPolicy::immediate())),
    );
    let reports = [first.unwrap(), second.unwrap()];
    assert_eq!(reports.iter().filter(|r| r.skipped).count(), 1);
    assert_eq!(reports.iter().map(|r| r.objects_reclaimed).sum::<u64>(), 1);
}

#[tokio::test]
async fn test_sweep_skips_while_another_process_holds_the_sweep() {
    let t = TestEngine::new().await;
    let foreign = GcSweepRow {
        sweep_id: Uuid::new_v4(),
        state: GcSweepState::Reclaiming.as_str().to_string(),
        started_at: OffsetDateTime::now_utc(),
        finished_at: None,
        stats_json: None,
    };
    t.engine.metadata().begin_sweep(&foreign).await.unwrap();

    let report = t.engine.run_gc_sweep(None).await.unwrap();
    assert!(report.skipped);
    assert_eq!(report.sweep_id, None);

    // After a restart the abandoned sweep is failed and sweeping resumes.
    assert_eq!(t.engine.gc().recover().await.unwrap(), 1);
    let row = t.engine.metadata().get_sweep(foreign.sweep_id).await.unwrap().unwrap();
    assert_eq!(row.state, "failed");

    let report = t.engine.run_gc_sweep(None).await.unwrap();
    assert!(!report.skipped);
    let row = t
        .engine
        .metadata()
        .get_sweep(report.sweep_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, "finished");
    assert!(row.stats_json.is_some());
}

#[tokio::test]
async fn test_budget_reclaims_least_recently_used_first() {
    let t = TestEngine::new().await;
    let cache = t.create_cache("lru").await;

    let mut hashes = Vec::new();
    for i in 0..3u64 {
        let path = test_store_path(&format!("lru-{i}"));
        let pushed = t
            .engine
            .push_bytes(cache, &path, seeded_bytes(300 + i, 100_000), PushOptions::default())
            .await
            .unwrap();
        hashes.push((path, pushed.nar_hash));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Reading the oldest makes it the most recently used.
    t.engine.pull_to_bytes(cache, &hashes[0].0).await.unwrap();
    for (path, _) in &hashes {
        t.engine.delete_cache_entry(cache, path).await.unwrap();
    }

    let policy = GcPolicy::immediate().with_target(ReclaimTarget {
        budget_bytes: Some(150_000),
        max_objects: None,
    });
    let report = t.engine.run_gc_sweep(Some(policy)).await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.objects_reclaimed, 2);

    let objects = t.engine.objects();
    assert!(objects.contains(&hashes[0].1).await.unwrap());
    assert!(!objects.contains(&hashes[1].1).await.unwrap());
    assert!(!objects.contains(&hashes[2].1).await.unwrap());
    assert_eq!(objects.total_bytes().await.unwrap(), 100_000);
}

#[tokio::test]
async fn test_grace_period_protects_recent_objects_and_chunks() {
    let t = TestEngine::new().await;
    let cache = t.create_cache("grace").await;
    let path = test_store_path("fresh");
    let pushed = t
        .engine
        .push_bytes(cache, &path, seeded_bytes(31, 50_000), PushOptions::default())
        .await
        .unwrap();
    t.engine.delete_cache_entry(cache, &path).await.unwrap();

    let config = GcConfig {
        grace_period_secs: 3_600,
        ..GcConfig::default()
    };
    let report = t
        .engine
        .run_gc_sweep(Some(GcPolicy::from_config(&config)))
        .await
        .unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(report.chunks_reclaimed, 0);
    assert!(t.engine.objects().contains(&pushed.nar_hash).await.unwrap());
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let t = TestEngine::new().await;
    let cache = t.create_cache("dry").await;
    let path = test_store_path("dry-pkg");
    let pushed = t
        .engine
        .push_bytes(cache, &path, seeded_bytes(41, 70_000), PushOptions::default())
        .await
        .unwrap();
    t.engine.delete_cache_entry(cache, &path).await.unwrap();
    let keys_before = t.store.chunk_keys().await;

    let report = t
        .engine
        .run_gc_sweep(Some(GcPolicy::immediate().dry_run(true)))
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.candidates, 1);
    assert_eq!(report.objects_reclaimed, 0);
    assert_eq!(report.chunks_reclaimed, 0);

    assert!(t.engine.objects().contains(&pushed.nar_hash).await.unwrap());
    assert_eq!(t.store.chunk_keys().await, keys_before);
    assert!(
        t.engine
            .metadata()
            .get_recent_sweeps(10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_chunks_from_abandoned_push_are_reaped() {
    let t = TestEngine::new().await;
    let cache = t.create_cache("abandoned").await;
    let data = seeded_bytes(51, 90_000);

    let options = PushOptions {
        expected_nar_size: Some(1),
        ..PushOptions::default()
    };
    let err = t
        .engine
        .push_bytes(cache, &test_store_path("abandoned"), data.clone(), options)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Corruption { .. }));
    assert!(!t.store.chunk_keys().await.is_empty());
    assert!(!t.engine.objects().contains(&NarHash::compute(&data)).await.unwrap());

    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.objects_reclaimed, 0);
    assert!(report.chunks_reclaimed > 0);
    assert_eq!(report.bytes_freed, data.len() as u64);
    assert!(t.store.chunk_keys().await.is_empty());
}

#[tokio::test]
async fn test_undeletable_orphan_does_not_block_the_rest() {
    let t = TestEngine::with_config(|config| config.gc.batch_size = 1).await;
    let cache = t.create_cache("stuck-orphans").await;
    let options = || PushOptions {
        expected_nar_size: Some(1),
        ..PushOptions::default()
    };

    // Two abandoned pushes; every chunk of the older one refuses deletion.
    let older = seeded_bytes(71, 40_000);
    t.engine
        .push_bytes(cache, &test_store_path("older"), older, options())
        .await
        .unwrap_err();
    let stuck = t.store.chunk_keys().await;
    assert!(!stuck.is_empty());
    for key in &stuck {
        t.store.fail_deletes_for(key);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    let newer = seeded_bytes(72, 40_000);
    t.engine
        .push_bytes(cache, &test_store_path("newer"), newer.clone(), options())
        .await
        .unwrap_err();

    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.chunk_delete_failures, stuck.len() as u64);
    assert_eq!(report.bytes_freed, newer.len() as u64);

    let mut remaining = t.store.chunk_keys().await;
    remaining.sort();
    let mut expected = stuck.clone();
    expected.sort();
    assert_eq!(remaining, expected);

    // Later sweeps keep retrying the stuck ones and nothing else.
    for _ in 0..2 {
        let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
        assert_eq!(report.chunk_delete_failures, stuck.len() as u64);
        assert_eq!(report.chunks_reclaimed, 0);
    }

    t.store.heal();
    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.chunks_reclaimed, stuck.len() as u64);
    assert!(t.store.chunk_keys().await.is_empty());
}

#[tokio::test]
async fn test_dry_run_counts_objects_freed_by_expiry() {
    let t = TestEngine::new().await;
    let short = t
        .engine
        .create_cache(CacheSettings {
            retention_secs: Some(3_600),
            ..CacheSettings::new(CacheName::new("short-lived").unwrap())
        })
        .await
        .unwrap()
        .cache_id;
    let forever = t.create_cache("forever").await;

    // `alone` is only bound in the expiring cache; `kept` is also bound in
    // a cache without retention.
    let alone = test_store_path("alone");
    let kept = test_store_path("kept");
    let kept_data = seeded_bytes(82, 30_000);
    t.engine
        .push_bytes(short, &alone, seeded_bytes(81, 30_000), PushOptions::default())
        .await
        .unwrap();
    t.engine
        .push_bytes(short, &kept, kept_data.clone(), PushOptions::default())
        .await
        .unwrap();
    t.engine
        .push_bytes(forever, &kept, kept_data, PushOptions::default())
        .await
        .unwrap();
    let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(2);
    for path in [&alone, &kept] {
        t.engine
            .metadata()
            .record_access(short, path.hash().as_str(), long_ago)
            .await
            .unwrap();
    }

    let preview = t
        .engine
        .run_gc_sweep(Some(GcPolicy::immediate().dry_run(true)))
        .await
        .unwrap();
    assert_eq!(preview.entries_expired, 2);
    assert_eq!(preview.candidates, 1);
    assert_eq!(preview.objects_reclaimed, 0);
    t.engine.pull_to_bytes(short, &alone).await.unwrap();

    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.entries_expired, 2);
    assert_eq!(report.candidates, preview.candidates);
    assert_eq!(report.objects_reclaimed, 1);
    t.engine.pull_to_bytes(forever, &kept).await.unwrap();
}

#[tokio::test]
async fn test_entries_expire_per_cache_retention() {
    let t = TestEngine::new().await;
    let short = t
        .engine
        .create_cache(CacheSettings {
            retention_secs: Some(3_600),
            ..CacheSettings::new(CacheName::new("short-lived").unwrap())
        })
        .await
        .unwrap()
        .cache_id;
    let forever = t
        .engine
        .create_cache(CacheSettings {
            retention_secs: Some(0),
            ..CacheSettings::new(CacheName::new("forever").unwrap())
        })
        .await
        .unwrap()
        .cache_id;

    let path = test_store_path("aging");
    let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(2);
    for (cache, seed) in [(short, 61), (forever, 62)] {
        t.engine
            .push_bytes(cache, &path, seeded_bytes(seed, 30_000), PushOptions::default())
            .await
            .unwrap();
        t.engine
            .metadata()
            .record_access(cache, path.hash().as_str(), long_ago)
            .await
            .unwrap();
    }

    let report = t.engine.run_gc_sweep(Some(GcPolicy::immediate())).await.unwrap();
    assert_eq!(report.entries_expired, 1);
    assert_eq!(report.objects_reclaimed, 1);

    let err = t.engine.pull(short, &path).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    t.engine.pull_to_bytes(forever, &path).await.unwrap();
}
