use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use benji_common::{Config, VersionStatus};
use benji_engine::{
    BackupRequest, CleanupOptions, Engine, RestoreRequest, ScrubMode,
};
use benji_io::hints::Hint;
use benji_meta::MetaStore;

const MIB: usize = 1024 * 1024;
const BLOCK: usize = 4 * MIB;

fn test_engine(dir: &Path) -> Engine {
    let yaml = format!(
        r#"
configurationVersion: "1"
databaseEngine: "sqlite:{db}"
blockSize: 4194304
defaultStorage: local
storages:
  - name: local
    module: file
    configuration:
      path: {objects}
transforms:
  - name: compress
    module: zstd
    configuration:
      level: 1
"#,
        db = dir.join("meta.sqlite").display(),
        objects = dir.join("objects").display(),
    );
    let config = Config::parse(&yaml).unwrap();
    MetaStore::open(&config.database_engine).unwrap().init(false).unwrap();
    Engine::open(config).unwrap()
}

fn backup_request(source: &Path, volume: &str) -> BackupRequest {
    BackupRequest {
        source: format!("file:{}", source.display()),
        volume: volume.to_string(),
        snapshot: String::new(),
        base_version: None,
        hints: None,
        uid: None,
        labels: BTreeMap::new(),
    }
}

/// Three 4 MiB blocks `[A, A, B]`.
fn aab_image() -> Vec<u8> {
    let mut image = Vec::with_capacity(3 * BLOCK);
    image.extend(std::iter::repeat(0x41u8).take(BLOCK));
    image.extend(std::iter::repeat(0x41u8).take(BLOCK));
    image.extend(std::iter::repeat(0x42u8).take(BLOCK));
    image
}

#[test]
fn fresh_backup_deduplicates_repeated_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();

    let version = engine.backup(backup_request(&source, "vm1")).unwrap();
    assert_eq!(version.size, 12582912);
    assert_eq!(version.status, VersionStatus::Valid);
    assert_eq!(version.bytes_deduplicated, 4194304);
    assert_eq!(version.bytes_read, 12582912);

    let blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&version.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(blocks.len(), 3);
    let unique: HashSet<_> = blocks.iter().filter_map(|b| b.uid).collect();
    assert_eq!(unique.len(), 2);
    assert_eq!(blocks[0].uid, blocks[1].uid);
    assert_ne!(blocks[0].uid, blocks[2].uid);

    let storage = engine.storage("local").unwrap();
    assert_eq!(storage.list_block_uids().unwrap().len(), 2);
}

#[test]
fn all_zero_source_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("zeros.raw");
    std::fs::write(&source, vec![0u8; 8 * MIB]).unwrap();

    let version = engine.backup(backup_request(&source, "vm1")).unwrap();
    assert_eq!(version.bytes_sparse, 8388608);
    assert_eq!(version.bytes_written, 0);

    let blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&version.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(blocks.len(), 2);
    assert!(blocks.iter().all(|b| b.is_sparse()));

    let storage = engine.storage("local").unwrap();
    assert!(storage.list_block_uids().unwrap().is_empty());
}

#[test]
fn identical_backup_is_fully_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();

    let first = engine.backup(backup_request(&source, "vm1")).unwrap();
    let storage = engine.storage("local").unwrap();
    let objects_after_first = storage.list_block_uids().unwrap().len();

    let second = engine.backup(backup_request(&source, "vm1")).unwrap();
    assert_eq!(second.bytes_written, 0);
    assert_eq!(second.bytes_deduplicated, second.size);
    assert_eq!(storage.list_block_uids().unwrap().len(), objects_after_first);
    assert_ne!(first.uid, second.uid);
}

#[test]
fn restore_roundtrips_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    // Non-uniform content so blocks differ and the tail block is short.
    let mut image = vec![0u8; 2 * BLOCK + 1000];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let source = dir.path().join("src.raw");
    std::fs::write(&source, &image).unwrap();

    let version = engine.backup(backup_request(&source, "vm1")).unwrap();

    let destination = dir.path().join("restored.raw");
    let report = engine
        .restore(RestoreRequest {
            version: version.uid.clone(),
            destination: format!("file:{}", destination.display()),
            sparse: false,
            force: false,
            database_less: false,
            metadata_storage: None,
        })
        .unwrap();
    assert_eq!(report.blocks_failed, 0);
    assert_eq!(std::fs::read(&destination).unwrap(), image);
}

#[test]
fn database_less_restore_uses_the_embedded_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let version = engine.backup(backup_request(&source, "vm1")).unwrap();

    let destination = dir.path().join("restored.raw");
    let report = engine
        .restore(RestoreRequest {
            version: version.uid.clone(),
            destination: format!("file:{}", destination.display()),
            sparse: false,
            force: false,
            database_less: true,
            metadata_storage: None,
        })
        .unwrap();
    assert_eq!(report.blocks_failed, 0);
    assert_eq!(std::fs::read(&destination).unwrap(), aab_image());
}

#[test]
fn differential_backup_reads_only_hinted_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let base = engine.backup(backup_request(&source, "vm1")).unwrap();

    // Flip the first byte and hint only the first block as changed.
    let mut image = aab_image();
    image[0] = 0x01;
    std::fs::write(&source, &image).unwrap();

    let mut request = backup_request(&source, "vm1");
    request.base_version = Some(base.uid.clone());
    request.hints = Some(vec![Hint {
        offset: 0,
        length: BLOCK as u64,
        used: true,
    }]);
    let differential = engine.backup(request).unwrap();

    assert!(differential.bytes_read <= 4194304);

    let base_blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&base.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    let new_blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&differential.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(new_blocks.len(), 3);
    assert_ne!(new_blocks[0].uid, base_blocks[0].uid);
    assert_eq!(new_blocks[1].uid, base_blocks[1].uid);
    assert_eq!(new_blocks[2].uid, base_blocks[2].uid);
}

#[test]
fn base_without_hints_reads_the_entire_source() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let base = engine.backup(backup_request(&source, "vm1")).unwrap();

    // The source diverges after the base backup; with no hints the engine
    // must notice by reading everything, not by trusting the base plan.
    let mut image = aab_image();
    image[0] = 0x01;
    std::fs::write(&source, &image).unwrap();

    let mut request = backup_request(&source, "vm1");
    request.base_version = Some(base.uid.clone());
    let second = engine.backup(request).unwrap();

    assert_eq!(second.bytes_read, 12582912);

    let base_blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&base.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    let new_blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&second.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    // The changed block was re-read and stored as a new object; the
    // unchanged blocks still land on the base's objects via content dedup.
    assert_ne!(new_blocks[0].uid, base_blocks[0].uid);
    assert_ne!(new_blocks[0].checksum, base_blocks[0].checksum);
    assert_eq!(new_blocks[1].uid, base_blocks[1].uid);
    assert_eq!(new_blocks[2].uid, base_blocks[2].uid);

    let destination = dir.path().join("restored.raw");
    let report = engine
        .restore(RestoreRequest {
            version: second.uid.clone(),
            destination: format!("file:{}", destination.display()),
            sparse: false,
            force: false,
            database_less: false,
            metadata_storage: None,
        })
        .unwrap();
    assert_eq!(report.blocks_failed, 0);
    assert_eq!(std::fs::read(&destination).unwrap(), image);
}

#[test]
fn deep_scrub_detects_corruption_and_restore_continues() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let first = engine.backup(backup_request(&source, "vm1")).unwrap();
    // A second version sharing every stored object.
    let second = engine.backup(backup_request(&source, "vm1")).unwrap();

    // Corrupt the stored object behind block 0.
    let blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&first.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    let victim = blocks[0].uid.unwrap();
    let object = dir.path().join("objects").join(victim.object_key());
    let mut data = std::fs::read(&object).unwrap();
    data[0] ^= 0xff;
    std::fs::write(&object, &data).unwrap();

    // Both rows referencing the corrupted object fail.
    let report = engine
        .scrub(&first.uid, ScrubMode::Deep { source: None }, 100)
        .unwrap();
    assert_eq!(report.blocks_failed, 2);

    // Invalidity propagates to every version referencing the block.
    assert_eq!(
        engine.meta().version(&first.uid).unwrap().status,
        VersionStatus::Invalid
    );
    assert_eq!(
        engine.meta().version(&second.uid).unwrap().status,
        VersionStatus::Invalid
    );

    // Restore is best-effort: the rest of the image still lands.
    let destination = dir.path().join("restored.raw");
    let restore = engine
        .restore(RestoreRequest {
            version: first.uid.clone(),
            destination: format!("file:{}", destination.display()),
            sparse: false,
            force: false,
            database_less: false,
            metadata_storage: None,
        })
        .unwrap();
    assert_eq!(restore.blocks_failed, 2);
    assert_eq!(restore.blocks_restored, 1);
}

#[test]
fn light_scrub_passes_on_intact_storage() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let version = engine.backup(backup_request(&source, "vm1")).unwrap();

    let report = engine.scrub(&version.uid, ScrubMode::Light, 100).unwrap();
    assert!(report.passed());
    assert_eq!(report.blocks_checked, 3);
    assert_eq!(
        engine.meta().version(&version.uid).unwrap().status,
        VersionStatus::Valid
    );
}

#[test]
fn full_deep_scrub_restores_validity() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let version = engine.backup(backup_request(&source, "vm1")).unwrap();

    // Falsely mark a block invalid, as a failed partial scrub would.
    let blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&version.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    engine
        .meta()
        .mark_block_invalid(&blocks[2].uid.unwrap())
        .unwrap();
    assert_eq!(
        engine.meta().version(&version.uid).unwrap().status,
        VersionStatus::Invalid
    );

    // The storage is actually intact; a full deep scrub heals the state.
    let report = engine
        .scrub(&version.uid, ScrubMode::Deep { source: None }, 100)
        .unwrap();
    assert!(report.passed());
    assert!(report.full_coverage);
    assert_eq!(
        engine.meta().version(&version.uid).unwrap().status,
        VersionStatus::Valid
    );
}

#[test]
fn rm_and_cleanup_release_exactly_the_exclusive_objects() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    // Version one: [A, A, B]; version two: [A, C] — A is shared.
    let source_one = dir.path().join("one.raw");
    std::fs::write(&source_one, aab_image()).unwrap();
    let one = engine.backup(backup_request(&source_one, "vm1")).unwrap();

    let mut two_image = Vec::new();
    two_image.extend(std::iter::repeat(0x41u8).take(BLOCK));
    two_image.extend(std::iter::repeat(0x43u8).take(BLOCK));
    let source_two = dir.path().join("two.raw");
    std::fs::write(&source_two, &two_image).unwrap();
    let two = engine.backup(backup_request(&source_two, "vm2")).unwrap();

    let storage = engine.storage("local").unwrap();
    // A, B, C.
    assert_eq!(storage.list_block_uids().unwrap().len(), 3);

    // Remove version one; B is exclusive to it, A is shared with two.
    engine.remove(&one.uid, true, false).unwrap();
    let report = engine
        .cleanup(CleanupOptions {
            grace_hours: 0.0,
            full: false,
            override_lock: false,
        })
        .unwrap();
    assert_eq!(report.objects_deleted, 1);
    assert_eq!(report.candidates_rescued, 1);
    assert_eq!(storage.list_block_uids().unwrap().len(), 2);

    // Version two still restores.
    let destination = dir.path().join("restored.raw");
    let restore = engine
        .restore(RestoreRequest {
            version: two.uid.clone(),
            destination: format!("file:{}", destination.display()),
            sparse: false,
            force: false,
            database_less: false,
            metadata_storage: None,
        })
        .unwrap();
    assert_eq!(restore.blocks_failed, 0);
    assert_eq!(std::fs::read(&destination).unwrap(), two_image);
}

#[test]
fn removal_policy_refuses_young_and_protected_versions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, vec![1u8; MIB]).unwrap();
    let version = engine.backup(backup_request(&source, "vm1")).unwrap();

    // Too young without force.
    assert!(engine.remove(&version.uid, false, false).is_err());

    engine.protect(&version.uid, true).unwrap();
    // Protected beats force.
    assert!(engine.remove(&version.uid, true, false).is_err());

    engine.protect(&version.uid, false).unwrap();
    engine.remove(&version.uid, true, false).unwrap();
}

#[test]
fn enforce_spares_young_versions_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    for i in 0..4u8 {
        std::fs::write(&source, vec![i + 1; MIB]).unwrap();
        engine.backup(backup_request(&source, "vm1")).unwrap();
    }

    // All four versions were created just now, far inside the minimum-age
    // window; the policy alone would keep one.
    let report = engine.enforce("latest1", None, false, false).unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.kept.len(), 4);

    // Idempotent.
    let again = engine.enforce("latest1", None, false, false).unwrap();
    assert_eq!(again.kept.len(), 4);
    assert!(again.removed.is_empty());
}

#[test]
fn cow_fixation_builds_a_protected_version() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let original = engine.backup(backup_request(&source, "vm1")).unwrap();

    let storage = engine.storage("local").unwrap();
    let objects_before: BTreeSet<_> = storage.list_block_uids().unwrap().into_iter().collect();

    // One NBD write of 0xFF at offset 0: block 0 is dirty.
    let mut dirty_block = vec![0x41u8; BLOCK];
    dirty_block[0] = 0xff;
    let dirty_indices: BTreeSet<u64> = BTreeSet::from([0]);

    let fixated = engine
        .fixate_cow_version(&original.uid, &dirty_indices, &|idx| {
            assert_eq!(idx, 0);
            Ok(dirty_block.clone())
        })
        .unwrap();

    assert!(fixated.protected);
    assert!(fixated.snapshot.starts_with(&format!("nbd-cow-{}-", original.uid)));
    assert_eq!(fixated.status, VersionStatus::Valid);

    let original_blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&original.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    let fixated_blocks: Vec<_> = engine
        .meta()
        .stream_blocks(&fixated.uid)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(fixated_blocks.len(), 3);
    assert_ne!(fixated_blocks[0].uid, original_blocks[0].uid);
    assert_eq!(fixated_blocks[1].uid, original_blocks[1].uid);
    assert_eq!(fixated_blocks[2].uid, original_blocks[2].uid);

    // The original's objects are untouched; exactly one object was added.
    let objects_after: BTreeSet<_> = storage.list_block_uids().unwrap().into_iter().collect();
    assert!(objects_after.is_superset(&objects_before));
    assert_eq!(objects_after.len(), objects_before.len() + 1);
}

#[test]
fn storage_usage_attributes_shared_and_exclusive_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());

    let source = dir.path().join("src.raw");
    std::fs::write(&source, aab_image()).unwrap();
    let one = engine.backup(backup_request(&source, "vm1")).unwrap();
    let two = engine.backup(backup_request(&source, "vm1")).unwrap();

    let usage = engine.storage_usage(None).unwrap();
    assert_eq!(usage.len(), 2);
    for (uid, report) in usage {
        assert!(uid == one.uid || uid == two.uid);
        // Both versions reference the same two objects.
        assert_eq!(report.exclusive, 0);
        assert_eq!(report.shared, 2 * BLOCK as u64);
    }
}
