/// End-to-end shadowing engine tests.
///
/// These exercise `ShadowEngine::create_shadow`/`promote_shadow` against a
/// real temporary filesystem through the `StdFs` capability, rather than
/// the Windows-only `ReadDirectoryChangesW`/IOCP notification source --
/// the engine's event handling is independent of where events come from,
/// so driving it directly covers the same invariants (I1, I2, I3) an
/// end-to-end OS-level test would, without requiring a live directory
/// watch.
use shadow_core::fs::StdFs;
use shadow_core::{error::ShadowError, shadow::{ShadowEngine, BACKUP_DIR_NAME}};
use std::sync::Arc;
use tempfile::TempDir;

fn build_engine(source: &TempDir, backup: &TempDir) -> Arc<ShadowEngine> {
    ShadowEngine::new_with_fs(Arc::new(StdFs::new()), source.path(), backup.path())
        .expect("engine init should succeed against a real tempdir")
}

/// Scenario 1 (spec §8): delete-then-verify.
#[test]
fn delete_then_verify_restores_content() {
    let source = TempDir::new().unwrap();
    let backup = TempDir::new().unwrap();
    std::fs::create_dir_all(source.path().join("a")).unwrap();
    std::fs::write(source.path().join("a/b.txt"), b"hello").unwrap();

    let engine = build_engine(&source, &backup);
    engine.create_shadow("a/b.txt").unwrap();

    std::fs::remove_file(source.path().join("a/b.txt")).unwrap();
    engine.promote_shadow("a/b.txt").unwrap();

    let restored = backup.path().join(BACKUP_DIR_NAME).join("a/b.txt");
    assert_eq!(std::fs::read(restored).unwrap(), b"hello");
    assert!(engine.is_empty());
}

/// I1: the index never holds two entries that collide under
/// case-insensitive comparison, even when two differently-cased events
/// arrive for what is really the same file.
#[test]
fn index_uniqueness_holds_under_case_insensitive_collision() {
    let source = TempDir::new().unwrap();
    let backup = TempDir::new().unwrap();
    std::fs::write(source.path().join("Report.TXT"), b"content").unwrap();

    let engine = build_engine(&source, &backup);
    engine.create_shadow("Report.TXT").unwrap();
    let err = engine.create_shadow("report.txt").unwrap_err();
    assert!(matches!(err, ShadowError::IndexCollision));
    assert_eq!(engine.len(), 1);
}

/// I2: content preservation survives a concurrent flurry of unrelated
/// creates and deletes around the tracked file.
#[test]
fn content_preserved_amid_unrelated_activity() {
    let source = TempDir::new().unwrap();
    let backup = TempDir::new().unwrap();
    std::fs::write(source.path().join("keep.bin"), b"precious bytes").unwrap();

    let engine = build_engine(&source, &backup);
    engine.create_shadow("keep.bin").unwrap();

    for i in 0..20 {
        let name = format!("noise{i}.tmp");
        std::fs::write(source.path().join(&name), b"noise").unwrap();
        engine.create_shadow(&name).unwrap();
        std::fs::remove_file(source.path().join(&name)).unwrap();
        engine.promote_shadow(&name).unwrap();
    }

    std::fs::remove_file(source.path().join("keep.bin")).unwrap();
    engine.promote_shadow("keep.bin").unwrap();

    let restored = backup.path().join(BACKUP_DIR_NAME).join("keep.bin");
    assert_eq!(std::fs::read(restored).unwrap(), b"precious bytes");
}

/// Scenario 3 (spec §8): promotion collision produces a numeric suffix
/// while leaving the pre-existing backup file untouched.
#[test]
fn promotion_collision_preserves_existing_backup() {
    let source = TempDir::new().unwrap();
    let backup = TempDir::new().unwrap();
    let promoted = backup.path().join(BACKUP_DIR_NAME);
    std::fs::create_dir_all(&promoted).unwrap();
    std::fs::write(promoted.join("c.txt"), b"old").unwrap();
    std::fs::write(source.path().join("c.txt"), b"new").unwrap();

    let engine = build_engine(&source, &backup);
    engine.create_shadow("c.txt").unwrap();
    std::fs::remove_file(source.path().join("c.txt")).unwrap();
    engine.promote_shadow("c.txt").unwrap();

    assert_eq!(std::fs::read(promoted.join("c.txt")).unwrap(), b"old");
    assert_eq!(std::fs::read(promoted.join("c.txt.1")).unwrap(), b"new");
}

/// Scenario 4 (spec §8) / I3: a backup directory nested inside the source
/// tree is excluded from shadowing entirely.
#[test]
fn events_under_nested_backup_dir_are_excluded() {
    let source = TempDir::new().unwrap();
    let backup_path = source.path().join("backup_area");
    std::fs::create_dir_all(&backup_path).unwrap();
    let backup = TempDir::new().unwrap(); // unused structurally; engine takes the nested path directly
    let _ = &backup;

    let engine = ShadowEngine::new_with_fs(
        Arc::new(StdFs::new()),
        source.path(),
        &backup_path,
    )
    .unwrap();

    std::fs::write(backup_path.join("anything.txt"), b"noise").unwrap();
    engine.create_shadow("backup_area/anything.txt").unwrap();
    assert!(engine.is_empty());
}

/// A file whose REMOVED event arrives with no matching tracked shadow
/// (e.g. it existed before monitoring started) is a silent no-op.
#[test]
fn promote_without_prior_create_shadow_is_noop() {
    let source = TempDir::new().unwrap();
    let backup = TempDir::new().unwrap();
    let engine = build_engine(&source, &backup);

    engine.promote_shadow("never_tracked.txt").unwrap();
    assert!(engine.is_empty());
    let promoted = backup.path().join(BACKUP_DIR_NAME).join("never_tracked.txt");
    assert!(!promoted.exists());
}
