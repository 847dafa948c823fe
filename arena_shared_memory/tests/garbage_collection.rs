//! Collection of unreferenced values and configuration persistence

use arena_shared_memory::{
    Arena, ArenaOptions, ArenaResult, ConfigUpdate, ShareMode, ShareOptions, UserConfig, Value,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

static NEXT: AtomicU32 = AtomicU32::new(0);

fn unique_prefix() -> String {
    format!(
        "arena_gc_{}_{}_",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn attach(prefix: &str, config_path: Option<PathBuf>) -> Arena {
    Arena::attach(ArenaOptions {
        name_prefix: prefix.to_string(),
        config_path,
    })
    .expect("attach")
}

fn shm_path(name: &str) -> PathBuf {
    Path::new("/dev/shm").join(name.trim_start_matches('/'))
}

#[test]
fn test_segment_collected_after_both_processes_release() -> ArenaResult<()> {
    let prefix = unique_prefix();
    let mut p1 = attach(&prefix, None);
    let mut p2 = attach(&prefix, None);

    let x = p1.share(&Value::numeric(&[1, 4], &[1i32, 2, 3, 4])?, ShareOptions::default())?;
    let seen = p2.fetch_latest()?.expect("shared");

    let status = p2.status()?;
    let segment = &status.segments[0];
    assert_eq!(segment.procs_using, 2);
    let object = shm_path(&segment.name);
    assert!(object.exists());

    drop(x);
    assert_eq!(p1.gc()?, 0);
    let status = p1.status()?;
    assert_eq!(status.num_valid_segments, 1);
    assert_eq!(status.segments[0].procs_using, 1);

    drop(seen);
    assert_eq!(p2.gc()?, 1);
    assert_eq!(p2.status()?.num_valid_segments, 0);
    // P1 still maps it until its own next resync.
    assert!(object.exists());

    p1.gc()?;
    assert!(!object.exists());
    Ok(())
}

#[test]
fn test_persistent_segment_survives_collection() -> ArenaResult<()> {
    let prefix = unique_prefix();
    let mut p1 = attach(&prefix, None);
    let options = ShareOptions {
        key: Some("keep"),
        persistent: true,
        ..ShareOptions::default()
    };
    drop(p1.share(&Value::text("durable"), options)?);
    assert_eq!(p1.gc()?, 0);

    let status = p1.status()?;
    assert_eq!(status.num_valid_segments, 1);
    assert!(status.segments[0].persistent);
    assert_eq!(status.segments[0].procs_using, 0);

    let mut p2 = attach(&prefix, None);
    let fetched = p2.fetch_key("keep")?;
    assert_eq!(fetched.read().to_text().as_deref(), Some("durable"));

    // Explicit clear still removes it.
    assert_eq!(p1.clear()?, 1);
    assert_eq!(p1.status()?.num_valid_segments, 0);
    assert_eq!(fetched.read().to_text().as_deref(), Some("durable"));
    Ok(())
}

#[test]
fn test_disabled_gc_keeps_unreferenced_values() -> ArenaResult<()> {
    let prefix = unique_prefix();
    let mut p1 = attach(&prefix, None);
    p1.set_config(&ConfigUpdate {
        gc_enabled: Some(false),
        ..ConfigUpdate::default()
    })?;

    drop(p1.share(&Value::scalar(9.0), ShareOptions::default())?);
    assert_eq!(p1.gc()?, 0);
    let status = p1.status()?;
    assert_eq!(status.num_valid_segments, 1);
    assert_eq!(status.segments[0].procs_using, 0);
    assert!(!status.segments[0].fetched_here);

    // Fetching again re-materializes it.
    let again = p1.fetch_latest()?.expect("still shared");
    assert_eq!(again.read().to_vec::<f64>(), Some(vec![9.0]));
    Ok(())
}

#[test]
fn test_held_handle_blocks_collection() -> ArenaResult<()> {
    let prefix = unique_prefix();
    let mut p1 = attach(&prefix, None);
    let handle = p1.share(&Value::scalar(1.0), ShareOptions::default())?;
    let second = handle.clone();
    drop(handle);

    assert_eq!(p1.gc()?, 0);
    assert_eq!(p1.status()?.num_valid_segments, 1);
    drop(second);
    assert_eq!(p1.gc()?, 1);
    Ok(())
}

#[test]
fn test_last_process_writes_changed_config() -> ArenaResult<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("shmarena").join("config.toml");
    let prefix = unique_prefix();

    {
        let mut p1 = attach(&prefix, Some(path.clone()));
        let p2 = attach(&prefix, Some(path.clone()));
        p1.set_config(&ConfigUpdate {
            share_mode: Some(ShareMode::Overwrite),
            max_segments: Some(42),
            ..ConfigUpdate::default()
        })?;
        drop(p1);
        // Not the last process: nothing written yet.
        assert!(!path.exists());
        drop(p2);
    }

    let stored = UserConfig::load_or_default(&path)?;
    assert_eq!(stored.share_mode, ShareMode::Overwrite);
    assert_eq!(stored.max_segments, 42);

    let mut p3 = attach(&prefix, Some(path.clone()));
    assert_eq!(p3.config()?, stored);
    Ok(())
}

#[test]
fn test_unchanged_config_is_not_rewritten() -> ArenaResult<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("config.toml");
    let prefix = unique_prefix();

    drop(attach(&prefix, Some(path.clone())));
    // Defaults differ from a missing file, so the first teardown writes.
    assert!(path.exists());
    let written = std::fs::read_to_string(&path)?;

    std::fs::write(&path, format!("# operator note\n{written}"))?;
    drop(attach(&prefix, Some(path.clone())));
    let after = std::fs::read_to_string(&path)?;
    assert!(after.starts_with("# operator note"));
    Ok(())
}
