#![allow(clippy::expect_used, clippy::panic)]

//! Mount an archive and stream entries out of it.
//!
//! Usage:
//!   SPINDLE_TEST_ARCHIVE=/path/to/disc.spk cargo run --example stream_archive \
//!       -p spindle-storage -- maps/town.bsp sounds/intro.wav
//!
//! Without `SPINDLE_TEST_ARCHIVE` a small demo archive is generated in a
//! temporary directory. Set `RUST_LOG=spindle_storage=debug` to watch the
//! ring fill and reposition.

use spindle_storage::{ArchiveRegistry, FsDevice, MountOptions, RecoveryNotifier, RegistryConfig};
use spindle_test_utils::{ArchiveBuilder, find_test_archive, patterned_bytes};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Asks the user to put the disc back
struct PromptNotifier;

impl RecoveryNotifier for PromptNotifier {
    fn media_unavailable(&self, path: &Path, attempt: u32) {
        eprintln!(
            "Please insert the disc containing {} (attempt {attempt})",
            path.display()
        );
    }

    fn media_restored(&self, path: &Path, failed_attempts: u32) {
        eprintln!("{} is back after {failed_attempts} attempts", path.display());
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let demo_dir = tempfile::tempdir().expect("failed to create temp dir");
    let mut names: Vec<String> = std::env::args().skip(1).collect();
    let path = if let Some(path) = find_test_archive() {
        path
    } else {
        println!("SPINDLE_TEST_ARCHIVE not set, generating a demo archive");
        names = vec![
            "readme.txt".to_string(),
            "maps/town.bsp".to_string(),
            "sounds/intro.wav".to_string(),
        ];
        ArchiveBuilder::new()
            .stored("readme.txt", b"spindle demo archive\n".to_vec())
            .compressed("maps/town.bsp", patterned_bytes(300_000, 3))
            .stored("sounds/intro.wav", patterned_bytes(150_000, 9))
            .preload(1)
            .write_to(demo_dir.path(), "demo.spk")
            .expect("failed to write demo archive")
    };

    let registry = ArchiveRegistry::new(
        RegistryConfig::default(),
        Arc::new(FsDevice::default()),
        Arc::new(PromptNotifier),
    )
    .expect("failed to create registry");
    let id = registry
        .mount(&path, MountOptions::default())
        .unwrap_or_else(|e| panic!("failed to mount {}: {e}", path.display()));

    let info = registry.info(id).expect("archive info");
    println!(
        "{}",
        serde_json::to_string_pretty(&info).expect("failed to serialize archive info")
    );

    for name in &names {
        let started = Instant::now();
        let mut cursor = match registry.open(name) {
            Ok(cursor) => cursor,
            Err(e) => {
                println!("{name}: {e}");
                continue;
            }
        };
        let mut total = 0usize;
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = cursor.read(&mut chunk).expect("read failed");
            if n == 0 {
                break;
            }
            total += n;
        }
        println!(
            "{name}: {total} bytes{}{} in {:?}",
            if cursor.is_compressed() { ", compressed" } else { "" },
            if cursor.is_preloaded() { ", preloaded" } else { "" },
            started.elapsed()
        );
    }

    let stats = registry.stats(id).expect("ring stats");
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).expect("failed to serialize ring stats")
    );
    registry.unmount(id).expect("failed to unmount");
}
