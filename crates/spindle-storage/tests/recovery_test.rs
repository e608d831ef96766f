//! Media-fault recovery through the public API.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use pretty_assertions::assert_eq;
use spindle_storage::{
    ArchiveRegistry, MemoryDevice, MountOptions, RecoveryNotifier, RegistryConfig, RetryPolicy,
    StorageError,
};
use spindle_test_utils::{ArchiveBuilder, FaultyDevice, RecordingNotifier, patterned_bytes};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn archive() -> (Vec<u8>, Vec<(String, Vec<u8>)>) {
    let mut builder = ArchiveBuilder::new();
    let mut files = Vec::new();
    for i in 0..12usize {
        let name = format!("level/chunk{i}.dat");
        let data = patterned_bytes(3000 + i * 100, i as u8);
        builder = if i % 2 == 0 {
            builder.stored(&name, data.clone())
        } else {
            builder.compressed(&name, data.clone())
        };
        files.push((name, data));
    }
    (builder.build(), files)
}

fn faulty_device(image: Vec<u8>) -> FaultyDevice {
    let memory = MemoryDevice::default();
    memory.insert("disc.spk", image);
    FaultyDevice::new(memory)
}

fn quick_retry() -> RegistryConfig {
    RegistryConfig::default().with_retry(RetryPolicy::default().with_backoff(Duration::from_millis(1)))
}

fn read_all(registry: &ArchiveRegistry, name: &str) -> Result<Vec<u8>, StorageError> {
    let mut cursor = registry.open(name)?;
    let mut out = vec![0u8; cursor.len() as usize];
    let mut filled = 0;
    while filled < out.len() {
        filled += cursor.read(&mut out[filled..])?;
    }
    Ok(out)
}

#[test]
fn test_consumer_read_survives_media_faults() {
    let (image, files) = archive();
    let device = faulty_device(image);
    let notifier = Arc::new(RecordingNotifier::default());
    let registry = ArchiveRegistry::new(quick_retry(), Arc::new(device.clone()), notifier.clone())
        .expect("registry");
    registry
        .mount(
            "disc.spk",
            MountOptions::new(4096, 1024).with_background_thread(false),
        )
        .expect("mount");

    device.fail_next(3);
    let (name, data) = &files[4];
    assert_eq!(&read_all(&registry, name).expect("read through faults"), data);
    assert_eq!(notifier.attempts(), vec![1, 2, 3]);
    assert_eq!(notifier.restorations(), vec![3]);
    assert_eq!(notifier.paths()[0], Path::new("disc.spk"));
    assert_eq!(device.injected(), 3);
}

#[test]
fn test_bounded_retry_surfaces_fault_and_cursor_recovers() {
    let (image, files) = archive();
    let device = faulty_device(image);
    let notifier = Arc::new(RecordingNotifier::default());
    let config = RegistryConfig::default().with_retry(
        RetryPolicy::default()
            .with_backoff(Duration::from_millis(1))
            .with_max_attempts(2),
    );
    let registry =
        ArchiveRegistry::new(config, Arc::new(device.clone()), notifier.clone()).expect("registry");
    registry
        .mount(
            "disc.spk",
            MountOptions::new(4096, 1024).with_background_thread(false),
        )
        .expect("mount");

    let (name, data) = &files[7];
    let mut cursor = registry.open(name).expect("open");
    device.fail_next(2);
    let mut buf = vec![0u8; data.len()];
    let err = cursor.read(&mut buf).expect_err("media stays missing");
    assert!(matches!(err, StorageError::MediaFault { attempts: 2, .. }), "{err}");
    assert_eq!(cursor.tell(), 0);

    // Media is back; the same cursor continues.
    let mut out = Vec::new();
    cursor.read_to_end(&mut out).expect("read after fault");
    assert_eq!(&out, data);
    assert_eq!(notifier.attempts(), vec![1, 2]);
}

#[test]
fn test_fault_during_mount_is_retried() {
    let (image, files) = archive();
    let device = faulty_device(image);
    let notifier = Arc::new(RecordingNotifier::default());
    let registry = ArchiveRegistry::new(quick_retry(), Arc::new(device.clone()), notifier.clone())
        .expect("registry");

    device.fail_next(1);
    registry
        .mount("disc.spk", MountOptions::new(4096, 1024))
        .expect("mount through fault");
    assert_eq!(notifier.attempts(), vec![1]);
    assert_eq!(&read_all(&registry, &files[0].0).expect("read"), &files[0].1);
}

/// Reinserts the media once the user has been asked `after` times
struct ReinsertingNotifier {
    device: FaultyDevice,
    after: u32,
    recorder: RecordingNotifier,
}

impl RecoveryNotifier for ReinsertingNotifier {
    fn media_unavailable(&self, path: &Path, attempt: u32) {
        self.recorder.media_unavailable(path, attempt);
        if attempt >= self.after {
            self.device.restore_media();
        }
    }

    fn media_restored(&self, path: &Path, failed_attempts: u32) {
        self.recorder.media_restored(path, failed_attempts);
    }
}

#[test]
fn test_producer_waits_for_reinserted_media() {
    let (image, files) = archive();
    let device = faulty_device(image);
    // Directory and the first chunks stay readable; the rest is "ejected".
    device.eject_from(4096);
    let notifier = Arc::new(ReinsertingNotifier {
        device: device.clone(),
        after: 3,
        recorder: RecordingNotifier::default(),
    });
    let registry = ArchiveRegistry::new(quick_retry(), Arc::new(device.clone()), notifier.clone())
        .expect("registry");
    registry
        .mount("disc.spk", MountOptions::new(8192, 1024))
        .expect("mount");

    for (name, data) in &files {
        assert_eq!(&read_all(&registry, name).expect("read"), data, "{name}");
    }
    assert_eq!(notifier.recorder.attempts(), vec![1, 2, 3]);
    assert_eq!(notifier.recorder.restorations(), vec![3]);
}

#[test]
fn test_unmount_cancels_producer_retry() {
    let (image, _) = archive();
    let device = faulty_device(image);
    device.eject_from(4096);
    let notifier = Arc::new(RecordingNotifier::default());
    let registry = ArchiveRegistry::new(quick_retry(), Arc::new(device.clone()), notifier.clone())
        .expect("registry");
    let id = registry
        .mount("disc.spk", MountOptions::new(8192, 1024))
        .expect("mount");

    let deadline = Instant::now() + Duration::from_secs(10);
    while device.injected() < 3 {
        assert!(Instant::now() < deadline, "producer never hit the ejected region");
        std::thread::sleep(Duration::from_millis(2));
    }

    registry.unmount(id).expect("unmount joins the producer");
    let settled = device.injected();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(device.injected(), settled);
    assert!(registry.mounted().is_empty());
}
