//! Transfer engine tests against the temp-dir-backed mock cluster
//!
//! The mock interprets the same command shapes the production transport
//! sends to `kubectl exec` and moves real tar streams, so these tests
//! exercise the wire format end to end: upload framing, download size
//! verification and atomic rename, and the directory archive round trip.

use std::fs;
use std::path::Path;

use podbuild::cluster::ExecTarget;
use podbuild::mock::MockCluster;
use podbuild::transfer::{TransferError, TransferSession};
use tempfile::TempDir;

fn target() -> ExecTarget {
    ExecTarget {
        pod: "artifact-pod-1".to_string(),
        container: "fileserver".to_string(),
    }
}

fn session(cluster: &MockCluster) -> TransferSession<'_> {
    TransferSession::new(cluster, target())
}

#[test]
fn test_upload_places_file_in_remote_dir() {
    let local = TempDir::new().unwrap();
    let source = local.path().join("init.bin");
    let content: Vec<u8> = (0u16..2048).flat_map(|n| n.to_le_bytes()).collect();
    fs::write(&source, &content).unwrap();

    let cluster = MockCluster::new();
    let sent = session(&cluster)
        .upload(&source, "/workspace/incoming")
        .unwrap();
    assert_eq!(sent, content.len() as u64);

    let uploaded = cluster.resolve("/workspace/incoming/init.bin");
    assert_eq!(fs::read(uploaded).unwrap(), content);
}

#[test]
fn test_upload_empty_file() {
    let local = TempDir::new().unwrap();
    let source = local.path().join("empty.cfg");
    fs::write(&source, b"").unwrap();

    let cluster = MockCluster::new();
    session(&cluster).upload(&source, "/workspace/incoming").unwrap();
    let uploaded = cluster.resolve("/workspace/incoming/empty.cfg");
    assert_eq!(fs::metadata(uploaded).unwrap().len(), 0);
}

#[test]
fn test_download_file_is_verified_and_renamed() {
    let cluster = MockCluster::new();
    let content = vec![0xA5u8; 100_000];
    cluster.seed_file("/artifacts/demo.img", &content);

    let out = TempDir::new().unwrap();
    let path = session(&cluster)
        .download("/artifacts/demo.img", out.path())
        .unwrap();

    assert_eq!(path, out.path().join("demo.img"));
    assert_eq!(fs::read(&path).unwrap(), content);
    // The staging file never survives a completed download.
    assert!(!out.path().join("demo.img.download").exists());
}

#[test]
fn test_truncated_download_reports_incomplete_and_stages_nothing() {
    let cluster = MockCluster::new();
    cluster.seed_file("/artifacts/demo.img", &[7u8; 50_000]);
    cluster.truncate_downloads_to(10_000);

    let out = TempDir::new().unwrap();
    let err = session(&cluster)
        .download("/artifacts/demo.img", out.path())
        .unwrap_err();

    match err {
        TransferError::Incomplete {
            expected, actual, ..
        } => {
            assert_eq!(expected, 50_000);
            assert_eq!(actual, 10_000);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Neither the final name nor the staging file is left behind.
    assert!(!out.path().join("demo.img").exists());
    assert!(!out.path().join("demo.img.download").exists());
}

#[test]
fn test_download_missing_path_is_fatal() {
    let cluster = MockCluster::new();
    let out = TempDir::new().unwrap();
    let err = session(&cluster)
        .download("/workspace/shared/missing.raw", out.path())
        .unwrap_err();
    assert!(matches!(err, TransferError::NotFound(_)));
    assert!(err
        .to_string()
        .contains("/workspace/shared/missing.raw does not exist on the pod"));
    assert!(fs::read_dir(out.path()).unwrap().next().is_none());
}

#[test]
fn test_directory_download_round_trips_the_tree() {
    let cluster = MockCluster::new();
    cluster.seed_file("/artifacts/demo/disk.img", &[1u8; 4096]);
    cluster.seed_file("/artifacts/demo/manifest.yml", b"name: demo\n");
    cluster.seed_file("/artifacts/demo/logs/build.log", b"step 1 ok\nstep 2 ok\n");

    #[cfg(unix)]
    std::os::unix::fs::symlink(
        "disk.img",
        cluster.resolve("/artifacts/demo/latest.img"),
    )
    .unwrap();

    let out = TempDir::new().unwrap();
    let dest = out.path().join("demo");
    let path = session(&cluster).download("/artifacts/demo", &dest).unwrap();
    assert_eq!(path, dest);

    assert_tree_matches(&cluster.resolve("/artifacts/demo"), &dest);

    #[cfg(unix)]
    {
        let link = fs::read_link(dest.join("latest.img")).unwrap();
        assert_eq!(link, Path::new("disk.img"));
    }
}

/// Every regular file in `source` must exist at the same relative path in
/// `dest` with identical bytes.
fn assert_tree_matches(source: &Path, dest: &Path) {
    for entry in fs::read_dir(source).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        let file_type = entry.file_type().unwrap();
        if file_type.is_dir() {
            assert_tree_matches(&entry.path(), &dest.join(&name));
        } else if file_type.is_file() {
            let expected = fs::read(entry.path()).unwrap();
            let actual = fs::read(dest.join(&name)).unwrap();
            assert_eq!(expected, actual, "content mismatch for {:?}", name);
        }
    }
}
