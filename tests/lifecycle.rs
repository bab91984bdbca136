//! End-to-end lifecycle tests against scratch trees.
//!
//! Runs the real driver with the kernel-facing roots (configfs, sysfs) and
//! the external tool suite replaced by scratch directories and shell
//! scripts, so the full chain-building and commit flow can be exercised
//! unprivileged. Actual device mounting needs a real LIO target and is out
//! of reach here.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use sha2::{Digest, Sha256};
use similar_asserts::assert_eq;

use blocklayer::{
    descriptor::BASE_LAYER_DIR, paths, CommitConfig, Driver, LayerDescriptor, LayerError,
    PollConfig, TargetConfig,
};

fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_driver(root: &Path) -> Driver {
    let tools = root.join(".tools");
    fs::create_dir_all(&tools).unwrap();
    let commit = CommitConfig {
        create_tool: fake_tool(&tools, "create", ": > \"$1\"; : > \"$2\""),
        commit_tool: fake_tool(&tools, "commit", "cat \"$1\" \"$2\" > \"$3\""),
        compress_tool: fake_tool(&tools, "compress", "cp \"$1\" \"$2\""),
        checksum_tool: fake_tool(&tools, "checksum", "echo manifest > \"$4\""),
        ..CommitConfig::default()
    };
    let target = TargetConfig {
        configfs_root: root.join(".configfs/target"),
        sysfs_scsi_root: root.join(".sysfs/scsi_device"),
        dev_root: root.join(".dev"),
        address_poll: PollConfig::new(Duration::from_millis(1), 3),
        device_poll: PollConfig::new(Duration::from_millis(1), 3),
        ..TargetConfig::default()
    };
    Driver::with_config(root, target, commit)
}

fn seed_diff(driver: &Driver, id: &str, url: &str, size: &str) {
    let diff = paths::diff_dir(driver.layer_dir(id));
    fs::create_dir_all(&diff).unwrap();
    fs::write(diff.join(paths::URL_MARKER), url).unwrap();
    fs::write(diff.join(paths::SIZE_MARKER), size).unwrap();
    fs::write(diff.join(paths::FORMAT_FLAG), " ").unwrap();
    fs::write(diff.join(paths::TYPE_MARKER), "oss").unwrap();
    fs::write(diff.join(paths::CHECKSUM_MARKER), "manifest").unwrap();
}

/// Image pull, container creation, commit, and re-apply of the committed
/// blob as a new image layer.
#[test]
fn test_full_layer_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let driver = test_driver(dir.path());

    // two image layers arrive via apply_diff
    seed_diff(&driver, "l1", "https://example/v2/repo/blobs/sha256:aaa", "10");
    seed_diff(&driver, "l2", "https://example/v2/repo/blobs/sha256:bbb", "20");
    driver.apply_diff("l1", "").unwrap();
    driver.apply_diff("l2", "l1").unwrap();

    // container layers on top
    driver.create("c-init", "l2").unwrap();
    driver.create("c", "c-init").unwrap();

    let init_desc = LayerDescriptor::load(&driver.layer_dir("c-init")).unwrap();
    assert_eq!(init_desc.lowers.len(), 3); // base + l1 + l2
    assert_eq!(init_desc.lowers[0].dir, PathBuf::from(BASE_LAYER_DIR));
    assert!(init_desc.upper.is_some());

    // the container writes into its layer; here the writable pair is seeded
    // directly since no real device can be mounted
    let c_meta = paths::meta_dir(driver.layer_dir("c"));
    fs::write(c_meta.join(paths::DATA_FILE), "container-data").unwrap();
    fs::write(c_meta.join(paths::INDEX_FILE), "idx").unwrap();
    fs::write(
        driver.layer_dir("c").join(paths::PARENT_FILE),
        driver.layer_dir("l2").to_str().unwrap(),
    )
    .unwrap();

    // commit the container layer
    let digest = driver.diff("c").unwrap();
    assert_eq!(digest, hex::encode(Sha256::digest(b"container-dataidx")));

    let c_diff = paths::diff_dir(driver.layer_dir("c"));
    assert_eq!(
        fs::read_to_string(c_diff.join(paths::URL_MARKER)).unwrap(),
        format!("https://example/v2/repo/blobs/sha256:{digest}")
    );

    // the published diff is consumable as a new image layer
    let l3_diff = paths::diff_dir(driver.layer_dir("l3"));
    fs::create_dir_all(&l3_diff).unwrap();
    for name in paths::PUBLISHED_MARKERS {
        fs::copy(c_diff.join(name), l3_diff.join(name)).unwrap();
    }
    driver.apply_diff("l3", "l2").unwrap();

    let l2_desc = LayerDescriptor::load(&driver.layer_dir("l2")).unwrap();
    let l3_desc = LayerDescriptor::load(&driver.layer_dir("l3")).unwrap();
    assert_eq!(l3_desc.lowers[..3], l2_desc.lowers[..]);
    assert_eq!(l3_desc.lowers.len(), 4);
    assert_eq!(
        l3_desc.lowers[3].digest.as_deref(),
        Some(format!("sha256:{digest}").as_str())
    );
    assert_eq!(
        l3_desc.lowers[3].size,
        Some(17) // len("container-dataidx")
    );
}

/// Get with no kernel behind the configfs root: the address poll exhausts,
/// the error is typed, and no partially provisioned state is left behind.
#[test]
fn test_get_device_not_ready_leaves_no_residue() {
    let dir = tempfile::tempdir().unwrap();
    let driver = test_driver(dir.path());

    seed_diff(&driver, "l1", "https://example/v2/repo/blobs/sha256:aaa", "10");
    driver.apply_diff("l1", "").unwrap();
    driver.create("c-init", "l1").unwrap();

    let err = driver.get("c").unwrap_err();
    assert!(matches!(err, LayerError::DeviceNotReady { .. }));

    // identity markers were persisted for crash recovery
    let init_meta = paths::meta_dir(driver.layer_dir("c-init"));
    assert!(init_meta.join(paths::DEVICE_ID_MARKER).exists());
    assert!(init_meta.join(paths::DEVICE_NAA_MARKER).exists());

    // the configfs subtrees hold zero residual entries
    let configfs = dir.path().join(".configfs/target");
    for subtree in ["core", "loopback"] {
        let residue: Vec<_> = match fs::read_dir(configfs.join(subtree)) {
            Ok(entries) => entries
                .flatten()
                .flat_map(|hba| fs::read_dir(hba.path()).into_iter().flatten().flatten())
                .collect(),
            Err(_) => Vec::new(), // subtree never created at all
        };
        assert!(residue.is_empty(), "{subtree} residue: {residue:?}");
    }

    // nothing is mounted: the mount point is an empty directory
    let merged = paths::merged_dir(driver.layer_dir("c-init"));
    assert_eq!(fs::read_dir(&merged).unwrap().count(), 0);

    // put after the failed get is clean (idempotent teardown)
    driver.put("c").unwrap();
}
