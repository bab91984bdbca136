//! Device provisioning against the kernel SCSI target (LIO).
//!
//! Turns a persisted layer descriptor into a mounted filesystem backed by a
//! kernel block device: create a backstore under the configfs `core` tree,
//! bind it through a loopback initiator, wait for the kernel to publish the
//! SCSI address, and mount the first block device that appears for it.
//!
//! The provisioning state machine is strictly linear:
//!
//! ```text
//! Unprovisioned → BackstoreCreated → LoopbackBound → DeviceDiscovered → Mounted
//! ```
//!
//! Any failure triggers an automatic best-effort unwind back to
//! `Unprovisioned` before the error is returned; unwind failures are reported
//! as [`TeardownWarning`]s alongside the triggering error, never in place of
//! it.
//!
//! The configfs and sysfs trees are OS-wide mutable state and no lock is
//! taken over them: concurrent provisioning is safe only because generated
//! identities (local id, NAA name) are unique, and because the host
//! serializes calls per layer.

use std::{
    fs,
    io::ErrorKind,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use rustix::mount::{mount, unmount, MountFlags, UnmountFlags};

use crate::error::{AcquireError, LayerError, Result, TeardownWarning};
use crate::paths::{DEVICE_ID_MARKER, DEVICE_NAA_MARKER};
use crate::poll::{poll, PollConfig};
use crate::util::read_trimmed;

/// Fixed NAA prefix for generated SCSI WWNs.
pub const NAA_PREFIX: &str = "naa.18";

/// Source of process-unique device identities.
///
/// Holds the pid and an atomic counter (seeded randomly) so that two
/// provisioning calls within the same wall-clock second still get distinct
/// names. Passed explicitly rather than living in process globals.
#[derive(Debug)]
pub struct IdentityContext {
    pid: u32,
    counter: AtomicU32,
}

impl IdentityContext {
    pub fn new() -> Self {
        Self {
            pid: rustix::process::getpid().as_raw_nonzero().get() as u32,
            counter: AtomicU32::new(rand::random()),
        }
    }

    /// Generates a fresh identity: an opaque process-unique local id and a
    /// globally unique NAA name built from 4 bytes of epoch seconds, 2 bytes
    /// of pid and 1 counter byte.
    pub fn generate(&self) -> DeviceIdentity {
        let count = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut wwn = [0u8; 7];
        wwn[..4].copy_from_slice(&secs.to_be_bytes());
        wwn[4] = (self.pid >> 8) as u8;
        wwn[5] = self.pid as u8;
        wwn[6] = count as u8;

        DeviceIdentity {
            local_id: format!("{secs:08x}{:04x}{count:08x}", self.pid & 0xffff),
            naa: format!("{NAA_PREFIX}{}", hex::encode(wwn)),
        }
    }
}

impl Default for IdentityContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Names of one provisioned device: used for backstore/LUN naming and
/// persisted as markers so a later release can re-derive them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub local_id: String,
    pub naa: String,
}

/// A provisioned device session, reconstructed from on-disk markers.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub identity: DeviceIdentity,
    pub mount_point: PathBuf,
}

impl DeviceHandle {
    /// Re-derives the device identity from the markers persisted at acquire
    /// time.
    pub fn from_markers(meta_dir: &Path, mount_point: &Path) -> Result<Self> {
        let local_id = read_marker(&meta_dir.join(DEVICE_ID_MARKER))?;
        let naa = read_marker(&meta_dir.join(DEVICE_NAA_MARKER))?;
        Ok(Self {
            identity: DeviceIdentity { local_id, naa },
            mount_point: mount_point.to_path_buf(),
        })
    }
}

fn read_marker(path: &Path) -> Result<String> {
    read_trimmed(path).map_err(|source| LayerError::MarkerUnreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// Locations and tunables for SCSI target provisioning.
///
/// The defaults match a real host; tests point the roots at scratch
/// directories and shrink the poll budgets.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// LIO configfs root.
    pub configfs_root: PathBuf,
    /// sysfs SCSI device enumeration root.
    pub sysfs_scsi_root: PathBuf,
    /// Directory where block device nodes appear.
    pub dev_root: PathBuf,
    /// Fixed host-bus-adapter number shared by every backstore we create.
    pub hba: u32,
    /// Userspace backstore driver name, the prefix of `dev_config`.
    pub backstore_driver: String,
    /// Filesystem type used when mounting the discovered device.
    pub fs_type: String,
    /// Poll budget for the kernel-published SCSI address file.
    pub address_poll: PollConfig,
    /// Poll budget for block device enumeration and mounting.
    pub device_poll: PollConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            configfs_root: PathBuf::from("/sys/kernel/config/target"),
            sysfs_scsi_root: PathBuf::from("/sys/class/scsi_device"),
            dev_root: PathBuf::from("/dev"),
            hba: 999999998,
            backstore_driver: "overlaybd".to_string(),
            fs_type: "ext4".to_string(),
            address_poll: PollConfig::new(Duration::from_millis(1), 50),
            device_poll: PollConfig::new(Duration::from_millis(10), 50),
        }
    }
}

impl TargetConfig {
    fn backstore_dir(&self, local_id: &str) -> PathBuf {
        self.configfs_root
            .join("core")
            .join(format!("user_{}", self.hba))
            .join(format!("dev_{local_id}"))
    }

    fn loopback_dir(&self, naa: &str) -> PathBuf {
        self.configfs_root.join("loopback").join(naa)
    }

    fn tpg_dir(&self, naa: &str) -> PathBuf {
        self.loopback_dir(naa).join("tpgt_1")
    }

    fn lun_dir(&self, naa: &str) -> PathBuf {
        self.tpg_dir(naa).join("lun").join("lun_0")
    }

    fn lun_link(&self, naa: &str, local_id: &str) -> PathBuf {
        self.lun_dir(naa).join(format!("dev_{local_id}"))
    }
}

/// Owns the SCSI target/loopback lifecycle: create, discover, mount,
/// teardown.
#[derive(Debug, Default)]
pub struct DeviceProvisioner {
    config: TargetConfig,
}

impl DeviceProvisioner {
    pub fn new(config: TargetConfig) -> Self {
        Self { config }
    }

    /// Provisions a block device for `backing_config` and mounts it at
    /// `mount_point`.
    ///
    /// Identity markers are persisted into `meta_dir` first (best-effort,
    /// for crash recovery and the eventual release). On any provisioning
    /// failure the partially built device is unwound before the error is
    /// returned; steps of the unwind that themselves failed are carried in
    /// the returned [`AcquireError`].
    pub fn acquire(
        &self,
        identity: &DeviceIdentity,
        meta_dir: &Path,
        backing_config: &Path,
        mount_point: &Path,
    ) -> std::result::Result<(), AcquireError> {
        for (name, value) in [
            (DEVICE_ID_MARKER, &identity.local_id),
            (DEVICE_NAA_MARKER, &identity.naa),
        ] {
            if let Err(err) = fs::write(meta_dir.join(name), value) {
                warn!("failed to persist {name} marker in {meta_dir:?}: {err}");
            }
        }

        match self.provision(identity, backing_config, mount_point) {
            Ok(()) => Ok(()),
            Err(error) => {
                info!("unwinding failed device acquire for {}", identity.naa);
                let teardown = self.teardown(identity, mount_point);
                for warning in &teardown {
                    warn!("{warning}");
                }
                Err(AcquireError { error, teardown })
            }
        }
    }

    fn provision(
        &self,
        identity: &DeviceIdentity,
        backing_config: &Path,
        mount_point: &Path,
    ) -> Result<()> {
        let config = &self.config;

        // Backstore: configfs object keyed by the fixed hba and the local id.
        let backstore = config.backstore_dir(&identity.local_id);
        fs::create_dir_all(&backstore)?;
        fs::write(
            backstore.join("control"),
            format!(
                "dev_config={}/{}",
                config.backstore_driver,
                backing_config.display()
            ),
        )?;
        fs::write(backstore.join("enable"), "1")?;

        // Loopback target: tpgt_1/lun/lun_0 with the backstore linked in.
        let tpg = config.tpg_dir(&identity.naa);
        debug!("loopback target dir: {tpg:?}");
        fs::create_dir_all(config.lun_dir(&identity.naa))?;
        fs::write(tpg.join("nexus"), &identity.naa)?;
        symlink(
            &backstore,
            config.lun_link(&identity.naa, &identity.local_id),
        )?;

        // The kernel publishes the SCSI address for the loopback target once
        // the nexus is up.
        let address_file = tpg.join("address");
        let address = poll(&config.address_poll, "scsi address", || {
            read_trimmed(&address_file).ok()
        })?;
        debug!("scsi address for {}: {address}", identity.naa);

        let block_dir = config
            .sysfs_scsi_root
            .join(format!("{address}:0"))
            .join("device")
            .join("block");
        poll(&config.device_poll, "mountable block device", || {
            let entries = fs::read_dir(&block_dir).ok()?;
            for entry in entries.flatten() {
                let device = config.dev_root.join(entry.file_name());
                match mount(
                    &device,
                    mount_point,
                    config.fs_type.as_str(),
                    MountFlags::empty(),
                    c"",
                ) {
                    Ok(()) => {
                        info!("mounted {device:?} at {mount_point:?}");
                        return Some(());
                    }
                    Err(err) => {
                        // The device node may not be usable yet; retry the
                        // whole round after the delay.
                        warn!("mount {device:?} at {mount_point:?}: {err}");
                        return None;
                    }
                }
            }
            None
        })
    }

    /// Unmounts and removes the device named by the markers in `meta_dir`.
    ///
    /// Removals run child-to-parent; each treats "already absent" as
    /// success, so release is idempotent. The first genuine removal error is
    /// returned.
    pub fn release(&self, meta_dir: &Path, mount_point: &Path) -> Result<()> {
        let handle = DeviceHandle::from_markers(meta_dir, mount_point)?;
        detach_mount(mount_point);
        for path in self.teardown_steps(&handle.identity) {
            remove_step(&path).map_err(|source| {
                LayerError::Io(std::io::Error::new(
                    source.kind(),
                    format!("removing {}: {source}", path.display()),
                ))
            })?;
        }
        Ok(())
    }

    /// Best-effort unwind used when provisioning fails partway. Never fails;
    /// collects the steps that could not be undone.
    fn teardown(&self, identity: &DeviceIdentity, mount_point: &Path) -> Vec<TeardownWarning> {
        detach_mount(mount_point);
        let mut warnings = Vec::new();
        for path in self.teardown_steps(identity) {
            if let Err(source) = remove_step(&path) {
                warnings.push(TeardownWarning { path, source });
            }
        }
        warnings
    }

    /// The configfs entries of a device, ordered child-to-parent.
    fn teardown_steps(&self, identity: &DeviceIdentity) -> [PathBuf; 5] {
        let config = &self.config;
        [
            config.lun_link(&identity.naa, &identity.local_id),
            config.lun_dir(&identity.naa),
            config.tpg_dir(&identity.naa),
            config.loopback_dir(&identity.naa),
            config.backstore_dir(&identity.local_id),
        ]
    }
}

/// Unmount with detach semantics so a busy mount never blocks the teardown.
/// "Not mounted" is the common case during unwind and is only logged.
fn detach_mount(mount_point: &Path) {
    if let Err(err) = unmount(mount_point, UnmountFlags::DETACH) {
        warn!("umount {mount_point:?}: {err}");
    }
}

/// Removes one configfs entry, treating "already absent" as success.
///
/// configfs directories drop their attribute files on rmdir, so a plain
/// rmdir is the right call there; scratch trees in tests hold real files, so
/// a non-empty directory falls back to a recursive removal.
fn remove_step(path: &Path) -> std::io::Result<()> {
    let result = match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => match fs::remove_dir(path) {
            Err(err) if err.raw_os_error() == Some(rustix::io::Errno::NOTEMPTY.raw_os_error()) => {
                fs::remove_dir_all(path)
            }
            other => other,
        },
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
