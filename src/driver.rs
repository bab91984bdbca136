//! The five lifecycle entry points implemented for the host daemon.
//!
//! The host owns layer identity and decides when each call happens; this
//! module glues the chain manager, the device provisioner and the commit
//! pipeline together underneath that contract:
//!
//! - `create` registers a container's writable top layer (the host names it
//!   with an `-init` suffix) and persists its descriptor.
//! - `apply_diff` registers a downloaded image layer: extends the parent's
//!   chain with the new blob and persists the child descriptor.
//! - `get` provisions and mounts the block device for a layer.
//! - `put` releases it.
//! - `diff` freezes the writable layer into a published, content-addressed
//!   blob that a later `apply_diff` can consume as a lower.
//!
//! The host serializes calls per layer; sibling layers may run concurrently
//! (identity generation keeps their device names distinct).

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use crate::commit::CommitConfig;
use crate::descriptor::{descriptor_path, LayerDescriptor, LowerLayer};
use crate::device::{DeviceProvisioner, IdentityContext, TargetConfig};
use crate::error::{LayerError, Result};
use crate::paths::{
    self, DATA_FILE, FORMAT_FLAG, INDEX_FILE, META_DIR, PARENT_FILE, RESULT_FILE, SIZE_MARKER,
    URL_MARKER,
};
use crate::util::{path_exists, read_trimmed};

/// Suffix the host gives the init sibling of a container's layer.
const INIT_SUFFIX: &str = "-init";

/// A block-device layered storage driver rooted at one layer store
/// directory.
pub struct Driver {
    root: PathBuf,
    provisioner: DeviceProvisioner,
    commit: CommitConfig,
    identity: IdentityContext,
}

impl Driver {
    /// Driver with production defaults (real configfs/sysfs roots and tool
    /// locations).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, TargetConfig::default(), CommitConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, target: TargetConfig, commit: CommitConfig) -> Self {
        Self {
            root: root.into(),
            provisioner: DeviceProvisioner::new(target),
            commit,
            identity: IdentityContext::new(),
        }
    }

    /// Directory of a layer id inside the store root.
    pub fn layer_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Registers a layer at creation time.
    ///
    /// Image layers are registered later through [`Driver::apply_diff`];
    /// this call only acts on a container's layers (the `-init` layer or its
    /// direct child). For the `-init` layer it creates the writable
    /// data/index pair and persists a descriptor carrying the parent's chain
    /// plus the upper slot.
    pub fn create(&self, id: &str, parent: &str) -> Result<()> {
        if !id.ends_with(INIT_SUFFIX) && !parent.ends_with(INIT_SUFFIX) {
            debug!("create {id}: image layer, nothing to do");
            return Ok(());
        }

        let id_dir = self.layer_dir(id);
        let meta = paths::meta_dir(&id_dir);
        fs::create_dir_all(&meta)?;

        if id.ends_with(INIT_SUFFIX) {
            self.commit.create_writable(&meta)?;

            let parent_desc = LayerDescriptor::load(&self.layer_dir(parent))?;
            let mut desc = LayerDescriptor {
                repo_blob_url: parent_desc.repo_blob_url,
                lowers: parent_desc.lowers,
                ..LayerDescriptor::default()
            };
            desc.attach_upper(
                meta.join(INDEX_FILE),
                meta.join(DATA_FILE),
                meta.join(RESULT_FILE),
            );
            desc.persist(&id_dir)?;
        }

        fs::write(meta.join(FORMAT_FLAG), " ")?;
        Ok(())
    }

    /// Registers a downloaded image layer: copies its published markers into
    /// the metadata directory and extends the parent's chain with the new
    /// blob.
    ///
    /// An empty `parent` starts the chain from the shared base layer.
    pub fn apply_diff(&self, id: &str, parent: &str) -> Result<()> {
        let id_dir = self.layer_dir(id);
        let meta = paths::meta_dir(&id_dir);
        fs::create_dir_all(&meta)?;
        paths::copy_meta_files(&paths::diff_dir(&id_dir), &meta)?;

        let chain_parent = if parent.is_empty() {
            LayerDescriptor::base()
        } else {
            LayerDescriptor::load(&self.layer_dir(parent))?
        };

        let url = read_trimmed(meta.join(URL_MARKER))?;
        let idx = url.rfind('/').ok_or_else(|| LayerError::InvalidUrl {
            url: url.clone(),
            reason: "no path separator",
        })?;
        let digest = &url[idx + 1..];
        if !digest.starts_with("sha256") {
            return Err(LayerError::InvalidUrl {
                url: url.clone(),
                reason: "expected sha256 digest after last '/'",
            });
        }
        // the original driver tolerates an unparsable size and records zero
        let size: u64 = read_trimmed(meta.join(SIZE_MARKER))?
            .parse()
            .unwrap_or_default();

        let mut desc = LayerDescriptor::extend(
            &chain_parent,
            LowerLayer {
                // the nested metadata directory is where the fetched blob
                // for this layer lives
                dir: meta.join(META_DIR),
                digest: Some(digest.to_string()),
                size: Some(size),
            },
        );
        if desc.repo_blob_url.is_empty() {
            desc.repo_blob_url = url[..idx].to_string();
        }
        desc.persist(&id_dir)
    }

    /// Provisions and mounts the block device for a layer; returns the mount
    /// point.
    ///
    /// Keys off the layer's `-init` sibling: identity markers and the mount
    /// point live there, while the descriptor path is the requested layer's
    /// own.
    pub fn get(&self, id: &str) -> Result<PathBuf> {
        let init_dir = self.layer_dir(&init_id(id));
        let target = paths::merged_dir(&init_dir);
        fs::create_dir_all(&target)?;

        let identity = self.identity.generate();
        match self.provisioner.acquire(
            &identity,
            &paths::meta_dir(&init_dir),
            &descriptor_path(self.layer_dir(id)),
            &target,
        ) {
            Ok(()) => Ok(target),
            Err(err) => {
                // teardown outcome was already reported; surface the trigger
                Err(err.error)
            }
        }
    }

    /// Unmounts and removes the device of a layer. A no-op for the `-init`
    /// layer itself; the device is torn down when its child is put.
    pub fn put(&self, id: &str) -> Result<()> {
        if id.ends_with(INIT_SUFFIX) {
            return Ok(());
        }
        let init_dir = self.layer_dir(&format!("{id}{INIT_SUFFIX}"));
        self.provisioner
            .release(&paths::meta_dir(&init_dir), &paths::merged_dir(&init_dir))
    }

    /// Freezes the layer's writable contents into a compressed,
    /// content-addressed blob and publishes its markers into `diff/`.
    /// Returns the hex content digest.
    pub fn diff(&self, id: &str) -> Result<String> {
        let id_dir = self.layer_dir(id);
        let meta = paths::meta_dir(&id_dir);
        let diff = paths::diff_dir(&id_dir);
        fs::create_dir_all(&diff)?;

        self.commit.freeze(&meta)?;
        let (_, digest, size) = self.commit.compress(&meta)?;
        let blob = self.commit.finalize(&meta)?;

        // publish only after finalize: the URL digest must match the bytes
        // actually stored on disk
        let prefix = self.parent_url_prefix(&id_dir)?;
        self.commit.publish(&diff, &prefix, &digest, size, &blob)?;
        Ok(digest)
    }

    /// Finds the content-address URL prefix for a new blob by walking
    /// `parent` markers upward until a layer with a published URL is found,
    /// then truncating that URL at the first `sha256:` occurrence.
    fn parent_url_prefix(&self, id_dir: &Path) -> Result<String> {
        let mut dir = id_dir.to_path_buf();
        while !path_exists(paths::meta_dir(&dir).join(URL_MARKER)) {
            let parent_file = dir.join(PARENT_FILE);
            dir = PathBuf::from(read_trimmed(&parent_file).map_err(|source| {
                LayerError::MarkerUnreadable {
                    path: parent_file,
                    source,
                }
            })?);
        }
        let url = read_trimmed(paths::meta_dir(&dir).join(URL_MARKER))?;
        match url.find("sha256:") {
            Some(i) => Ok(url[..i].to_string()),
            None => Err(LayerError::InvalidUrl {
                url,
                reason: "missing sha256: segment",
            }),
        }
    }
}

fn init_id(id: &str) -> String {
    if id.ends_with(INIT_SUFFIX) {
        id.to_string()
    } else {
        format!("{id}{INIT_SUFFIX}")
    }
}
