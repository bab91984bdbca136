//! Layer descriptors: the chain of lower blobs behind a block device.
//!
//! Each layer persists a JSON descriptor naming the ordered chain of
//! immutable lower blobs it is assembled from, plus (for container layers)
//! the single writable upper. The descriptor is the input consumed by the
//! block-device backstore at provisioning time.
//!
//! # Chain invariant
//!
//! `lowers` is append-only and ordered base→most-recent: a child's `lowers`
//! is always exactly its parent's `lowers` plus at most one new entry.
//! Entries are never reordered or deduplicated — two entries may carry the
//! same content digest, since each is independently addressed by its own
//! directory. Descriptors are replaced wholesale on change, never patched in
//! place.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};
use crate::paths;
use crate::util::atomic_write;

/// Shared read-only base layer used when a chain has no parent.
pub const BASE_LAYER_DIR: &str = "/opt/overlaybd/baselayers";

/// Descriptor file name, relative to the layer's metadata directory.
const DESCRIPTOR_FILE: &str = "config.v1.json";

/// One immutable lower blob in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowerLayer {
    /// Directory holding the blob.
    pub dir: PathBuf,
    /// Content digest of the blob (`sha256:<hex>`), absent for the shared
    /// base layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Blob size in bytes, absent for the shared base layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl LowerLayer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            digest: None,
            size: None,
        }
    }
}

/// The single writable top layer of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpperLayer {
    pub index: PathBuf,
    pub data: PathBuf,
}

/// The full description of one layer's block device: blob chain, optional
/// writable upper, and the file the backstore reports its result into.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(rename = "repoBlobUrl", default)]
    pub repo_blob_url: String,
    #[serde(default)]
    pub lowers: Vec<LowerLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<UpperLayer>,
    #[serde(rename = "resultFile", default)]
    pub result_file: PathBuf,
}

impl LayerDescriptor {
    /// Descriptor for a layer with no parent: a single lower pointing at the
    /// fixed shared base layer directory.
    pub fn base() -> Self {
        Self {
            lowers: vec![LowerLayer::new(BASE_LAYER_DIR)],
            ..Self::default()
        }
    }

    /// Builds a child descriptor from `parent`, appending `lower`.
    ///
    /// The parent's blob URL and lowers are copied verbatim; nothing is
    /// reordered or deduplicated.
    pub fn extend(parent: &LayerDescriptor, lower: LowerLayer) -> Self {
        let mut lowers = parent.lowers.clone();
        lowers.push(lower);
        Self {
            repo_blob_url: parent.repo_blob_url.clone(),
            lowers,
            upper: None,
            result_file: PathBuf::new(),
        }
    }

    /// Sets the descriptor's single upper slot.
    ///
    /// Idempotent for identical arguments; different arguments replace the
    /// slot.
    pub fn attach_upper(
        &mut self,
        index: impl Into<PathBuf>,
        data: impl Into<PathBuf>,
        result_file: impl Into<PathBuf>,
    ) {
        self.upper = Some(UpperLayer {
            index: index.into(),
            data: data.into(),
        });
        self.result_file = result_file.into();
    }

    /// Serializes the descriptor into the layer's metadata directory,
    /// committed via write-temporary-then-rename so concurrent readers never
    /// observe a partial file.
    pub fn persist(&self, layer_dir: &Path) -> Result<()> {
        let path = descriptor_path(layer_dir);
        let data = serde_json::to_vec(self).map_err(|source| LayerError::DescriptorCorrupt {
            dir: layer_dir.to_path_buf(),
            source,
        })?;
        atomic_write(path, &data)?;
        Ok(())
    }

    /// Loads and validates the descriptor of `layer_dir`.
    ///
    /// A missing file is [`LayerError::DescriptorNotFound`]; a present but
    /// unparsable file is [`LayerError::DescriptorCorrupt`].
    pub fn load(layer_dir: &Path) -> Result<Self> {
        let path = descriptor_path(layer_dir);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(LayerError::DescriptorNotFound(layer_dir.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&data).map_err(|source| LayerError::DescriptorCorrupt {
            dir: layer_dir.to_path_buf(),
            source,
        })
    }
}

/// Path of the descriptor file inside a layer directory.
pub fn descriptor_path(layer_dir: impl AsRef<Path>) -> PathBuf {
    paths::meta_dir(layer_dir).join(DESCRIPTOR_FILE)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn lower(dir: &str, digest: &str, size: u64) -> LowerLayer {
        LowerLayer {
            dir: dir.into(),
            digest: Some(digest.to_string()),
            size: Some(size),
        }
    }

    #[test]
    fn test_base_chain() {
        let base = LayerDescriptor::base();
        assert_eq!(base.repo_blob_url, "");
        assert_eq!(base.lowers, vec![LowerLayer::new(BASE_LAYER_DIR)]);
        assert_eq!(base.upper, None);
    }

    #[test]
    fn test_extend_is_append_only() {
        let base = LayerDescriptor::base();
        let a = lower("/layers/a", "sha256:aaa", 1);
        let b = lower("/layers/b", "sha256:bbb", 2);
        let child = LayerDescriptor::extend(&base, a.clone());
        let grandchild = LayerDescriptor::extend(&child, b.clone());
        assert_eq!(
            grandchild.lowers,
            vec![LowerLayer::new(BASE_LAYER_DIR), a, b]
        );
        // parent untouched
        assert_eq!(child.lowers.len(), 2);
    }

    #[test]
    fn test_extend_keeps_duplicate_digests() {
        let base = LayerDescriptor::base();
        let a = lower("/layers/a", "sha256:same", 1);
        let b = lower("/layers/b", "sha256:same", 1);
        let child = LayerDescriptor::extend(&LayerDescriptor::extend(&base, a), b);
        assert_eq!(child.lowers.len(), 3);
    }

    #[test]
    fn test_attach_upper_idempotent_and_replacing() {
        let mut desc = LayerDescriptor::base();
        desc.attach_upper("/m/.data_index", "/m/.data_file", "/m/result");
        let once = desc.clone();
        desc.attach_upper("/m/.data_index", "/m/.data_file", "/m/result");
        assert_eq!(desc, once);
        desc.attach_upper("/other/.data_index", "/other/.data_file", "/other/result");
        assert_ne!(desc, once);
        assert_eq!(
            desc.upper.as_ref().unwrap().data,
            PathBuf::from("/other/.data_file")
        );
    }

    #[test]
    fn test_persist_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(paths::meta_dir(dir.path())).unwrap();

        let mut desc = LayerDescriptor::extend(
            &LayerDescriptor::base(),
            lower("/layers/a", "sha256:aaa", 42),
        );
        desc.repo_blob_url = "https://example/v2/blobs".to_string();
        desc.attach_upper("/m/.data_index", "/m/.data_file", "/m/result");

        desc.persist(dir.path()).unwrap();
        let loaded = LayerDescriptor::load(dir.path()).unwrap();
        assert_eq!(loaded, desc);
    }

    #[test]
    fn test_serialized_field_names() {
        let desc = LayerDescriptor::base();
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&desc).unwrap()).unwrap();
        assert_eq!(json["repoBlobUrl"], "");
        assert_eq!(json["lowers"][0]["dir"], BASE_LAYER_DIR);
        // absent optional fields are omitted entirely
        assert!(json["lowers"][0].get("digest").is_none());
        assert!(json.get("upper").is_none());
    }

    #[test]
    fn test_load_missing_vs_corrupt() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            LayerDescriptor::load(dir.path()),
            Err(LayerError::DescriptorNotFound(_))
        ));

        fs::create_dir_all(paths::meta_dir(dir.path())).unwrap();
        fs::write(descriptor_path(dir.path()), b"{ not json").unwrap();
        assert!(matches!(
            LayerDescriptor::load(dir.path()),
            Err(LayerError::DescriptorCorrupt { .. })
        ));
    }
}
