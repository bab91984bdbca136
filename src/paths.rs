//! Fixed on-disk names and marker file handling.
//!
//! Every layer directory managed by this driver has the same shape:
//!
//! ```text
//! <layer>/
//! ├── diff/                 # the layer's published metadata (image store contract)
//! ├── blockmeta/            # driver-private metadata, blobs and device markers
//! ├── blockmerged/          # mount point for the assembled block device
//! └── parent                # path of the parent layer directory
//! ```
//!
//! The dotfile marker names inside `diff/` and `blockmeta/` are an external
//! contract shared with the image store and the block-device tool suite; they
//! must not change.

use std::{fs, path::Path, path::PathBuf};

use crate::error::Result;
use crate::util::{path_exists, read_trimmed};

/// Driver-private metadata subdirectory of a layer.
pub const META_DIR: &str = "blockmeta";
/// Published-diff subdirectory of a layer (read by the image store).
pub const DIFF_DIR: &str = "diff";
/// Mount point subdirectory for the assembled device.
pub const MERGED_DIR: &str = "blockmerged";
/// File naming the parent layer directory.
pub const PARENT_FILE: &str = "parent";

/// Presence/format flag: marks a directory as holding block-layer metadata.
pub const FORMAT_FLAG: &str = ".aaaaaaaaaaaaaaaa.lsmt";
/// Content-address URL of the layer blob.
pub const URL_MARKER: &str = ".oss_url";
/// Decimal byte size of the layer blob.
pub const SIZE_MARKER: &str = ".data_size";
/// Storage type tag.
pub const TYPE_MARKER: &str = ".type";
/// Chunked checksum manifest of the layer blob.
pub const CHECKSUM_MARKER: &str = ".checksum_file";

/// Writable top-layer data file.
pub const DATA_FILE: &str = ".data_file";
/// Writable top-layer index file.
pub const INDEX_FILE: &str = ".data_index";
/// Frozen (and, after finalize, compressed) layer blob.
pub const COMMIT_FILE: &str = ".commit";
/// Compression output before finalize renames it over [`COMMIT_FILE`].
pub const COMMIT_FILE_COMPRESSED: &str = ".commit.zfile";
/// Device result file named in the descriptor.
pub const RESULT_FILE: &str = "result";

/// Opaque local device id marker, written at acquire for crash recovery.
pub const DEVICE_ID_MARKER: &str = "devid";
/// NAA name marker, written at acquire for crash recovery.
pub const DEVICE_NAA_MARKER: &str = "devnaa";

/// Value written to the type tag marker.
pub const TYPE_TAG: &str = "oss";

/// The five marker files that make a published diff independently fetchable.
pub const PUBLISHED_MARKERS: [&str; 5] = [
    URL_MARKER,
    SIZE_MARKER,
    CHECKSUM_MARKER,
    FORMAT_FLAG,
    TYPE_MARKER,
];

pub fn meta_dir(layer_dir: impl AsRef<Path>) -> PathBuf {
    layer_dir.as_ref().join(META_DIR)
}

pub fn diff_dir(layer_dir: impl AsRef<Path>) -> PathBuf {
    layer_dir.as_ref().join(DIFF_DIR)
}

pub fn merged_dir(layer_dir: impl AsRef<Path>) -> PathBuf {
    layer_dir.as_ref().join(MERGED_DIR)
}

/// Copies the five published marker files from `src_dir` into `dst_dir`.
///
/// Used by ApplyDiff to bring the image store's `diff/` markers into the
/// driver-private metadata directory. Any missing source marker is an error.
pub fn copy_meta_files(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    for name in PUBLISHED_MARKERS {
        let data = fs::read(src_dir.join(name))?;
        fs::write(dst_dir.join(name), data)?;
    }
    Ok(())
}

/// Returns true if `dir` carries block-layer metadata (the format flag is
/// present in its metadata subdirectory).
///
/// Only meaningful once the layer has been downloaded and its metadata
/// directory created.
pub fn is_block_layer(layer_dir: &Path) -> bool {
    path_exists(meta_dir(layer_dir).join(FORMAT_FLAG))
}

/// Extracts the hex digest from a content-address URL marker file.
///
/// The URL is expected to end in `/sha256:<hex>`; the split is on `:` with
/// the second-to-last segment required to end in `/sha256`.
pub fn sha256_from_url_file(url_file: &Path) -> Result<String> {
    let url = read_trimmed(url_file)?;
    let parts: Vec<&str> = url.split(':').collect();
    if parts.len() < 3 || !parts[parts.len() - 2].ends_with("/sha256") {
        return Err(crate::error::LayerError::InvalidUrl {
            url,
            reason: "expected .../sha256:<digest>",
        });
    }
    Ok(parts[parts.len() - 1].to_string())
}

/// Reads the published digest and size of a layer back from its metadata
/// directory.
pub fn meta_info(layer_dir: &Path) -> Result<(String, String)> {
    let meta = meta_dir(layer_dir);
    let digest = sha256_from_url_file(&meta.join(URL_MARKER))?;
    let size = read_trimmed(meta.join(SIZE_MARKER))?;
    Ok((digest, size))
}
