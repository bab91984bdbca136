//! Freezing a writable layer into a published, content-addressed blob.
//!
//! The pipeline runs strictly in order:
//!
//! ```text
//! Writable → Frozen → Compressed → Published
//! ```
//!
//! Freezing and compression are delegated to external executables from the
//! block-device tool suite; this module owns their invocation (argv, exit
//! code, captured output) plus the digest computation and the marker files
//! that make the published blob independently fetchable. Publishing must
//! never run before [`CommitConfig::finalize`] completes, since the digest
//! embedded in the published URL has to match the bytes stored on disk.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::error::{LayerError, Result};
use crate::paths::{
    CHECKSUM_MARKER, COMMIT_FILE, COMMIT_FILE_COMPRESSED, DATA_FILE, FORMAT_FLAG, INDEX_FILE,
    SIZE_MARKER, TYPE_MARKER, TYPE_TAG, URL_MARKER,
};

/// The published outcome of one frozen layer: immutable once produced,
/// consumed by the next layer's ApplyDiff as a new lower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitArtifact {
    /// Hex sha256 of the compressed blob.
    pub digest: String,
    /// Size of the compressed blob in bytes.
    pub size: u64,
    /// Checksum manifest location.
    pub checksum_path: PathBuf,
}

/// Paths of the external collaborator executables and their fixed arguments.
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Creates an empty writable data/index pair.
    pub create_tool: PathBuf,
    /// Collapses a sparse writable layer into one immutable blob.
    pub commit_tool: PathBuf,
    /// Compresses a frozen blob.
    pub compress_tool: PathBuf,
    /// Generates a chunked checksum manifest.
    pub checksum_tool: PathBuf,
    /// Chunk size passed to the checksum tool.
    pub checksum_chunk_size: u32,
    /// Size argument passed to the create tool, in GB.
    pub writable_size_gb: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            create_tool: PathBuf::from("/opt/overlaybd/bin/overlaybd-create"),
            commit_tool: PathBuf::from("/opt/overlaybd/bin/overlaybd-commit"),
            compress_tool: PathBuf::from("/opt/overlaybd/bin/overlaybd-zfile"),
            checksum_tool: PathBuf::from("/opt/overlaybd/bin/zchecksum"),
            checksum_chunk_size: 262144,
            writable_size_gb: 256,
        }
    }
}

impl CommitConfig {
    /// Creates the writable data/index pair for a new top layer in
    /// `meta_dir`.
    pub fn create_writable(&self, meta_dir: &Path) -> Result<()> {
        run_tool(
            &self.create_tool,
            &[
                meta_dir.join(DATA_FILE).as_os_str().to_owned(),
                meta_dir.join(INDEX_FILE).as_os_str().to_owned(),
                self.writable_size_gb.to_string().into(),
            ],
        )
    }

    /// Collapses the writable data/index pair in `meta_dir` into a single
    /// immutable raw blob. Returns the raw blob path.
    pub fn freeze(&self, meta_dir: &Path) -> Result<PathBuf> {
        let raw = meta_dir.join(COMMIT_FILE);
        run_tool(
            &self.commit_tool,
            &[
                meta_dir.join(DATA_FILE).into_os_string(),
                meta_dir.join(INDEX_FILE).into_os_string(),
                raw.clone().into_os_string(),
            ],
        )?;
        Ok(raw)
    }

    /// Compresses the raw blob in `meta_dir` and computes the content digest
    /// over the compressed bytes. Returns the compressed path, the hex
    /// digest, and the compressed size.
    pub fn compress(&self, meta_dir: &Path) -> Result<(PathBuf, String, u64)> {
        let raw = meta_dir.join(COMMIT_FILE);
        let compressed = meta_dir.join(COMMIT_FILE_COMPRESSED);
        run_tool(
            &self.compress_tool,
            &[
                raw.into_os_string(),
                compressed.clone().into_os_string(),
            ],
        )?;

        let mut file = File::open(&compressed)?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut file, &mut hasher)?;
        let digest = hex::encode(hasher.finalize());
        debug!("compressed blob {compressed:?}: sha256:{digest}, {size} bytes");
        Ok((compressed, digest, size))
    }

    /// Replaces the raw blob with the compressed artifact: removes the raw
    /// file, then renames the compressed file into its place. Returns the
    /// final blob path.
    ///
    /// This is not atomic across a crash boundary: a crash between the
    /// removal and the rename leaves the layer without a blob, and it must
    /// be reconstructed from [`CommitConfig::freeze`] again. Kept this way
    /// for compatibility with existing layer stores.
    pub fn finalize(&self, meta_dir: &Path) -> Result<PathBuf> {
        let raw = meta_dir.join(COMMIT_FILE);
        let compressed = meta_dir.join(COMMIT_FILE_COMPRESSED);
        fs::remove_file(&raw)?;
        fs::rename(&compressed, &raw)?;
        Ok(raw)
    }

    /// Writes the five marker files that make the finalized blob
    /// independently fetchable: the format flag, the content-address URL
    /// (`parent_prefix` + `sha256:` + digest), the checksum manifest of
    /// `blob`, the decimal byte size, and the type tag.
    ///
    /// Must only be called after [`CommitConfig::finalize`] has completed.
    pub fn publish(
        &self,
        diff_dir: &Path,
        parent_prefix: &str,
        digest: &str,
        size: u64,
        blob: &Path,
    ) -> Result<CommitArtifact> {
        fs::write(diff_dir.join(FORMAT_FLAG), " ")?;

        let url = format!("{parent_prefix}sha256:{digest}");
        info!("publishing layer blob as {url}");
        fs::write(diff_dir.join(URL_MARKER), &url)?;

        let checksum_path = diff_dir.join(CHECKSUM_MARKER);
        run_tool(
            &self.checksum_tool,
            &[
                "generate".into(),
                format!("-s {}", self.checksum_chunk_size).into(),
                blob.as_os_str().to_owned(),
                checksum_path.clone().into_os_string(),
            ],
        )?;

        fs::write(diff_dir.join(SIZE_MARKER), size.to_string())?;
        fs::write(diff_dir.join(TYPE_MARKER), TYPE_TAG)?;

        Ok(CommitArtifact {
            digest: digest.to_string(),
            size,
            checksum_path,
        })
    }
}

/// Runs one collaborator executable; non-zero exit is fatal and surfaces the
/// captured combined output.
fn run_tool(tool: &Path, args: &[std::ffi::OsString]) -> Result<()> {
    let output = Command::new(tool).args(args).output().map_err(|err| {
        LayerError::Io(io::Error::new(
            err.kind(),
            format!("spawning {}: {err}", tool.display()),
        ))
    })?;
    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(LayerError::ExternalTool {
            tool: tool.display().to_string(),
            status: output.status,
            output: combined,
        });
    }
    debug!("{} {args:?}: ok", tool.display());
    Ok(())
}
