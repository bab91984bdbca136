//! Block-device-backed layered storage for container images.
//!
//! Instead of stacking filesystem directories with overlay semantics, each
//! image or container layer is represented as a block device assembled from
//! a chain of immutable, content-addressable blobs plus one optional
//! writable top layer. The device is materialized through the in-kernel
//! SCSI target (LIO): a userspace backstore object is created under
//! configfs, bound through a loopback initiator, and the resulting block
//! device is mounted as a normal filesystem.
//!
//! # Overview
//!
//! The crate is organized around three subsystems:
//!
//! - [`descriptor`]: the layer chain — an append-only, ordered sequence of
//!   lower blobs plus at most one writable upper, persisted as a JSON
//!   descriptor with atomic replace semantics.
//! - [`device`]: SCSI target provisioning — backstore creation, loopback
//!   binding, device discovery, mount, and guaranteed best-effort teardown
//!   on any failure.
//! - [`commit`]: the commit pipeline — freezing a writable layer into an
//!   immutable, compressed, checksummed, content-addressed blob consumable
//!   as a future lower.
//!
//! [`driver::Driver`] wires these into the five lifecycle entry points the
//! host daemon invokes: `create`, `apply_diff`, `get`, `put` and `diff`.
//!
//! # Example
//!
//! ```no_run
//! use blocklayer::Driver;
//!
//! let driver = Driver::new("/var/lib/blocklayer/layers");
//! let mount_point = driver.get("0123abcd")?;
//! println!("layer mounted at {}", mount_point.display());
//! driver.put("0123abcd")?;
//! # Ok::<(), blocklayer::LayerError>(())
//! ```

pub mod commit;
pub mod descriptor;
pub mod device;
pub mod driver;
pub mod error;
pub mod paths;
pub mod poll;
pub mod util;

pub use commit::{CommitArtifact, CommitConfig};
pub use descriptor::{LayerDescriptor, LowerLayer, UpperLayer};
pub use device::{DeviceHandle, DeviceIdentity, DeviceProvisioner, IdentityContext, TargetConfig};
pub use driver::Driver;
pub use error::{AcquireError, LayerError, Result, TeardownWarning};
pub use poll::PollConfig;
