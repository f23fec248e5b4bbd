//! Daemonless builder for OCI container images.
//!
//! A parsed recipe (a list of [instruction::Instruction] records) is compiled
//! into a cache-keyed [graph::BuildGraph], executed operation by operation
//! into content-addressed layers, and assembled into an
//! [OCI image layout](https://github.com/opencontainers/image-spec/blob/v1.1.0/image-layout.md)
//! directory, optionally handed to a push callback. No background daemon is
//! involved; execution happens rootless through user namespaces or delegated
//! to an installed container runtime.

pub mod cache;
pub mod canonical;
pub mod engine;
pub mod error;
pub mod exec;
pub mod graph;
pub mod instruction;
pub mod layer;
pub mod manifest;
pub mod policy;

mod digest;
mod image_name;
mod platform;

pub use digest::{Digest, DigestWriter};
pub use engine::{BuildEngine, BuildResult};
pub use image_name::ImageName;
pub use instruction::BuildConfig;
pub use platform::Platform;
