//! Cached build artifacts and their keep-or-rebuild decisions.
//!
//! - [`download`] - kernel source archive selection and download
//! - [`unpack`] - unpack/reuse decision over the kernel tree
//! - [`rootfs`] - root filesystem build or reuse
//! - [`history`] - `.hist` freshness marker

pub mod download;
pub mod history;
pub mod rootfs;
pub mod unpack;

pub use download::{Curl, Fetch, KernelDownloader};
pub use history::History;
pub use rootfs::RootfsBuilder;
pub use unpack::KernelUnpacker;
