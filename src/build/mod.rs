//! Kernel build stage.
//!
//! - [`kernel`] - build steps run over SSH inside the builder container
//! - [`modules`] - out-of-tree modules hooked into the kernel tree

pub mod kernel;
pub mod modules;

pub use kernel::KernelBuilder;
