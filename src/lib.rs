#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate log;

pub mod callout;
pub mod consts;
pub mod control;
pub mod cpuid;
pub mod cpuset;
pub mod devices;
pub mod emulate;
pub mod error;
pub mod firmware;
pub mod inout;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod mem;
pub mod mmio;
pub mod net;
pub mod params;
pub mod pci;
pub mod runner;
pub mod stats;
pub mod virtio;
pub mod vm;
pub mod vmx;

pub use error::{ErrorKind, Fault, Result, VmmError};
pub use vm::Vm;
