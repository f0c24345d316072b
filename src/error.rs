use std::{
	io, result,
	sync::{Condvar, Mutex, MutexGuard},
	time::Duration,
};

use thiserror::Error;

use crate::{firmware::LoaderError, pci::PciError, virtio::VirtioError};

pub type Result<T> = result::Result<T, VmmError>;

/// Coarse classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// The guest did something wrong; answered with an exception, never fatal.
	Guest,
	/// An exit nobody handles. Surfaced to the host with the VMCS snapshot.
	UnhandledExit,
	/// Allocation failures, bad ids, busy resources. The VM stays consistent.
	Resource,
	/// Broken internal state. Fatal.
	Invariant,
}

/// An exception to be reflected into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
	pub vector: u8,
	pub errcode: Option<u32>,
	/// Faulting linear address for `#PF`.
	pub cr2: Option<u64>,
}

impl Fault {
	pub const fn new(vector: u8, errcode: Option<u32>) -> Self {
		Self {
			vector,
			errcode,
			cr2: None,
		}
	}

	pub const fn gp(errcode: u32) -> Self {
		Self::new(crate::consts::IDT_GP, Some(errcode))
	}

	pub const fn ud() -> Self {
		Self::new(crate::consts::IDT_UD, None)
	}

	pub const fn ss(errcode: u32) -> Self {
		Self::new(crate::consts::IDT_SS, Some(errcode))
	}

	pub const fn pf(errcode: u32, cr2: u64) -> Self {
		Self {
			vector: crate::consts::IDT_PF,
			errcode: Some(errcode),
			cr2: Some(cr2),
		}
	}
}

#[derive(Error, Debug)]
pub enum VmmError {
	#[error("guest fault: vector {} errcode {:?}", .0.vector, .0.errcode)]
	GuestFault(Fault),
	#[error("malformed guest structure: {0}")]
	GuestBug(String),
	#[error("guest physical range {gpa:#x}+{len:#x} is not backed by memory")]
	Unmapped { gpa: u64, len: usize },

	#[error("unhandled exit reason {reason} (qualification {qualification:#x})")]
	UnhandledExit { reason: u32, qualification: u64 },
	#[error("unhandled {} of {bytes} byte(s) at port {port:#x}", direction(.is_in))]
	UnhandledPort { port: u16, bytes: u8, is_in: bool },
	#[error("unhandled memory access at {0:#x}")]
	UnhandledMmio(u64),
	#[error("unhandled MSR {0:#x}")]
	UnhandledMsr(u32),
	#[error("instruction emulation failed: {0}")]
	Emulation(String),

	#[error("vCPU id {0} is out of range")]
	InvalidVcpu(usize),
	#[error("vCPU {0} is already active")]
	Busy(usize),
	#[error("the virtual machine is already suspended")]
	AlreadySuspended,
	#[error("not every active vCPU is suspended")]
	NotSuspended,
	#[error("too many memory segments")]
	TooManySegments,
	#[error("invalid memory segment {gpa:#x}+{len:#x}")]
	InvalidSegment { gpa: u64, len: usize },
	#[error("memory segment {gpa:#x}+{len:#x} overlaps an existing one")]
	SegmentOverlap { gpa: u64, len: usize },
	#[error("port range {port:#x}+{len} is already claimed")]
	PortConflict { port: u16, len: u16 },
	#[error("MMIO range {base:#x}+{len:#x} is already claimed")]
	MmioConflict { base: u64, len: u64 },
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("{0} is not supported on this host")]
	Unsupported(&'static str),
	#[error("host memory allocation failed: {0}")]
	OutOfMemory(nix::errno::Errno),
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Os(#[from] nix::errno::Errno),
	#[error(transparent)]
	Loader(#[from] LoaderError),
	#[error(transparent)]
	Pci(#[from] PciError),
	#[error(transparent)]
	Virtio(#[from] VirtioError),

	#[error("{control}: bit {bit} {problem}")]
	ControlSetting {
		control: &'static str,
		bit: u32,
		problem: &'static str,
	},
	#[error("vCPU {vcpu}: invalid state transition {from:?} -> {to:?}")]
	StateTransition {
		vcpu: usize,
		from: crate::vm::VcpuState,
		to: crate::vm::VcpuState,
	},
	#[error("vCPU {vcpu}: VM entry failed (instruction error {error})")]
	EntryFailed { vcpu: usize, error: u64 },
	#[error("hypervisor failure: {0}")]
	Hypervisor(String),
}

fn direction(is_in: &bool) -> &'static str {
	if *is_in { "in" } else { "out" }
}

impl VmmError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			VmmError::GuestFault(_)
			| VmmError::GuestBug(_)
			| VmmError::Unmapped { .. }
			| VmmError::Virtio(_) => ErrorKind::Guest,
			VmmError::UnhandledExit { .. }
			| VmmError::UnhandledPort { .. }
			| VmmError::UnhandledMmio(_)
			| VmmError::UnhandledMsr(_)
			| VmmError::Emulation(_) => ErrorKind::UnhandledExit,
			VmmError::InvalidVcpu(_)
			| VmmError::Busy(_)
			| VmmError::AlreadySuspended
			| VmmError::NotSuspended
			| VmmError::TooManySegments
			| VmmError::InvalidSegment { .. }
			| VmmError::SegmentOverlap { .. }
			| VmmError::PortConflict { .. }
			| VmmError::MmioConflict { .. }
			| VmmError::InvalidArgument(_)
			| VmmError::Unsupported(_)
			| VmmError::OutOfMemory(_)
			| VmmError::Io(_)
			| VmmError::Os(_)
			| VmmError::Loader(_)
			| VmmError::Pci(_) => ErrorKind::Resource,
			VmmError::ControlSetting { .. }
			| VmmError::StateTransition { .. }
			| VmmError::EntryFailed { .. }
			| VmmError::Hypervisor(_) => ErrorKind::Invariant,
		}
	}
}

impl From<Fault> for VmmError {
	fn from(fault: Fault) -> Self {
		VmmError::GuestFault(fault)
	}
}

#[cfg(target_os = "macos")]
impl From<xhypervisor::Error> for VmmError {
	fn from(err: xhypervisor::Error) -> Self {
		VmmError::Hypervisor(format!("{err:?}"))
	}
}

/// Poisoned locks mean a thread died while mutating shared VM state.
pub(crate) trait LockExt<T> {
	fn locked(&self) -> MutexGuard<'_, T>;
}

impl<T> LockExt<T> for Mutex<T> {
	fn locked(&self) -> MutexGuard<'_, T> {
		self.lock().unwrap_or_else(|_| {
			error!("lock poisoned by a panicking thread");
			std::process::abort()
		})
	}
}

pub(crate) fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
	cv.wait(guard).unwrap_or_else(|_| {
		error!("lock poisoned while waiting");
		std::process::abort()
	})
}

pub(crate) fn wait_timeout<'a, T>(
	cv: &Condvar,
	guard: MutexGuard<'a, T>,
	timeout: Duration,
) -> MutexGuard<'a, T> {
	match cv.wait_timeout(guard, timeout) {
		Ok((guard, _)) => guard,
		Err(_) => {
			error!("lock poisoned while waiting");
			std::process::abort()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kinds() {
		assert_eq!(VmmError::from(Fault::ud()).kind(), ErrorKind::Guest);
		assert_eq!(VmmError::InvalidVcpu(40).kind(), ErrorKind::Resource);
		assert_eq!(VmmError::AlreadySuspended.kind(), ErrorKind::Resource);
		assert_eq!(
			VmmError::UnhandledExit {
				reason: 99,
				qualification: 0
			}
			.kind(),
			ErrorKind::UnhandledExit
		);
		assert_eq!(
			VmmError::EntryFailed { vcpu: 0, error: 7 }.kind(),
			ErrorKind::Invariant
		);
	}

	#[test]
	fn display() {
		let err = VmmError::UnhandledPort {
			port: 0x3f8,
			bytes: 1,
			is_in: true,
		};
		assert_eq!(err.to_string(), "unhandled in of 1 byte(s) at port 0x3f8");
	}
}
