use std::{fmt, num::NonZeroU32, path::PathBuf, str::FromStr};

use byte_unit::{Byte, Unit};
use core_affinity::CoreId;
use thiserror::Error;
use uuid::Uuid;

use crate::{
	consts::{MIB, PAGE_SIZE, VM_MAXCPU},
	firmware::Firmware,
	pci::{SlotSpec, lpc::LpcConfig},
	vm::VmConfig,
};

/// Everything the command line decides about a VM.
#[derive(Debug, Clone)]
pub struct Params {
	/// Guest RAM size
	pub memory_size: GuestMemorySize,

	/// Number of guest CPUs
	pub cpu_count: CpuCount,

	/// Host cores the vCPU threads are pinned to, by vCPU id
	pub affinity: Option<Vec<CoreId>>,

	/// UUID reported to the guest and used to derive MAC addresses
	pub uuid: Option<Uuid>,

	/// Generate ACPI tables
	pub acpi: bool,

	/// Exit on HLT
	pub hlt_exit: bool,

	/// Exit on PAUSE
	pub pause_exit: bool,

	/// The RTC keeps UTC instead of local time
	pub rtc_utc: bool,

	/// Ignore accesses to unknown MSRs
	pub ignore_unknown_msr: bool,

	/// Fail on accesses to unregistered I/O ports
	pub strictio: bool,

	/// Force virtio devices to a single MSI vector
	pub virtio_single_msi: bool,

	/// Expose x2APIC mode
	pub x2apic: bool,

	/// Skip the MP table
	pub no_mptable: bool,

	/// GDB server port
	pub gdb_port: Option<u16>,

	/// PCI slots
	pub slots: Vec<SlotSpec>,

	/// Backends of the LPC devices
	pub lpc: LpcConfig,

	/// How the guest boots
	pub firmware: Option<Firmware>,

	/// File that holds the process id while the VM runs
	pub pidfile: Option<PathBuf>,

	/// Collect run statistics
	pub stats: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for Params {
	fn default() -> Self {
		Self {
			memory_size: Default::default(),
			cpu_count: Default::default(),
			affinity: None,
			uuid: None,
			acpi: false,
			hlt_exit: false,
			pause_exit: false,
			rtc_utc: false,
			ignore_unknown_msr: false,
			strictio: false,
			virtio_single_msi: false,
			x2apic: false,
			no_mptable: false,
			gdb_port: None,
			slots: Default::default(),
			lpc: Default::default(),
			firmware: None,
			pidfile: None,
			stats: false,
		}
	}
}

impl Params {
	pub fn vm_config(&self) -> VmConfig {
		VmConfig {
			ncpus: self.cpu_count.get() as usize,
			hlt_exit: self.hlt_exit,
			pause_exit: self.pause_exit,
			strictio: self.strictio,
			strictmsr: !self.ignore_unknown_msr,
			x2apic: self.x2apic,
			rtc_localtime: !self.rtc_utc,
			mptable: !self.no_mptable,
			acpi: self.acpi,
			virtio_msix: !self.virtio_single_msi,
			uuid: self.uuid,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCount(NonZeroU32);

impl CpuCount {
	pub fn get(self) -> u32 {
		self.0.get()
	}
}

impl Default for CpuCount {
	fn default() -> Self {
		Self(NonZeroU32::MIN)
	}
}

impl fmt::Display for CpuCount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidCpuCountError {
	#[error("invalid vCPU count {0:?}")]
	Parse(String),
	#[error("at least one vCPU is required")]
	Zero,
	#[error("at most {max} vCPUs are supported (requested {0})", max = VM_MAXCPU)]
	TooMany(u32),
}

impl TryFrom<u32> for CpuCount {
	type Error = InvalidCpuCountError;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		let count = NonZeroU32::new(value).ok_or(InvalidCpuCountError::Zero)?;
		if value as usize > VM_MAXCPU {
			return Err(InvalidCpuCountError::TooMany(value));
		}
		Ok(Self(count))
	}
}

impl FromStr for CpuCount {
	type Err = InvalidCpuCountError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let count: u32 = s
			.trim()
			.parse()
			.map_err(|_| InvalidCpuCountError::Parse(s.to_string()))?;
		count.try_into()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestMemorySize(Byte);

impl GuestMemorySize {
	pub fn get(self) -> u64 {
		self.0.as_u64()
	}
}

impl Default for GuestMemorySize {
	fn default() -> Self {
		Self(Byte::from_u64(256 * MIB))
	}
}

impl fmt::Display for GuestMemorySize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:.0}", self.0.get_appropriate_unit(byte_unit::UnitType::Binary))
	}
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidGuestMemorySizeError {
	#[error("invalid memory size {0:?}")]
	Parse(String),
	#[error("memory size {0:?} overflows")]
	Overflow(String),
	#[error("guest memory must not be empty")]
	Empty,
	#[error(
		"Invalid amount of guest memory. Must be a multiple of 4 KiB (is {cur:#.3})",
		cur = .0.get_adjusted_unit(Unit::KiB),
	)]
	NotPageAligned(Byte),
}

/// Parses `expand_number(3)` syntax: a decimal number with an optional
/// binary suffix from `k` to `e`.
fn expand_number(s: &str) -> Result<u64, InvalidGuestMemorySizeError> {
	let s = s.trim();
	let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
	let (number, suffix) = s.split_at(digits);
	let number: u64 = number
		.parse()
		.map_err(|_| InvalidGuestMemorySizeError::Parse(s.to_string()))?;
	let shift = match suffix.to_ascii_lowercase().as_str() {
		"" | "b" => 0,
		"k" => 10,
		"m" => 20,
		"g" => 30,
		"t" => 40,
		"p" => 50,
		"e" => 60,
		_ => return Err(InvalidGuestMemorySizeError::Parse(s.to_string())),
	};
	number
		.checked_mul(1 << shift)
		.ok_or_else(|| InvalidGuestMemorySizeError::Overflow(s.to_string()))
}

impl TryFrom<u64> for GuestMemorySize {
	type Error = InvalidGuestMemorySizeError;

	/// Sizes below 1 MiB count in MiB.
	fn try_from(value: u64) -> Result<Self, Self::Error> {
		let bytes = if value < MIB {
			value
				.checked_mul(MIB)
				.ok_or(InvalidGuestMemorySizeError::Overflow(value.to_string()))?
		} else {
			value
		};
		if bytes == 0 {
			Err(InvalidGuestMemorySizeError::Empty)
		} else if bytes % PAGE_SIZE as u64 != 0 {
			Err(InvalidGuestMemorySizeError::NotPageAligned(Byte::from_u64(bytes)))
		} else {
			Ok(Self(Byte::from_u64(bytes)))
		}
	}
}

impl FromStr for GuestMemorySize {
	type Err = InvalidGuestMemorySizeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		expand_number(s)?.try_into()
	}
}
