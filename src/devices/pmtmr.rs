//! ACPI power-management timer: a free-running 24-bit counter at
//! 3.579545 MHz, read-only at port 0x408.

use std::{sync::Mutex, time::Instant};

use crate::{
	error::{LockExt, Result, VmmError},
	inout::{self, PortFlags},
	vm::Vm,
};

pub const IO_PMTMR: u16 = 0x408;
pub const PMTMR_FREQ: u64 = 3_579_545;
const PMTMR_MASK: u64 = 0x00ff_ffff;

#[derive(Debug)]
pub struct Pmtmr {
	/// When the counter read zero.
	base: Mutex<Instant>,
}

impl Default for Pmtmr {
	fn default() -> Self {
		Self::new()
	}
}

impl Pmtmr {
	pub fn new() -> Self {
		Self {
			base: Mutex::new(Instant::now()),
		}
	}

	pub fn reset(&self) {
		*self.base.locked() = Instant::now();
	}

	pub fn value(&self) -> u32 {
		let elapsed = self.base.locked().elapsed().as_nanos();
		let ticks = (elapsed * PMTMR_FREQ as u128 / 1_000_000_000) as u64;
		(ticks & PMTMR_MASK) as u32
	}
}

pub fn register_ports(vm: &Vm) -> Result<()> {
	vm.inout().register(
		"ACPI PM timer",
		IO_PMTMR,
		4,
		PortFlags::IN,
		inout::handler(|vm, _, is_in, port, bytes, eax| {
			if bytes != 4 || port != IO_PMTMR {
				return Err(VmmError::UnhandledPort { port, bytes, is_in });
			}
			*eax = vm.pmtmr().value();
			Ok(())
		}),
	)
}
