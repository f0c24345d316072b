#![allow(dead_code)]

use std::{fs, path::Path, time::Duration};

use byte_unit::{Byte, Unit};
use xhvlib::{
	Vm,
	firmware::Firmware,
	params::Params,
	vmx::{
		backend::Reg,
		mock::{MockExit, MockRecord},
		vmcs::{VMCS_INTR_VALID, reason},
	},
};

pub const RFLAGS_IF: u64 = 0x202;

pub fn init_logging() {
	env_logger::builder().is_test(true).try_init().ok();
}

/// A boot ROM made of HLT instructions.
pub fn bootrom(dir: &Path) -> Firmware {
	let path = dir.join("rom.bin");
	fs::write(&path, [0xf4u8; 0x1000]).unwrap();
	Firmware::Bootrom(path)
}

/// Parameters for a small VM booting `firmware`.
pub fn params(firmware: Firmware) -> Params {
	Params {
		memory_size: Byte::from_u64_with_unit(32, Unit::MiB)
			.unwrap()
			.as_u64()
			.try_into()
			.unwrap(),
		firmware: Some(firmware),
		..Default::default()
	}
}

pub fn wrmsr(msr: u32, value: u64) -> MockExit {
	MockExit::new(reason::WRMSR)
		.inst_len(2)
		.reg(Reg::Rcx, msr as u64)
		.reg(Reg::Rax, value & 0xffff_ffff)
		.reg(Reg::Rdx, value >> 32)
}

pub fn hlt(rflags: u64) -> MockExit {
	MockExit::new(reason::HLT).inst_len(1).reg(Reg::Rflags, rflags)
}

/// A guest instruction that keeps the vCPU busy for `delay`.
pub fn busy(delay: Duration) -> MockExit {
	MockExit::new(reason::PAUSE).inst_len(2).after(delay)
}

pub const X2APIC_EOI: u32 = 0x80b;
pub const X2APIC_SVR: u32 = 0x80f;
pub const X2APIC_ICR: u32 = 0x830;

/// Enables the local APIC, then `count` times waits for an interrupt with
/// HLT and acknowledges it.
pub fn interrupt_loop(count: usize) -> Vec<MockExit> {
	let mut script = vec![wrmsr(X2APIC_SVR, 0x1ff)];
	for _ in 0..count {
		script.push(hlt(RFLAGS_IF));
		script.push(wrmsr(X2APIC_EOI, 0));
	}
	script
}

/// Routes IOAPIC `pin` as an edge-triggered fixed interrupt to vCPU 0.
pub fn route_ioapic_pin(vm: &Vm, pin: u8, vector: u8) {
	let ioapic = vm.ioapic();
	let index = 0x10 + 2 * pin as u64;
	ioapic.mmio_write(vm, 0, 0x00, 4, index).unwrap();
	ioapic.mmio_write(vm, 0, 0x10, 4, vector as u64).unwrap();
	ioapic.mmio_write(vm, 0, 0x00, 4, index + 1).unwrap();
	ioapic.mmio_write(vm, 0, 0x10, 4, 0).unwrap();
}

/// Vectors injected into a vCPU, in order.
pub fn injected_vectors(record: &MockRecord) -> Vec<u8> {
	record
		.injected()
		.into_iter()
		.filter(|info| info & VMCS_INTR_VALID != 0)
		.map(|info| info as u8)
		.collect()
}
