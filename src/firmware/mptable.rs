//! Intel MultiProcessor Specification 1.4 tables, for guests that look for
//! processors and interrupt routing without ACPI.

use zerocopy::{Immutable, IntoBytes};

use crate::{
	consts::{APIC_DEFAULT_BASE, IOAPIC_BASE},
	error::Result,
	vm::Vm,
};

pub const MPTABLE_BASE: u64 = 0xf_0000;
const MPTABLE_MAX_LENGTH: usize = 0x1_0000 - 16;

const MP_SPEC_REV: u8 = 4;
const LAPIC_VERSION: u8 = 0x14;
const IOAPIC_VERSION: u8 = 0x11;
/// Family 6 with FPU and APIC in the feature flags.
const CPU_SIGNATURE: u32 = 0x600;
const CPU_FEATURES: u32 = 0x201;

const ENTRY_PROCESSOR: u8 = 0;
const ENTRY_BUS: u8 = 1;
const ENTRY_IOAPIC: u8 = 2;
const ENTRY_IO_INT: u8 = 3;
const ENTRY_LOCAL_INT: u8 = 4;

const PROC_ENABLED: u8 = 1;
const PROC_BSP: u8 = 2;

const INT_TYPE_INT: u8 = 0;
const INT_TYPE_NMI: u8 = 1;
const INT_TYPE_EXTINT: u8 = 3;
/// Active low, level triggered.
const INT_FLAGS_PCI: u16 = 0x0f;

pub const PCI_BUS: u8 = 0;
pub const ISA_BUS: u8 = 1;
const ISA_IRQS: u8 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable)]
struct FloatingPointer {
	signature: [u8; 4],
	config: u32,
	length: u8,
	spec_rev: u8,
	checksum: u8,
	features: [u8; 5],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable)]
struct ConfigHeader {
	signature: [u8; 4],
	base_table_length: u16,
	spec_rev: u8,
	checksum: u8,
	oem_id: [u8; 8],
	product_id: [u8; 12],
	oem_table: u32,
	oem_table_size: u16,
	entry_count: u16,
	lapic_address: u32,
	extended_table_length: u16,
	extended_table_checksum: u8,
	reserved: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable)]
struct ProcessorEntry {
	kind: u8,
	apic_id: u8,
	apic_version: u8,
	flags: u8,
	signature: u32,
	features: u32,
	reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable)]
struct BusEntry {
	kind: u8,
	bus_id: u8,
	bus_type: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable)]
struct IoapicEntry {
	kind: u8,
	apic_id: u8,
	apic_version: u8,
	flags: u8,
	address: u32,
}

/// Both I/O and local interrupt assignments.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable)]
struct IntEntry {
	kind: u8,
	int_type: u8,
	flags: u16,
	src_bus: u8,
	src_irq: u8,
	dst_apic: u8,
	dst_pin: u8,
}

fn checksum(bytes: &[u8]) -> u8 {
	0u8.wrapping_sub(bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)))
}

fn pad<const N: usize>(s: &str) -> [u8; N] {
	let mut out = [b' '; N];
	out[..s.len().min(N)].copy_from_slice(&s.as_bytes()[..s.len().min(N)]);
	out
}

/// The entries after the header, with their count.
fn entries(vm: &Vm) -> (Vec<u8>, u16) {
	let mut buf = Vec::new();
	let mut count = 0u16;
	let mut push = |bytes: &[u8]| {
		buf.extend_from_slice(bytes);
		count += 1;
	};

	for vcpu in 0..vm.ncpus() {
		let entry = ProcessorEntry {
			kind: ENTRY_PROCESSOR,
			apic_id: vcpu as u8,
			apic_version: LAPIC_VERSION,
			flags: PROC_ENABLED | if vcpu == 0 { PROC_BSP } else { 0 },
			signature: CPU_SIGNATURE,
			features: CPU_FEATURES,
			..Default::default()
		};
		push(entry.as_bytes());
	}

	for (bus_id, name) in [(PCI_BUS, "PCI"), (ISA_BUS, "ISA")] {
		let entry = BusEntry {
			kind: ENTRY_BUS,
			bus_id,
			bus_type: pad(name),
		};
		push(entry.as_bytes());
	}

	let ioapic_id = vm.ncpus() as u8;
	let entry = IoapicEntry {
		kind: ENTRY_IOAPIC,
		apic_id: ioapic_id,
		apic_version: IOAPIC_VERSION,
		flags: PROC_ENABLED,
		address: IOAPIC_BASE as u32,
	};
	push(entry.as_bytes());

	// Pin 0 is the 8259 cascade; ISA IRQ 0 arrives on pin 2.
	let isa = |int_type, src_irq, dst_pin| IntEntry {
		kind: ENTRY_IO_INT,
		int_type,
		flags: 0,
		src_bus: ISA_BUS,
		src_irq,
		dst_apic: ioapic_id,
		dst_pin,
	};
	push(isa(INT_TYPE_EXTINT, 0, 0).as_bytes());
	for pin in 1..ISA_IRQS {
		let src_irq = if pin == 2 { 0 } else { pin };
		push(isa(INT_TYPE_INT, src_irq, pin).as_bytes());
	}

	for route in vm.pci().intx_routes() {
		let entry = IntEntry {
			kind: ENTRY_IO_INT,
			int_type: INT_TYPE_INT,
			flags: INT_FLAGS_PCI,
			src_bus: PCI_BUS,
			src_irq: (route.slot << 2) | (route.pin - 1),
			dst_apic: ioapic_id,
			dst_pin: route.ioapic_irq,
		};
		push(entry.as_bytes());
	}

	for (int_type, lint) in [(INT_TYPE_EXTINT, 0), (INT_TYPE_NMI, 1)] {
		let entry = IntEntry {
			kind: ENTRY_LOCAL_INT,
			int_type,
			flags: 0,
			src_bus: ISA_BUS,
			src_irq: 0,
			dst_apic: 0xff,
			dst_pin: lint,
		};
		push(entry.as_bytes());
	}
	(buf, count)
}

/// Writes the floating pointer and the configuration table at 0xf0000.
pub fn build(vm: &Vm) -> Result<()> {
	let (body, entry_count) = entries(vm);
	let config_addr = MPTABLE_BASE + size_of::<FloatingPointer>() as u64;

	let mut header = ConfigHeader {
		signature: *b"PCMP",
		base_table_length: (size_of::<ConfigHeader>() + body.len()) as u16,
		spec_rev: MP_SPEC_REV,
		oem_id: pad("XHV"),
		product_id: pad("xhv"),
		entry_count,
		lapic_address: APIC_DEFAULT_BASE as u32,
		..Default::default()
	};
	let mut table = header.as_bytes().to_vec();
	table.extend_from_slice(&body);
	header.checksum = checksum(&table);
	table[..size_of::<ConfigHeader>()].copy_from_slice(header.as_bytes());

	let mut fp = FloatingPointer {
		signature: *b"_MP_",
		config: config_addr as u32,
		length: 1,
		spec_rev: MP_SPEC_REV,
		..Default::default()
	};
	fp.checksum = checksum(fp.as_bytes());

	if size_of::<FloatingPointer>() + table.len() > MPTABLE_MAX_LENGTH {
		return Err(crate::error::VmmError::InvalidArgument(
			"MP table does not fit below 1 MiB".into(),
		));
	}
	super::copy_in(vm, "MP floating pointer", MPTABLE_BASE, fp.as_bytes())?;
	super::copy_in(vm, "MP table", config_addr, &table)?;
	debug!("MP table with {entry_count} entries at {config_addr:#x}");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		consts::MIB,
		pci::{SlotSpec, lpc::LpcConfig},
		vm::VmConfig,
		vmx::mock::MockBackend,
	};
	use std::sync::Arc;

	fn read(vm: &Vm, gpa: u64, len: usize) -> Vec<u8> {
		let mut buf = vec![0; len];
		vm.mem().read(gpa, &mut buf).unwrap();
		buf
	}

	#[test]
	fn struct_sizes() {
		assert_eq!(size_of::<FloatingPointer>(), 16);
		assert_eq!(size_of::<ConfigHeader>(), 44);
		assert_eq!(size_of::<ProcessorEntry>(), 20);
		assert_eq!(size_of::<BusEntry>(), 8);
		assert_eq!(size_of::<IoapicEntry>(), 8);
		assert_eq!(size_of::<IntEntry>(), 8);
	}

	#[test]
	fn table_contents() {
		let config = VmConfig {
			ncpus: 2,
			..Default::default()
		};
		let vm = Vm::create(Arc::new(MockBackend::new()), config).unwrap();
		vm.setup_memory(16 * MIB).unwrap();
		let slots: Vec<SlotSpec> = ["0,hostbridge", "3,virtio-net", "31,lpc"]
			.iter()
			.map(|s| s.parse().unwrap())
			.collect();
		crate::pci::init(&vm, &slots, &LpcConfig::default()).unwrap();
		build(&vm).unwrap();

		let fp = read(&vm, MPTABLE_BASE, 16);
		assert_eq!(&fp[..4], b"_MP_");
		assert_eq!(fp.iter().fold(0u8, |s, b| s.wrapping_add(*b)), 0);
		let config = u32::from_le_bytes(fp[4..8].try_into().unwrap()) as u64;
		assert_eq!(config, MPTABLE_BASE + 16);

		let header = read(&vm, config, 44);
		assert_eq!(&header[..4], b"PCMP");
		let len = u16::from_le_bytes([header[4], header[5]]) as usize;
		let count = u16::from_le_bytes([header[34], header[35]]);
		let table = read(&vm, config, len);
		assert_eq!(table.iter().fold(0u8, |s, b| s.wrapping_add(*b)), 0);
		// 2 CPUs, 2 buses, 1 IOAPIC, 16 ISA, 1 PCI INTx, 2 local.
		assert_eq!(count, 24);
		assert_eq!(len, 44 + 2 * 20 + 22 * 8);

		let entries = &table[44..];
		assert_eq!(entries[0], ENTRY_PROCESSOR);
		assert_eq!(entries[3], PROC_ENABLED | PROC_BSP);
		assert_eq!(entries[23], PROC_ENABLED);
		let ioapic = &entries[40 + 16..40 + 24];
		assert_eq!((ioapic[0], ioapic[1]), (ENTRY_IOAPIC, 2));

		let ints: Vec<&[u8]> = entries[40 + 24..].chunks(8).collect();
		// ISA IRQ 0 is wired to pin 2.
		assert_eq!((ints[2][5], ints[2][7]), (0, 2));
		let pci = ints[16];
		assert_eq!(pci[4], PCI_BUS);
		assert_eq!(pci[5], 3 << 2);
		assert!((16..24).contains(&pci[7]));
		assert_eq!(ints[17][1], INT_TYPE_EXTINT);
		assert_eq!(ints[18][1], INT_TYPE_NMI);
	}
}
