//! PCI bus 0: configuration mechanism #1, BAR allocation and decoding, and
//! the slot table. Interrupt routing lives in [`irq`], MSI and MSI-X in
//! [`msi`].

pub mod hostbridge;
pub mod irq;
pub mod lpc;
pub mod msi;

use std::{
	collections::BTreeMap,
	fmt,
	str::FromStr,
	sync::{
		Arc, Mutex, MutexGuard, RwLock,
		atomic::{AtomicU8, Ordering},
	},
};

use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{
	consts::{GIB, HIGHMEM_BASE},
	emulate::size2mask,
	error::{LockExt, Result, VmmError},
	inout::{self, PortFlags},
	mmio::{self, MemFlags, MmioDir},
	vm::{SuspendHow, Vm},
};

pub const PCI_SLOTS: u8 = 32;
pub const PCI_FUNCS: u8 = 8;
pub const MAX_BARS: usize = 6;

pub const CONF1_ADDR_PORT: u16 = 0xcf8;
pub const CONF1_DATA_PORT: u16 = 0xcfc;
/// PIIX reset control register.
pub const RESET_CONTROL_PORT: u16 = 0xcf9;
const CONF1_ENABLE: u32 = 0x8000_0000;

// Guest physical windows BARs are carved from.
const PCI_EMUL_IOBASE: u64 = 0x2000;
const PCI_EMUL_IOLIMIT: u64 = 0x1_0000;
const PCI_EMUL_MEMLIMIT32: u64 = 0xe000_0000;
const PCI_EMUL_MEMBASE64: u64 = 0xd0_0000_0000;
const PCI_EMUL_MEMLIMIT64: u64 = 0xfd_0000_0000;
/// 64-bit BARs up to this size are placed below 4 GiB.
const MEM64_LOW_LIMIT: u64 = 32 * 1024 * 1024;

pub const PCIR_VENDOR: u8 = 0x00;
pub const PCIR_DEVICE: u8 = 0x02;
pub const PCIR_COMMAND: u8 = 0x04;
pub const PCIR_STATUS: u8 = 0x06;
pub const PCIR_REVID: u8 = 0x08;
pub const PCIR_PROGIF: u8 = 0x09;
pub const PCIR_SUBCLASS: u8 = 0x0a;
pub const PCIR_CLASS: u8 = 0x0b;
pub const PCIR_HDRTYPE: u8 = 0x0e;
pub const PCIR_BAR0: u8 = 0x10;
pub const PCIR_SUBVEND: u8 = 0x2c;
pub const PCIR_SUBDEV: u8 = 0x2e;
pub const PCIR_CAP_PTR: u8 = 0x34;
pub const PCIR_INTLINE: u8 = 0x3c;
pub const PCIR_INTPIN: u8 = 0x3d;
const CAP_START_OFFSET: u8 = 0x40;

pub const PCIM_CMD_PORTEN: u16 = 0x0001;
pub const PCIM_CMD_MEMEN: u16 = 0x0002;
pub const PCIM_CMD_BUSMASTEREN: u16 = 0x0004;
pub const PCIM_CMD_INTXDIS: u16 = 0x0400;
pub const PCIM_STATUS_CAPPRESENT: u16 = 0x0010;

const PCIM_BAR_IO_SPACE: u32 = 0x1;
const PCIM_BAR_MEM_64: u32 = 0x4;
const PCIM_BAR_MEM_PREFETCH: u32 = 0x8;

pub const PCIC_BRIDGE: u8 = 0x06;
pub const PCIS_BRIDGE_HOST: u8 = 0x00;
pub const PCIS_BRIDGE_ISA: u8 = 0x01;
pub const PCIC_NETWORK: u8 = 0x02;
pub const PCIS_NETWORK_ETHERNET: u8 = 0x00;

#[derive(Error, Debug)]
pub enum PciError {
	#[error("PCI slot {slot}:{func} is out of range")]
	InvalidSlot { slot: u8, func: u8 },
	#[error("PCI slot {slot}:{func} is already occupied")]
	SlotInUse { slot: u8, func: u8 },
	#[error("invalid PCI slot configuration '{0}'")]
	InvalidConfig(String),
	#[error("unknown PCI device emulation '{0}'")]
	UnknownDriver(String),
	#[error("{kind:?} BAR of size {size:#x} does not fit in its window")]
	BarSpaceExhausted { kind: BarType, size: u64 },
	#[error("BAR {0} is invalid for this function")]
	InvalidBar(usize),
	#[error("no room left in the capability list")]
	CapabilitySpace,
	#[error("only one LPC bridge can be configured")]
	DuplicateLpc,
}

/// The value latched in the configuration address register.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub struct PciConfigurationAddress(u32);

impl PciConfigurationAddress {
	pub const fn new(address: u32) -> Self {
		Self(address & (CONF1_ENABLE | 0x00ff_fffc))
	}

	pub const fn raw(self) -> u32 {
		self.0
	}

	pub const fn enabled(self) -> bool {
		self.0 & CONF1_ENABLE != 0
	}

	pub const fn bus(self) -> u8 {
		(self.0 >> 16) as u8
	}

	pub const fn slot(self) -> u8 {
		((self.0 >> 11) & 0x1f) as u8
	}

	pub const fn func(self) -> u8 {
		((self.0 >> 8) & 0x7) as u8
	}

	pub const fn offset(self) -> u8 {
		self.0 as u8
	}
}

/// Type 0 configuration header.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
pub struct PciType0ConfigSpaceHeader {
	pub vendor_id: u16,
	pub device_id: u16,
	pub command: u16,
	pub status: u16,
	pub revision: u8,
	pub prog_if: u8,
	pub subclass: u8,
	pub class: u8,
	pub cache_line_size: u8,
	pub master_latency_timer: u8,
	pub header_type: u8,
	pub bist: u8,
	pub base_address_registers: [u32; MAX_BARS],
	pub cardbus_cis_pointer: u32,
	pub subsystem_vendor_id: u16,
	pub subsystem_id: u16,
	pub expansion_rom_base_address: u32,
	pub capabilities_ptr: u8,
	pub _reserved: [u8; 7],
	pub interrupt_line: u8,
	pub interrupt_pin: u8,
	pub min_gnt: u8,
	pub max_lat: u8,
}

/// The 256-byte configuration space of one function.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct ConfigSpace {
	pub header: PciType0ConfigSpaceHeader,
	pub device: [u8; 192],
}

impl ConfigSpace {
	pub fn read(&self, offset: u8, bytes: u8) -> u32 {
		let start = offset as usize;
		let Some(b) = self.as_bytes().get(start..start + bytes as usize) else {
			return size2mask(bytes) as u32;
		};
		match b {
			[b0] => *b0 as u32,
			[b0, b1] => u16::from_le_bytes([*b0, *b1]) as u32,
			[b0, b1, b2, b3] => u32::from_le_bytes([*b0, *b1, *b2, *b3]),
			_ => size2mask(bytes) as u32,
		}
	}

	pub fn write(&mut self, offset: u8, bytes: u8, val: u32) {
		let start = offset as usize;
		let src = val.to_le_bytes();
		if let Some(dst) = self.as_mut_bytes().get_mut(start..start + bytes as usize) {
			dst.copy_from_slice(&src[..bytes as usize]);
		}
	}

	pub fn read8(&self, offset: u8) -> u8 {
		self.read(offset, 1) as u8
	}

	pub fn read16(&self, offset: u8) -> u16 {
		self.read(offset, 2) as u16
	}

	pub fn read32(&self, offset: u8) -> u32 {
		self.read(offset, 4)
	}
}

impl fmt::Debug for ConfigSpace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConfigSpace")
			.field("header", &self.header)
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarType {
	#[default]
	None,
	Io,
	Mem32,
	Mem64,
	/// Upper half of the preceding 64-bit BAR.
	Mem64Hi,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bar {
	pub kind: BarType,
	pub addr: u64,
	pub size: u64,
}

/// Device-specific behaviour behind a PCI function.
pub trait PciDevice: Send + Sync {
	fn name(&self) -> &'static str;

	/// Claims a configuration read. `None` falls back to the config space.
	fn cfg_read(&self, _vm: &Vm, _pi: &PciFunction, _offset: u8, _bytes: u8) -> Option<u32> {
		None
	}

	/// Claims a configuration write. Returning `false` lets the generic code
	/// handle it.
	fn cfg_write(
		&self,
		_vm: &Vm,
		_pi: &PciFunction,
		_offset: u8,
		_bytes: u8,
		_val: u32,
	) -> Result<bool> {
		Ok(false)
	}

	fn bar_read(
		&self,
		_vm: &Vm,
		_vcpu: usize,
		_pi: &PciFunction,
		_bar: usize,
		_offset: u64,
		size: u8,
	) -> Result<u64> {
		Ok(size2mask(size))
	}

	fn bar_write(
		&self,
		_vm: &Vm,
		_vcpu: usize,
		_pi: &PciFunction,
		_bar: usize,
		_offset: u64,
		_size: u8,
		_value: u64,
	) -> Result<()> {
		Ok(())
	}
}

#[derive(Debug)]
pub(crate) struct FuncState {
	pub cfg: ConfigSpace,
	pub bars: [Bar; MAX_BARS],
	pub prevcap: u8,
	pub capend: u8,
	pub msi: msi::MsiState,
	pub msix: msi::MsixState,
	pub lintr: irq::Lintr,
}

/// One function on bus 0 with its generic state.
#[derive(Debug)]
pub struct PciFunction {
	name: String,
	slot: u8,
	func: u8,
	state: Mutex<FuncState>,
}

impl PciFunction {
	pub fn new(name: impl Into<String>, slot: u8, func: u8) -> Self {
		Self {
			name: name.into(),
			slot,
			func,
			state: Mutex::new(FuncState {
				cfg: ConfigSpace::new_zeroed(),
				bars: [Bar::default(); MAX_BARS],
				prevcap: 0,
				capend: 0,
				msi: Default::default(),
				msix: Default::default(),
				lintr: Default::default(),
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn slot(&self) -> u8 {
		self.slot
	}

	pub fn func(&self) -> u8 {
		self.func
	}

	pub(crate) fn state(&self) -> MutexGuard<'_, FuncState> {
		self.state.locked()
	}

	pub fn cfg8(&self, offset: u8) -> u8 {
		self.state().cfg.read8(offset)
	}

	pub fn cfg16(&self, offset: u8) -> u16 {
		self.state().cfg.read16(offset)
	}

	pub fn cfg32(&self, offset: u8) -> u32 {
		self.state().cfg.read32(offset)
	}

	pub fn set_cfg8(&self, offset: u8, val: u8) {
		self.state().cfg.write(offset, 1, val as u32);
	}

	pub fn set_cfg16(&self, offset: u8, val: u16) {
		self.state().cfg.write(offset, 2, val as u32);
	}

	pub fn set_cfg32(&self, offset: u8, val: u32) {
		self.state().cfg.write(offset, 4, val);
	}

	/// Sets the identity registers every emulation fills in.
	pub fn set_identity(&self, vendor: u16, device: u16, class: u8, subclass: u8) {
		let mut st = self.state();
		st.cfg.header.vendor_id = vendor;
		st.cfg.header.device_id = device;
		st.cfg.header.class = class;
		st.cfg.header.subclass = subclass;
	}

	pub fn bar(&self, idx: usize) -> Bar {
		self.state().bars.get(idx).copied().unwrap_or_default()
	}

	/// Reserves guest address space for BAR `idx`, enables its decoding
	/// and returns the address.
	pub fn alloc_bar(&self, vm: &Vm, idx: usize, kind: BarType, size: u64) -> Result<u64> {
		if idx >= MAX_BARS || (kind == BarType::Mem64 && idx + 1 >= MAX_BARS) {
			return Err(PciError::InvalidBar(idx).into());
		}
		let mut size = size.max(1).next_power_of_two();
		let (lobits, enbit) = match kind {
			BarType::Io => {
				size = size.max(4);
				(PCIM_BAR_IO_SPACE, PCIM_CMD_PORTEN)
			}
			BarType::Mem32 => {
				size = size.max(16);
				(0, PCIM_CMD_MEMEN)
			}
			BarType::Mem64 => {
				size = size.max(16);
				let prefetch = if size > MEM64_LOW_LIMIT {
					PCIM_BAR_MEM_PREFETCH
				} else {
					0
				};
				(PCIM_BAR_MEM_64 | prefetch, PCIM_CMD_MEMEN)
			}
			BarType::None | BarType::Mem64Hi => return Err(PciError::InvalidBar(idx).into()),
		};
		let addr = vm.pci().windows.locked().allocate(kind, size)?;

		let mut st = self.state();
		st.bars[idx] = Bar { kind, addr, size };
		let mask = if kind == BarType::Io {
			0xffff_fffc
		} else {
			0xffff_fff0
		};
		st.cfg
			.write(PCIR_BAR0 + 4 * idx as u8, 4, (addr as u32 & mask) | lobits);
		if kind == BarType::Mem64 {
			st.bars[idx + 1] = Bar {
				kind: BarType::Mem64Hi,
				..Default::default()
			};
			st.cfg
				.write(PCIR_BAR0 + 4 * (idx + 1) as u8, 4, (addr >> 32) as u32);
		}
		let cmd = st.cfg.header.command;
		st.cfg.header.command = cmd | enbit;
		drop(st);
		register_bar(vm, self, idx, Bar { kind, addr, size })?;
		debug!("{}: BAR {idx} {kind:?} at {addr:#x}+{size:#x}", self.name);
		Ok(addr)
	}

	/// Appends a capability to the list and returns its offset.
	pub fn add_capability(&self, data: &[u8]) -> Result<u8> {
		let mut st = self.state();
		let reallen = data.len().next_multiple_of(4);
		let capoff = if st.capend == 0 {
			CAP_START_OFFSET
		} else {
			st.capend + 1
		};
		if capoff as usize + reallen > 256 {
			return Err(PciError::CapabilitySpace.into());
		}
		if st.cfg.header.status & PCIM_STATUS_CAPPRESENT == 0 {
			st.cfg.header.capabilities_ptr = capoff;
			st.cfg.header.status |= PCIM_STATUS_CAPPRESENT;
		} else {
			let prev = st.prevcap;
			st.cfg.write(prev + 1, 1, capoff as u32);
		}
		for (i, byte) in data.iter().enumerate() {
			st.cfg.write(capoff + i as u8, 1, *byte as u32);
		}
		st.cfg.write(capoff + 1, 1, 0);
		st.prevcap = capoff;
		st.capend = capoff + (reallen - 1) as u8;
		Ok(capoff)
	}

	fn is_cap(st: &FuncState, offset: u8) -> bool {
		st.cfg.header.status & PCIM_STATUS_CAPPRESENT != 0
			&& offset >= CAP_START_OFFSET
			&& offset <= st.capend
	}

	/// Generic configuration write, after the device declined it.
	fn cfg_write(&self, vm: &Vm, coff: u8, bytes: u8, val: u32) -> Result<()> {
		let mut st = self.state();
		let bar_end = PCIR_BAR0 + 4 * MAX_BARS as u8;
		if (PCIR_BAR0..bar_end).contains(&coff) {
			if bytes != 4 || coff & 3 != 0 {
				return Ok(());
			}
			let idx = ((coff - PCIR_BAR0) / 4) as usize;
			self.write_bar(vm, &mut st, idx, val);
		} else if Self::is_cap(&st, coff) {
			self.cap_write(vm, &mut st, coff, bytes, val)?;
		} else if (PCIR_COMMAND..PCIR_REVID).contains(&coff) {
			self.cmdsts_write(vm, &mut st, coff, bytes, val)?;
		} else if is_readonly(coff, bytes) {
			trace!("{}: write to read-only config offset {coff:#x}", self.name);
		} else {
			st.cfg.write(coff, bytes, val);
		}
		Ok(())
	}

	fn write_bar(&self, vm: &Vm, st: &mut FuncState, idx: usize, val: u32) {
		let bar = st.bars[idx];
		let value = match bar.kind {
			BarType::None => {
				st.bars[idx].addr = 0;
				0
			}
			BarType::Io => {
				let mask = !(bar.size as u32 - 1);
				let addr = (val & mask & 0xffff) as u64;
				if addr != bar.addr {
					self.update_bar_address(vm, st, idx, addr);
				}
				addr as u32 | PCIM_BAR_IO_SPACE
			}
			BarType::Mem32 => {
				let mask = !(bar.size as u32 - 1);
				let addr = (val & mask) as u64;
				if addr != bar.addr {
					self.update_bar_address(vm, st, idx, addr);
				}
				addr as u32
			}
			BarType::Mem64 => {
				let mask = !(bar.size - 1) as u32;
				let low = val & mask;
				if low != bar.addr as u32 {
					let addr = (bar.addr & 0xffff_ffff_0000_0000) | low as u64;
					self.update_bar_address(vm, st, idx, addr);
				}
				let lobits = st.cfg.read32(PCIR_BAR0 + 4 * idx as u8) & 0xf;
				low | lobits
			}
			BarType::Mem64Hi => {
				let lo = st.bars[idx - 1];
				let mask = !(lo.size - 1);
				let addr = ((val as u64) << 32) & mask;
				let high = (addr >> 32) as u32;
				if high != (lo.addr >> 32) as u32 {
					let addr = (lo.addr & 0xffff_ffff) | addr;
					self.update_bar_address(vm, st, idx - 1, addr);
				}
				high
			}
		};
		st.cfg.write(PCIR_BAR0 + 4 * idx as u8, 4, value);
	}

	fn decoded(st: &FuncState, kind: BarType) -> bool {
		let cmd = st.cfg.header.command;
		match kind {
			BarType::Io => cmd & PCIM_CMD_PORTEN != 0,
			BarType::Mem32 | BarType::Mem64 => cmd & PCIM_CMD_MEMEN != 0,
			BarType::None | BarType::Mem64Hi => false,
		}
	}

	fn update_bar_address(&self, vm: &Vm, st: &mut FuncState, idx: usize, addr: u64) {
		let bar = st.bars[idx];
		let decode = Self::decoded(st, bar.kind);
		if decode {
			unregister_bar(vm, self, bar);
		}
		st.bars[idx].addr = addr;
		if decode {
			let bar = st.bars[idx];
			if let Err(err) = register_bar(vm, self, idx, bar) {
				warn!("{}: BAR {idx} moved to {addr:#x}: {err}", self.name);
			}
		}
	}

	fn cmdsts_write(
		&self,
		vm: &Vm,
		st: &mut FuncState,
		coff: u8,
		bytes: u8,
		val: u32,
	) -> Result<()> {
		let old_cmd = st.cfg.header.command;
		let readonly = 0xffff_f880u32 >> ((coff & 3) * 8);
		let old = st.cfg.read(coff, bytes);
		st.cfg.write(coff, bytes, (val & !readonly) | (old & readonly));
		let new_cmd = st.cfg.header.command;
		let changed = old_cmd ^ new_cmd;

		for idx in 0..MAX_BARS {
			let bar = st.bars[idx];
			let enbit = match bar.kind {
				BarType::Io => PCIM_CMD_PORTEN,
				BarType::Mem32 | BarType::Mem64 => PCIM_CMD_MEMEN,
				BarType::None | BarType::Mem64Hi => continue,
			};
			if changed & enbit == 0 {
				continue;
			}
			if new_cmd & enbit != 0 {
				if let Err(err) = register_bar(vm, self, idx, bar) {
					warn!("{}: enabling BAR {idx}: {err}", self.name);
				}
			} else {
				unregister_bar(vm, self, bar);
			}
		}
		self.lintr_update(vm, st)
	}

	fn cap_write(&self, vm: &Vm, st: &mut FuncState, coff: u8, bytes: u8, val: u32) -> Result<()> {
		let mut capoff = CAP_START_OFFSET;
		loop {
			let next = st.cfg.read8(capoff + 1);
			if next == 0 || (coff >= capoff && coff < next) {
				break;
			}
			capoff = next;
		}
		let (mut offset, mut bytes, mut val) = (coff, bytes, val);
		// ID and next pointer are read-only, but some guests write them
		// together with the control word.
		if offset == capoff || offset == capoff + 1 {
			if offset == capoff && bytes == 4 {
				offset += 2;
				bytes = 2;
				val >>= 16;
			} else {
				return Ok(());
			}
		}
		match st.cfg.read8(capoff) {
			msi::PCIY_MSI => msi::msicap_write(st, capoff, offset, bytes, val),
			msi::PCIY_MSIX => msi::msixcap_write(st, capoff, offset, bytes, val),
			id => {
				trace!("{}: write to capability {id:#x} ignored", self.name);
				return Ok(());
			}
		}
		self.lintr_update(vm, st)
	}

	/// BAR read as seen by the guest, with the MSI-X table and PBA handled
	/// here and 8-byte accesses split for the device.
	fn bar_read(
		&self,
		vm: &Vm,
		vcpu: usize,
		dev: &dyn PciDevice,
		idx: usize,
		offset: u64,
		size: u8,
	) -> Result<u64> {
		if let Some(value) = msi::msix_bar_read(&self.state(), idx, offset, size) {
			return Ok(value);
		}
		if size == 8 {
			let lo = dev.bar_read(vm, vcpu, self, idx, offset, 4)?;
			let hi = dev.bar_read(vm, vcpu, self, idx, offset + 4, 4)?;
			return Ok((hi << 32) | (lo & 0xffff_ffff));
		}
		dev.bar_read(vm, vcpu, self, idx, offset, size)
	}

	fn bar_write(
		&self,
		vm: &Vm,
		vcpu: usize,
		dev: &dyn PciDevice,
		idx: usize,
		offset: u64,
		size: u8,
		value: u64,
	) -> Result<()> {
		if msi::msix_bar_write(&mut self.state(), idx, offset, size, value) {
			return Ok(());
		}
		if size == 8 {
			dev.bar_write(vm, vcpu, self, idx, offset, 4, value & 0xffff_ffff)?;
			return dev.bar_write(vm, vcpu, self, idx, offset + 4, 4, value >> 32);
		}
		dev.bar_write(vm, vcpu, self, idx, offset, size, value)
	}
}

/// Identity registers, the expansion ROM BAR and the capability pointer.
fn is_readonly(coff: u8, bytes: u8) -> bool {
	let end = coff as u32 + bytes as u32;
	let hits = |lo: u8, hi: u8| (coff as u32) < hi as u32 && end > lo as u32;
	hits(PCIR_VENDOR, PCIR_COMMAND)
		|| hits(PCIR_REVID, 0x0c)
		|| hits(PCIR_HDRTYPE, PCIR_HDRTYPE + 1)
		|| hits(0x28, 0x34)
		|| hits(PCIR_CAP_PTR, PCIR_CAP_PTR + 1)
		|| hits(PCIR_INTPIN, PCIR_INTPIN + 1)
}

fn bar_name(pi: &PciFunction, idx: usize) -> String {
	format!("{} bar{idx}", pi.name)
}

fn register_bar(vm: &Vm, pi: &PciFunction, idx: usize, bar: Bar) -> Result<()> {
	let (slot, func) = (pi.slot, pi.func);
	match bar.kind {
		BarType::Io => vm.inout().register(
			bar_name(pi, idx),
			bar.addr as u16,
			bar.size as u16,
			PortFlags::INOUT,
			inout::handler(move |vm, vcpu, is_in, port, bytes, eax| {
				let Some((pi, dev)) = vm.pci().lookup(slot, func) else {
					if is_in {
						*eax = size2mask(bytes) as u32;
					}
					return Ok(());
				};
				let bar = pi.bar(idx);
				let offset = (port as u64).wrapping_sub(bar.addr);
				if bar.kind != BarType::Io || offset + bytes as u64 > bar.size {
					return Err(VmmError::UnhandledPort { port, bytes, is_in });
				}
				if is_in {
					*eax = pi.bar_read(vm, vcpu, dev.as_ref(), idx, offset, bytes)? as u32;
					Ok(())
				} else {
					pi.bar_write(vm, vcpu, dev.as_ref(), idx, offset, bytes, *eax as u64)
				}
			}),
		),
		BarType::Mem32 | BarType::Mem64 => vm.mmio().register(
			bar_name(pi, idx),
			bar.addr,
			bar.size,
			MemFlags::RW,
			mmio::handler(move |vm, vcpu, dir, gpa, size, value| {
				let Some((pi, dev)) = vm.pci().lookup(slot, func) else {
					*value = size2mask(size);
					return Ok(());
				};
				let bar = pi.bar(idx);
				let offset = gpa.wrapping_sub(bar.addr);
				if offset + size as u64 > bar.size {
					return Err(VmmError::UnhandledMmio(gpa));
				}
				match dir {
					MmioDir::Read => {
						*value = pi.bar_read(vm, vcpu, dev.as_ref(), idx, offset, size)?;
						Ok(())
					}
					MmioDir::Write => {
						pi.bar_write(vm, vcpu, dev.as_ref(), idx, offset, size, *value)
					}
				}
			}),
		),
		BarType::None | BarType::Mem64Hi => Ok(()),
	}
}

fn unregister_bar(vm: &Vm, pi: &PciFunction, bar: Bar) {
	let res = match bar.kind {
		BarType::Io => vm.inout().unregister(bar.addr as u16, bar.size as u16),
		BarType::Mem32 | BarType::Mem64 => vm.mmio().unregister(bar.addr, bar.size),
		BarType::None | BarType::Mem64Hi => Ok(()),
	};
	if let Err(err) = res {
		warn!("{}: {err}", pi.name);
	}
}

/// Bump allocators for the three BAR windows.
#[derive(Debug)]
struct Windows {
	io: u64,
	mem32: u64,
	mem64: u64,
}

impl Windows {
	fn allocate(&mut self, kind: BarType, size: u64) -> Result<u64> {
		let (next, limit) = match kind {
			BarType::Io => (&mut self.io, PCI_EMUL_IOLIMIT),
			BarType::Mem64 if size > MEM64_LOW_LIMIT => (&mut self.mem64, PCI_EMUL_MEMLIMIT64),
			_ => (&mut self.mem32, PCI_EMUL_MEMLIMIT32),
		};
		let base = next.next_multiple_of(size);
		if base + size > limit {
			return Err(PciError::BarSpaceExhausted { kind, size }.into());
		}
		*next = base + size;
		Ok(base)
	}
}

#[derive(Clone)]
struct Attached {
	pi: Arc<PciFunction>,
	dev: Arc<dyn PciDevice>,
}

/// Bus 0 and the chipset state around it.
pub struct PciBus {
	cfg_addr: Mutex<PciConfigurationAddress>,
	funcs: RwLock<BTreeMap<(u8, u8), Attached>>,
	windows: Mutex<Windows>,
	irq: irq::IrqRouter,
	reset_control: AtomicU8,
}

impl fmt::Debug for PciBus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let funcs = self.funcs.read().unwrap_or_else(|e| e.into_inner());
		f.debug_struct("PciBus")
			.field("cfg_addr", &*self.cfg_addr.locked())
			.field(
				"funcs",
				&funcs.values().map(|a| a.pi.name()).collect::<Vec<_>>(),
			)
			.finish_non_exhaustive()
	}
}

impl Default for PciBus {
	fn default() -> Self {
		Self::new()
	}
}

impl PciBus {
	pub fn new() -> Self {
		Self {
			cfg_addr: Mutex::new(PciConfigurationAddress::default()),
			funcs: RwLock::new(BTreeMap::new()),
			windows: Mutex::new(Windows {
				io: PCI_EMUL_IOBASE,
				mem32: crate::consts::LOWMEM_LIMIT,
				mem64: PCI_EMUL_MEMBASE64,
			}),
			irq: irq::IrqRouter::new(),
			reset_control: AtomicU8::new(0),
		}
	}

	pub fn irq(&self) -> &irq::IrqRouter {
		&self.irq
	}

	fn lookup(&self, slot: u8, func: u8) -> Option<(Arc<PciFunction>, Arc<dyn PciDevice>)> {
		let funcs = self.funcs.read().unwrap_or_else(|e| e.into_inner());
		funcs
			.get(&(slot, func))
			.map(|a| (a.pi.clone(), a.dev.clone()))
	}

	pub fn function(&self, slot: u8, func: u8) -> Option<Arc<PciFunction>> {
		self.lookup(slot, func).map(|(pi, _)| pi)
	}

	/// The first function whose device model is called `name`.
	pub fn device_named(&self, name: &str) -> Option<Arc<PciFunction>> {
		let funcs = self.funcs.read().unwrap_or_else(|e| e.into_inner());
		funcs
			.values()
			.find(|a| a.dev.name() == name)
			.map(|a| a.pi.clone())
	}

	pub fn functions(&self) -> Vec<Arc<PciFunction>> {
		let funcs = self.funcs.read().unwrap_or_else(|e| e.into_inner());
		funcs.values().map(|a| a.pi.clone()).collect()
	}

	/// Places an initialised device on the bus.
	pub fn insert(&self, pi: Arc<PciFunction>, dev: Arc<dyn PciDevice>) -> Result<()> {
		let key = (pi.slot, pi.func);
		let mut funcs = self.funcs.write().unwrap_or_else(|e| e.into_inner());
		if funcs.contains_key(&key) {
			return Err(PciError::SlotInUse {
				slot: key.0,
				func: key.1,
			}
			.into());
		}
		info!("PCI {}:{} {}", key.0, key.1, dev.name());
		funcs.insert(key, Attached { pi, dev });
		Ok(())
	}

	fn cfgaddr(&self, is_in: bool, bytes: u8, eax: &mut u32) {
		if bytes != 4 {
			if is_in {
				*eax = size2mask(bytes) as u32;
			}
			return;
		}
		let mut addr = self.cfg_addr.locked();
		if is_in {
			*eax = addr.raw();
		} else {
			*addr = PciConfigurationAddress::new(*eax);
		}
	}

	fn cfgdata(&self, vm: &Vm, is_in: bool, port: u16, bytes: u8, eax: &mut u32) -> Result<()> {
		let addr = *self.cfg_addr.locked();
		if !addr.enabled() {
			if is_in {
				*eax = size2mask(bytes) as u32;
			}
			return Ok(());
		}
		let coff = addr.offset() + (port - CONF1_DATA_PORT) as u8;
		self.cfgrw(vm, is_in, addr.bus(), addr.slot(), addr.func(), coff, bytes, eax)
	}

	/// One configuration space access.
	pub fn cfgrw(
		&self,
		vm: &Vm,
		is_in: bool,
		bus: u8,
		slot: u8,
		func: u8,
		coff: u8,
		bytes: u8,
		eax: &mut u32,
	) -> Result<()> {
		let found = if bus == 0 {
			self.lookup(slot, func)
		} else {
			None
		};
		let Some((pi, dev)) = found.filter(|_| coff & (bytes - 1) == 0) else {
			if is_in {
				*eax = size2mask(bytes) as u32;
			}
			return Ok(());
		};
		if is_in {
			*eax = match dev.cfg_read(vm, &pi, coff, bytes) {
				Some(val) => val,
				None => pi.state().cfg.read(coff, bytes),
			};
			return Ok(());
		}
		if dev.cfg_write(vm, &pi, coff, bytes, *eax)? {
			return Ok(());
		}
		pi.cfg_write(vm, coff, bytes, *eax)
	}

	/// The INTx routes of every slot, for the MP table.
	pub fn intx_routes(&self) -> Vec<irq::IntxRoute> {
		self.irq.routes()
	}
}

/// Claims the configuration and reset control ports.
pub fn register_ports(vm: &Vm) -> Result<()> {
	vm.inout().register(
		"PCI config address",
		CONF1_ADDR_PORT,
		1,
		PortFlags::INOUT,
		inout::handler(|vm, _, is_in, _, bytes, eax| {
			vm.pci().cfgaddr(is_in, bytes, eax);
			Ok(())
		}),
	)?;
	vm.inout().register(
		"reset control",
		RESET_CONTROL_PORT,
		1,
		PortFlags::INOUT,
		inout::handler(|vm, _, is_in, port, bytes, eax| {
			if bytes != 1 {
				return Err(VmmError::UnhandledPort { port, bytes, is_in });
			}
			let reg = &vm.pci().reset_control;
			if is_in {
				*eax = reg.load(Ordering::Relaxed) as u32;
				return Ok(());
			}
			reg.store(*eax as u8, Ordering::Relaxed);
			// Hard and soft resets are the same thing here.
			if *eax & 0x4 != 0 {
				match vm.suspend(SuspendHow::Reset) {
					Ok(()) | Err(VmmError::AlreadySuspended) => {}
					Err(err) => return Err(err),
				}
			}
			Ok(())
		}),
	)?;
	vm.inout().register(
		"PCI config data",
		CONF1_DATA_PORT,
		4,
		PortFlags::INOUT,
		inout::handler(|vm, _, is_in, port, bytes, eax| {
			vm.pci().cfgdata(vm, is_in, port, bytes, eax)
		}),
	)
}

/// `slot[:func],driver[,config]` as given to `-s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
	pub slot: u8,
	pub func: u8,
	pub driver: String,
	pub config: Option<String>,
}

impl FromStr for SlotSpec {
	type Err = PciError;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let invalid = || PciError::InvalidConfig(s.to_string());
		let mut parts = s.splitn(3, ',');
		let location = parts.next().ok_or_else(invalid)?;
		let driver = parts.next().filter(|d| !d.is_empty()).ok_or_else(invalid)?;
		let config = parts.next().map(str::to_string);
		let (slot, func) = match location.split_once(':') {
			Some((slot, func)) => (slot, func),
			None => (location, "0"),
		};
		let slot: u8 = slot.parse().map_err(|_| invalid())?;
		let func: u8 = func.parse().map_err(|_| invalid())?;
		if slot >= PCI_SLOTS || func >= PCI_FUNCS {
			return Err(PciError::InvalidSlot { slot, func });
		}
		Ok(Self {
			slot,
			func,
			driver: driver.to_string(),
			config,
		})
	}
}

fn create_device(
	vm: &Vm,
	pi: &Arc<PciFunction>,
	spec: &SlotSpec,
	lpc: &lpc::LpcConfig,
) -> Result<Arc<dyn PciDevice>> {
	let dev: Arc<dyn PciDevice> = match spec.driver.as_str() {
		"hostbridge" => hostbridge::init(pi, hostbridge::Flavor::NetApp)?,
		"amd_hostbridge" => hostbridge::init(pi, hostbridge::Flavor::Amd)?,
		"lpc" => lpc::init(vm, pi, lpc)?,
		"virtio-net" | "virtio-tap" | "virtio-vpnkit" => {
			crate::virtio::net::init(vm, pi, &spec.driver, spec.config.as_deref())?
		}
		other => return Err(PciError::UnknownDriver(other.to_string()).into()),
	};
	Ok(dev)
}

/// Builds bus 0 from the `-s` slots and routes legacy interrupts. Guest
/// memory must already be installed.
pub fn init(vm: &Vm, slots: &[SlotSpec], lpc: &lpc::LpcConfig) -> Result<()> {
	for spec in slots {
		if vm.pci().function(spec.slot, spec.func).is_some() {
			return Err(PciError::SlotInUse {
				slot: spec.slot,
				func: spec.func,
			}
			.into());
		}
		let pi = Arc::new(PciFunction::new(
			format!("{}@{}:{}", spec.driver, spec.slot, spec.func),
			spec.slot,
			spec.func,
		));
		let dev = create_device(vm, &pi, spec, lpc)?;
		vm.pci().insert(pi, dev)?;
	}

	for pi in vm.pci().functions() {
		pi.lintr_route(vm)?;
	}
	lpc::pirq_routed(vm);

	// Holes not claimed by RAM or a BAR read as all-ones.
	let lowmem = vm.mem().lowmem_size();
	vm.mmio().register_fallback(
		"PCI hole",
		lowmem,
		HIGHMEM_BASE - lowmem,
		mmio::handler(pci_fallback),
	)?;
	vm.mmio().register_fallback(
		"PCI 64-bit hole",
		PCI_EMUL_MEMBASE64,
		PCI_EMUL_MEMLIMIT64 - PCI_EMUL_MEMBASE64,
		mmio::handler(pci_fallback),
	)?;
	debug!(
		"PCI windows: 32-bit {:#x}..{PCI_EMUL_MEMLIMIT32:#x}, 64-bit {PCI_EMUL_MEMBASE64:#x}..{PCI_EMUL_MEMLIMIT64:#x} ({} GiB)",
		crate::consts::LOWMEM_LIMIT,
		(PCI_EMUL_MEMLIMIT64 - PCI_EMUL_MEMBASE64) / GIB
	);
	Ok(())
}

fn pci_fallback(
	_vm: &Vm,
	_vcpu: usize,
	dir: MmioDir,
	_gpa: u64,
	size: u8,
	value: &mut u64,
) -> Result<()> {
	if dir == MmioDir::Read {
		*value = size2mask(size);
	}
	Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::{vm::VmConfig, vmx::mock::MockBackend};

	pub(crate) fn vm() -> Arc<Vm> {
		Vm::create(Arc::new(MockBackend::new()), VmConfig::default()).unwrap()
	}

	pub(crate) struct Dummy;

	impl PciDevice for Dummy {
		fn name(&self) -> &'static str {
			"dummy"
		}

		fn bar_read(
			&self,
			_: &Vm,
			_: usize,
			_: &PciFunction,
			bar: usize,
			offset: u64,
			_: u8,
		) -> Result<u64> {
			Ok(((bar as u64) << 16) | offset)
		}
	}

	pub(crate) fn cfg_read(vm: &Vm, slot: u8, coff: u8, bytes: u8) -> u32 {
		let mut eax = CONF1_ENABLE | ((slot as u32) << 11) | (coff as u32 & 0xfc);
		vm.inout()
			.dispatch(vm, 0, false, CONF1_ADDR_PORT, 4, &mut eax)
			.unwrap();
		let mut val = 0;
		vm.inout()
			.dispatch(vm, 0, true, CONF1_DATA_PORT + (coff & 3) as u16, bytes, &mut val)
			.unwrap();
		val
	}

	pub(crate) fn cfg_write(vm: &Vm, slot: u8, coff: u8, bytes: u8, val: u32) {
		let mut eax = CONF1_ENABLE | ((slot as u32) << 11) | (coff as u32 & 0xfc);
		vm.inout()
			.dispatch(vm, 0, false, CONF1_ADDR_PORT, 4, &mut eax)
			.unwrap();
		let mut val = val;
		vm.inout()
			.dispatch(vm, 0, false, CONF1_DATA_PORT + (coff & 3) as u16, bytes, &mut val)
			.unwrap();
	}

	fn dummy(vm: &Vm, slot: u8) -> Arc<PciFunction> {
		let pi = Arc::new(PciFunction::new("dummy", slot, 0));
		pi.set_identity(0x1234, 0x5678, PCIC_NETWORK, PCIS_NETWORK_ETHERNET);
		pi.alloc_bar(vm, 0, BarType::Io, 0x20).unwrap();
		pi.alloc_bar(vm, 1, BarType::Mem32, 0x1000).unwrap();
		vm.pci().insert(pi.clone(), Arc::new(Dummy)).unwrap();
		pi
	}

	#[test]
	fn slot_spec_parsing() {
		let spec: SlotSpec = "2:1,virtio-net,tap=tap0".parse().unwrap();
		assert_eq!((spec.slot, spec.func), (2, 1));
		assert_eq!(spec.driver, "virtio-net");
		assert_eq!(spec.config.as_deref(), Some("tap=tap0"));
		let spec: SlotSpec = "31,lpc".parse().unwrap();
		assert_eq!((spec.slot, spec.func, spec.config), (31, 0, None));
		assert!("32,lpc".parse::<SlotSpec>().is_err());
		assert!("x,lpc".parse::<SlotSpec>().is_err());
		assert!("3".parse::<SlotSpec>().is_err());
	}

	#[test]
	fn empty_slot_reads_all_ones() {
		let vm = vm();
		assert_eq!(cfg_read(&vm, 5, 0, 4), 0xffff_ffff);
		assert_eq!(cfg_read(&vm, 5, 0, 2), 0xffff);

		// Disabled address latch.
		let mut eax = 0;
		vm.inout()
			.dispatch(&vm, 0, false, CONF1_ADDR_PORT, 4, &mut eax)
			.unwrap();
		let mut val = 0;
		vm.inout()
			.dispatch(&vm, 0, true, CONF1_DATA_PORT, 4, &mut val)
			.unwrap();
		assert_eq!(val, 0xffff_ffff);
	}

	#[test]
	fn address_latch_round_trips() {
		let vm = vm();
		let mut eax = 0x8012_34ff;
		vm.inout()
			.dispatch(&vm, 0, false, CONF1_ADDR_PORT, 4, &mut eax)
			.unwrap();
		let mut val = 0;
		vm.inout()
			.dispatch(&vm, 0, true, CONF1_ADDR_PORT, 4, &mut val)
			.unwrap();
		assert_eq!(val, 0x8012_34fc);
	}

	#[test]
	fn identity_is_read_only() {
		let vm = vm();
		dummy(&vm, 3);
		assert_eq!(cfg_read(&vm, 3, PCIR_VENDOR, 4), 0x5678_1234);
		cfg_write(&vm, 3, PCIR_VENDOR, 4, 0xdead_beef);
		assert_eq!(cfg_read(&vm, 3, PCIR_VENDOR, 4), 0x5678_1234);
		assert_eq!(cfg_read(&vm, 3, PCIR_CLASS, 1), PCIC_NETWORK as u32);
		cfg_write(&vm, 3, PCIR_INTLINE, 1, 11);
		assert_eq!(cfg_read(&vm, 3, PCIR_INTLINE, 1), 11);
	}

	#[test]
	fn bar_sizing_and_relocation() {
		let vm = vm();
		let pi = dummy(&vm, 4);
		let io = pi.bar(0);
		assert_eq!(io.addr, PCI_EMUL_IOBASE);
		assert_eq!(cfg_read(&vm, 4, PCIR_BAR0, 4), PCI_EMUL_IOBASE as u32 | 1);
		let cmd = cfg_read(&vm, 4, PCIR_COMMAND, 2) as u16;
		assert_eq!(cmd & (PCIM_CMD_PORTEN | PCIM_CMD_MEMEN), PCIM_CMD_PORTEN | PCIM_CMD_MEMEN);

		// BAR sizing.
		cfg_write(&vm, 4, PCIR_BAR0 + 4, 4, 0xffff_ffff);
		assert_eq!(cfg_read(&vm, 4, PCIR_BAR0 + 4, 4), 0xffff_f000);
		cfg_write(&vm, 4, PCIR_BAR0 + 4, 4, 0xc100_0000);
		assert_eq!(pi.bar(1).addr, 0xc100_0000);
		assert_eq!(
			vm.mmio().read(&vm, 0, 0xc100_0010, 4).unwrap(),
			(1 << 16) | 0x10
		);

		// Port BAR decodes through the I/O space.
		let mut eax = 0;
		vm.inout()
			.dispatch(&vm, 0, true, PCI_EMUL_IOBASE as u16 + 4, 4, &mut eax)
			.unwrap();
		assert_eq!(eax, 4);
	}

	#[test]
	fn command_register_controls_decoding() {
		let vm = vm();
		let pi = dummy(&vm, 6);
		let mem = pi.bar(1).addr;
		assert!(vm.mmio().is_claimed(mem));
		cfg_write(&vm, 6, PCIR_COMMAND, 2, PCIM_CMD_PORTEN as u32);
		assert!(!vm.mmio().is_claimed(mem));
		assert!(vm.inout().is_registered(PCI_EMUL_IOBASE as u16));
		cfg_write(&vm, 6, PCIR_COMMAND, 2, 0);
		assert!(!vm.inout().is_registered(PCI_EMUL_IOBASE as u16));
		cfg_write(
			&vm,
			6,
			PCIR_COMMAND,
			2,
			(PCIM_CMD_PORTEN | PCIM_CMD_MEMEN) as u32,
		);
		assert!(vm.mmio().is_claimed(mem));
	}

	#[test]
	fn reset_control_suspends_the_vm() {
		let vm = vm();
		vm.activate_cpu(0).unwrap();
		let mut eax = 0x2;
		vm.inout()
			.dispatch(&vm, 0, false, RESET_CONTROL_PORT, 1, &mut eax)
			.unwrap();
		assert_eq!(vm.suspend_state(), SuspendHow::None);
		let mut eax = 0x6;
		vm.inout()
			.dispatch(&vm, 0, false, RESET_CONTROL_PORT, 1, &mut eax)
			.unwrap();
		assert_eq!(vm.suspend_state(), SuspendHow::Reset);
	}

	#[test]
	fn capability_list_is_linked() {
		let pi = PciFunction::new("caps", 0, 0);
		let first = pi.add_capability(&[0x09, 0xff, 1, 2, 3]).unwrap();
		let second = pi.add_capability(&[0x0a, 0xff]).unwrap();
		assert_eq!(first, CAP_START_OFFSET);
		assert_eq!(second, CAP_START_OFFSET + 8);
		assert_eq!(pi.cfg8(PCIR_CAP_PTR), first);
		assert_eq!(pi.cfg8(first + 1), second);
		assert_eq!(pi.cfg8(second + 1), 0);
		assert_ne!(pi.cfg16(PCIR_STATUS) & PCIM_STATUS_CAPPRESENT, 0);
	}
}
