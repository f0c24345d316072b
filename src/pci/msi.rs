//! MSI and MSI-X capabilities. The MSI-X table lives in a memory BAR that
//! the bus intercepts before the device sees the access.

use zerocopy::{Immutable, IntoBytes, KnownLayout};

use super::{BarType, FuncState, PciError, PciFunction};
use crate::{
	consts::PAGE_SIZE,
	devices::lapic,
	emulate::size2mask,
	error::{Result, VmmError},
	vm::Vm,
};

pub const PCIY_MSI: u8 = 0x05;
pub const PCIY_MSIX: u8 = 0x11;

const PCIM_MSICTRL_MSI_ENABLE: u16 = 0x0001;
const PCIM_MSICTRL_MME_MASK: u16 = 0x0070;
const PCIM_MSICTRL_64BIT: u16 = 0x0080;

const PCIM_MSIXCTRL_MSIX_ENABLE: u16 = 0x8000;
const PCIM_MSIXCTRL_FUNCTION_MASK: u16 = 0x4000;

pub const MSIX_TABLE_ENTRY_SIZE: u64 = 16;
const MAX_MSIX_TABLE_ENTRIES: u16 = 2048;
const PCIM_MSIX_VCTRL_MASK: u32 = 0x1;

const fn pba_size(count: u16) -> u64 {
	(count as u64).div_ceil(64) * 8
}

/// 64-bit MSI capability without per-vector masking.
#[repr(C)]
#[derive(Debug, Default, IntoBytes, Immutable, KnownLayout)]
struct MsiCap {
	capid: u8,
	nextptr: u8,
	msgctrl: u16,
	addrlo: u32,
	addrhi: u32,
	msgdata: u16,
	_pad: u16,
}

#[repr(C)]
#[derive(Debug, Default, IntoBytes, Immutable, KnownLayout)]
struct MsixCap {
	capid: u8,
	nextptr: u8,
	msgctrl: u16,
	/// BAR index in the low 3 bits, offset above.
	table_info: u32,
	pba_info: u32,
}

#[derive(Debug, Default)]
pub struct MsiState {
	pub enabled: bool,
	pub addr: u64,
	pub msg_data: u16,
	/// Vectors the guest enabled, 0 while disabled.
	pub maxmsgnum: u16,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MsixEntry {
	pub addr: u64,
	pub msg_data: u32,
	pub vector_control: u32,
}

#[derive(Debug, Default)]
pub struct MsixState {
	pub enabled: bool,
	pub function_mask: bool,
	pub table_bar: Option<usize>,
	pub pba_bar: Option<usize>,
	pub table_offset: u64,
	pub pba_offset: u64,
	pub pba_size: u64,
	pub table: Vec<MsixEntry>,
}

impl MsixState {
	fn table_index(&self, bar: usize, offset: u64) -> Option<(usize, u64)> {
		if self.table_bar != Some(bar) || offset < self.table_offset {
			return None;
		}
		let rel = offset - self.table_offset;
		let index = (rel / MSIX_TABLE_ENTRY_SIZE) as usize;
		(index < self.table.len()).then_some((index, rel % MSIX_TABLE_ENTRY_SIZE))
	}

	fn in_pba(&self, bar: usize, offset: u64) -> bool {
		self.pba_bar == Some(bar)
			&& offset >= self.pba_offset
			&& offset < self.pba_offset + self.pba_size
	}
}

/// MSI control writes may only touch the enable bit and the number of
/// enabled messages.
pub(super) fn msicap_write(st: &mut FuncState, capoff: u8, offset: u8, bytes: u8, val: u32) {
	let mut val = val;
	if offset == capoff + 2 && bytes == 2 {
		let rwmask = PCIM_MSICTRL_MME_MASK | PCIM_MSICTRL_MSI_ENABLE;
		let msgctrl = st.cfg.read16(offset);
		val = ((msgctrl & !rwmask) | (val as u16 & rwmask)) as u32;
	}
	st.cfg.write(offset, bytes, val);

	let msgctrl = st.cfg.read16(capoff + 2);
	let addrlo = st.cfg.read32(capoff + 4) as u64;
	let (addrhi, msgdata) = if msgctrl & PCIM_MSICTRL_64BIT != 0 {
		(st.cfg.read32(capoff + 8) as u64, st.cfg.read16(capoff + 12))
	} else {
		(0, st.cfg.read16(capoff + 8))
	};
	let msi = &mut st.msi;
	msi.enabled = msgctrl & PCIM_MSICTRL_MSI_ENABLE != 0;
	if msi.enabled {
		msi.addr = addrlo | (addrhi << 32);
		msi.msg_data = msgdata;
		msi.maxmsgnum = 1 << ((msgctrl & PCIM_MSICTRL_MME_MASK) >> 4);
	} else {
		msi.maxmsgnum = 0;
	}
}

pub(super) fn msixcap_write(st: &mut FuncState, capoff: u8, offset: u8, bytes: u8, val: u32) {
	let mut val = val;
	if offset == capoff + 2 && bytes == 2 {
		let rwmask = PCIM_MSIXCTRL_MSIX_ENABLE | PCIM_MSIXCTRL_FUNCTION_MASK;
		let msgctrl = (st.cfg.read16(offset) & !rwmask) | (val as u16 & rwmask);
		st.msix.enabled = msgctrl & PCIM_MSIXCTRL_MSIX_ENABLE != 0;
		st.msix.function_mask = msgctrl & PCIM_MSIXCTRL_FUNCTION_MASK != 0;
		val = msgctrl as u32;
	}
	st.cfg.write(offset, bytes, val);
}

/// Table reads accept aligned 4 and 8 byte accesses. The PBA reads as
/// zero since masked vectors are dropped instead of latched.
pub(super) fn msix_bar_read(st: &FuncState, bar: usize, offset: u64, size: u8) -> Option<u64> {
	if st.msix.in_pba(bar, offset) {
		return Some(0);
	}
	let (index, field) = st.msix.table_index(bar, offset)?;
	if (size != 4 && size != 8) || field % size as u64 != 0 {
		return Some(size2mask(size));
	}
	let entry = &st.msix.table[index];
	let value = match (field, size) {
		(0, 4) => entry.addr & 0xffff_ffff,
		(0, 8) => entry.addr,
		(4, _) => entry.addr >> 32,
		(8, 4) => entry.msg_data as u64,
		(8, 8) => entry.msg_data as u64 | ((entry.vector_control as u64) << 32),
		_ => entry.vector_control as u64,
	};
	Some(value)
}

pub(super) fn msix_bar_write(
	st: &mut FuncState,
	bar: usize,
	offset: u64,
	size: u8,
	value: u64,
) -> bool {
	if st.msix.in_pba(bar, offset) {
		return true;
	}
	let Some((index, field)) = st.msix.table_index(bar, offset) else {
		return false;
	};
	if (size != 4 && size != 8) || field % size as u64 != 0 {
		return true;
	}
	let entry = &mut st.msix.table[index];
	match (field, size) {
		(0, 4) => entry.addr = (entry.addr & !0xffff_ffff) | (value & 0xffff_ffff),
		(0, 8) => entry.addr = value,
		(4, _) => entry.addr = (entry.addr & 0xffff_ffff) | (value << 32),
		(8, 4) => entry.msg_data = value as u32,
		(8, 8) => {
			entry.msg_data = value as u32;
			entry.vector_control = (value >> 32) as u32;
		}
		_ => entry.vector_control = value as u32,
	}
	true
}

impl PciFunction {
	/// Adds a 64-bit MSI capability offering `msgnum` vectors.
	pub fn add_msicap(&self, msgnum: u16) -> Result<()> {
		if msgnum == 0 || msgnum > 32 || !msgnum.is_power_of_two() {
			return Err(PciError::InvalidConfig(format!("{msgnum} MSI vectors")).into());
		}
		let mmc = msgnum.trailing_zeros() as u16;
		let cap = MsiCap {
			capid: PCIY_MSI,
			msgctrl: PCIM_MSICTRL_64BIT | (mmc << 1),
			..Default::default()
		};
		self.add_capability(cap.as_bytes())?;
		Ok(())
	}

	/// Adds an MSI-X capability with `msgnum` masked entries. Table and
	/// PBA share the memory BAR `barnum`.
	pub fn add_msixcap(&self, vm: &Vm, msgnum: u16, barnum: usize) -> Result<()> {
		if msgnum == 0 || msgnum > MAX_MSIX_TABLE_ENTRIES {
			return Err(PciError::InvalidConfig(format!("{msgnum} MSI-X vectors")).into());
		}
		let table_size =
			(msgnum as u64 * MSIX_TABLE_ENTRY_SIZE).next_multiple_of(PAGE_SIZE as u64);
		{
			let mut st = self.state();
			let msix = &mut st.msix;
			msix.table_bar = Some(barnum);
			msix.pba_bar = Some(barnum);
			msix.table_offset = 0;
			msix.pba_offset = table_size;
			msix.pba_size = pba_size(msgnum);
			msix.table = vec![
				MsixEntry {
					vector_control: PCIM_MSIX_VCTRL_MASK,
					..Default::default()
				};
				msgnum as usize
			];
		}
		self.alloc_bar(vm, barnum, BarType::Mem32, table_size + pba_size(msgnum))?;

		let cap = MsixCap {
			capid: PCIY_MSIX,
			msgctrl: msgnum - 1,
			table_info: barnum as u32,
			pba_info: table_size as u32 | barnum as u32,
			..Default::default()
		};
		self.add_capability(cap.as_bytes())?;
		Ok(())
	}

	pub fn msi_enabled(&self) -> bool {
		self.state().msi.enabled
	}

	pub fn msi_maxmsgnum(&self) -> u16 {
		self.state().msi.maxmsgnum
	}

	/// MSI wins when a confused guest enables both.
	pub fn msix_enabled(&self) -> bool {
		let st = self.state();
		st.msix.enabled && !st.msi.enabled
	}

	pub fn generate_msi(&self, vm: &Vm, index: u16) -> Result<()> {
		let (addr, data) = {
			let st = self.state();
			if !st.msi.enabled || index >= st.msi.maxmsgnum {
				return Ok(());
			}
			(st.msi.addr, st.msi.msg_data | index)
		};
		lapic::intr_msi(vm, addr, data as u64)
	}

	/// Masked vectors and a masked function drop the message.
	pub fn generate_msix(&self, vm: &Vm, index: usize) -> Result<()> {
		let (addr, data) = {
			let st = self.state();
			if !st.msix.enabled || st.msix.function_mask {
				return Ok(());
			}
			let entry = st.msix.table.get(index).ok_or_else(|| {
				VmmError::InvalidArgument(format!("{}: MSI-X vector {index}", self.name()))
			})?;
			if entry.vector_control & PCIM_MSIX_VCTRL_MASK != 0 {
				return Ok(());
			}
			(entry.addr, entry.msg_data)
		};
		lapic::intr_msi(vm, addr, data as u64)
	}
}
