//! Instruction emulation for trapped memory accesses.
//!
//! When the guest touches an emulated device through memory, the exit only
//! says *where*. The emulator fetches and decodes the faulting instruction
//! ([`decode`]), then replays it against the device ([`exec`]) with guest
//! linear addresses translated through the guest's own page tables
//! ([`paging`]).

pub mod decode;
pub mod exec;
pub mod paging;

pub use decode::{Vie, fetch_instruction};
pub use exec::{MmioBus, emulate_instruction};

use crate::{
	consts::*,
	error::{Fault, Result},
	vmx::backend::Reg,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuMode {
	#[default]
	Real,
	Protected,
	/// 32-bit code under a 64-bit kernel.
	Compatibility,
	Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
	#[default]
	Flat,
	Bits32,
	Pae,
	Long,
}

/// Snapshot of the translation-relevant guest state at exit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestPaging {
	pub cr3: u64,
	pub cpl: u8,
	pub cpu_mode: CpuMode,
	pub paging_mode: PagingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Seg {
	Es,
	Cs,
	Ss,
	Ds,
	Fs,
	Gs,
}

impl Seg {
	/// Segment override prefix or instruction-info encoding order.
	pub fn from_index(index: u64) -> Option<Seg> {
		Some(match index {
			0 => Seg::Es,
			1 => Seg::Cs,
			2 => Seg::Ss,
			3 => Seg::Ds,
			4 => Seg::Fs,
			5 => Seg::Gs,
			_ => return None,
		})
	}

	pub fn reg(self) -> Reg {
		match self {
			Seg::Es => Reg::Es,
			Seg::Cs => Reg::Cs,
			Seg::Ss => Reg::Ss,
			Seg::Ds => Reg::Ds,
			Seg::Fs => Reg::Fs,
			Seg::Gs => Reg::Gs,
		}
	}
}

/// Segment descriptor in VMCS access-rights form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegDesc {
	pub base: u64,
	pub limit: u32,
	pub access: u32,
}

impl SegDesc {
	pub const UNUSABLE: SegDesc = SegDesc {
		base: 0,
		limit: 0,
		access: 0x10000,
	};

	pub fn unusable(&self) -> bool {
		self.access & 0x10000 != 0
	}

	pub fn present(&self) -> bool {
		self.access & 0x80 != 0
	}

	pub fn kind(&self) -> u32 {
		self.access & 0x1f
	}

	pub fn dpl(&self) -> u8 {
		((self.access >> 5) & 3) as u8
	}

	/// D/B flag: default operand size 32.
	pub fn db(&self) -> bool {
		self.access & 0x4000 != 0
	}

	pub fn long(&self) -> bool {
		self.access & 0x2000 != 0
	}

	pub fn granularity(&self) -> bool {
		self.access & 0x8000 != 0
	}

	fn is_code(&self) -> bool {
		self.access & 0x18 == 0x18
	}

	fn is_data(&self) -> bool {
		self.access & 0x18 == 0x10
	}

	fn writable_data(&self) -> bool {
		self.is_data() && self.access & 0x2 != 0
	}

	fn readable(&self) -> bool {
		self.is_data() || self.access & 0x2 != 0
	}

	fn expand_down(&self) -> bool {
		self.is_data() && self.access & 0x4 != 0
	}
}

/// Access type used for translation and segment checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prot {
	Read,
	Write,
	Exec,
}

/// Register access needed to replay an instruction.
pub trait VieCpu {
	fn reg(&self, reg: Reg) -> Result<u64>;
	fn set_reg(&mut self, reg: Reg, value: u64) -> Result<()>;
	fn seg_desc(&self, seg: Seg) -> Result<SegDesc>;
}

/// Mask for an operand of `size` bytes.
pub fn size2mask(size: u8) -> u64 {
	match size {
		1 => 0xff,
		2 => 0xffff,
		4 => 0xffff_ffff,
		_ => u64::MAX,
	}
}

/// Writes `val` into `reg` the way a `size`-byte register write would:
/// 8 and 16 bit writes preserve the rest, 32 bit writes zero-extend.
pub fn update_register(cpu: &mut dyn VieCpu, reg: Reg, val: u64, size: u8) -> Result<()> {
	let val = match size {
		1 | 2 => {
			let orig = cpu.reg(reg)?;
			(orig & !size2mask(size)) | (val & size2mask(size))
		}
		4 => val & 0xffff_ffff,
		_ => val,
	};
	cpu.set_reg(reg, val)
}

fn canonical(gla: u64) -> bool {
	let top = (gla as i64) >> 47;
	top == 0 || top == -1
}

/// Segment + offset to linear address, including the architectural limit,
/// type, canonical and alignment checks. Violations come back as the
/// `#GP`/`#SS` the hardware would raise.
pub fn calculate_gla(
	cpu_mode: CpuMode,
	seg: Seg,
	desc: &SegDesc,
	offset: u64,
	length: u8,
	addrsize: u8,
	prot: Prot,
) -> Result<u64> {
	let fault = || {
		if seg == Seg::Ss {
			Fault::ss(0)
		} else {
			Fault::gp(0)
		}
	};
	let length = length as u64;
	if cpu_mode == CpuMode::Long {
		let base = match seg {
			Seg::Fs | Seg::Gs => desc.base,
			_ => 0,
		};
		let gla = base.wrapping_add(offset);
		let last = gla.wrapping_add(length - 1);
		if !canonical(gla) || !canonical(last) {
			return Err(fault().into());
		}
		return Ok(gla);
	}

	if cpu_mode == CpuMode::Protected || cpu_mode == CpuMode::Compatibility {
		if desc.unusable() || !desc.present() {
			return Err(fault().into());
		}
		match prot {
			Prot::Write if !desc.writable_data() => return Err(fault().into()),
			Prot::Read if !desc.readable() => return Err(fault().into()),
			_ => {}
		}
		let (low, high) = if desc.expand_down() {
			let high = if desc.db() { 0xffff_ffff } else { 0xffff };
			(desc.limit as u64 + 1, high)
		} else {
			(0, desc.limit as u64)
		};
		let mut off = offset & size2mask(addrsize);
		for _ in 0..length {
			if off < low || off > high {
				return Err(fault().into());
			}
			off = (off + 1) & size2mask(addrsize);
		}
	}

	let mask = size2mask(addrsize);
	Ok((desc.base.wrapping_add(offset & mask)) & 0xffff_ffff)
}

/// Whether a data access at `gla` of `size` bytes must raise `#AC`.
pub fn alignment_check(cpl: u8, size: u8, cr0: u64, rflags: u64, gla: u64) -> bool {
	if cpl != 3 || cr0 & CR0_AM == 0 || rflags & PSL_AC == 0 {
		return false;
	}
	gla & (size as u64 - 1) != 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn flat_data() -> SegDesc {
		SegDesc {
			base: 0,
			limit: 0xffff_ffff,
			access: 0xc093,
		}
	}

	#[test]
	fn long_mode_ignores_base_except_fs_gs() {
		let desc = SegDesc {
			base: 0x1000,
			..flat_data()
		};
		let gla = calculate_gla(CpuMode::Long, Seg::Ds, &desc, 0x20, 4, 8, Prot::Read).unwrap();
		assert_eq!(gla, 0x20);
		let gla = calculate_gla(CpuMode::Long, Seg::Fs, &desc, 0x20, 4, 8, Prot::Read).unwrap();
		assert_eq!(gla, 0x1020);
		let err = calculate_gla(
			CpuMode::Long,
			Seg::Ss,
			&desc,
			0x0000_8000_0000_0000,
			8,
			8,
			Prot::Read,
		)
		.unwrap_err();
		assert!(matches!(err, crate::VmmError::GuestFault(f) if f.vector == IDT_SS));
	}

	#[test]
	fn protected_mode_limits() {
		let desc = SegDesc {
			base: 0x10000,
			limit: 0xfff,
			access: 0x4093,
		};
		assert_eq!(
			calculate_gla(CpuMode::Protected, Seg::Es, &desc, 0xffc, 4, 4, Prot::Write).unwrap(),
			0x10ffc
		);
		assert!(calculate_gla(CpuMode::Protected, Seg::Es, &desc, 0xffd, 4, 4, Prot::Write).is_err());

		let ro = SegDesc {
			access: 0x4091,
			..desc
		};
		assert!(calculate_gla(CpuMode::Protected, Seg::Es, &ro, 0, 1, 4, Prot::Write).is_err());
	}

	#[test]
	fn partial_register_updates() {
		struct Regs(u64);
		impl VieCpu for Regs {
			fn reg(&self, _: Reg) -> Result<u64> {
				Ok(self.0)
			}
			fn set_reg(&mut self, _: Reg, value: u64) -> Result<()> {
				self.0 = value;
				Ok(())
			}
			fn seg_desc(&self, _: Seg) -> Result<SegDesc> {
				Ok(SegDesc::default())
			}
		}
		let mut regs = Regs(0x1122_3344_5566_7788);
		update_register(&mut regs, Reg::Rax, 0xaa, 1).unwrap();
		assert_eq!(regs.0, 0x1122_3344_5566_77aa);
		update_register(&mut regs, Reg::Rax, 0xdead_beef, 4).unwrap();
		assert_eq!(regs.0, 0xdead_beef);
	}
}
