//! x86 instruction decoding for the memory-operand subset device drivers
//! use against MMIO.

use std::fmt;

use super::{CpuMode, GuestPaging, Prot, Seg, VieCpu, paging, size2mask};
use crate::{
	consts::{PAGE_SIZE, VIE_INST_SIZE},
	error::{Result, VmmError},
	mem::GuestMemory,
	vmx::backend::Reg,
};

/// Marker for an exit that carries no usable linear address.
pub const VIE_INVALID_GLA: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpType {
	#[default]
	None,
	TwoByte,
	Mov,
	Movsx,
	Movzx,
	And,
	Or,
	Sub,
	Cmp,
	Test,
	Movs,
	Stos,
	Group1,
	BitTest,
	Push,
	Pop,
	Clflush,
}

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct OpFlags: u8 {
		/// 16/32-bit immediate operand.
		const IMM = 1 << 0;
		const IMM8 = 1 << 1;
		/// Memory offset follows the opcode, no ModRM.
		const MOFFSET = 1 << 2;
		const NO_MODRM = 1 << 3;
		const NO_GLA_VERIFICATION = 1 << 4;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VieOp {
	pub byte: u8,
	pub kind: OpType,
	pub flags: OpFlags,
}

const fn op(byte: u8, kind: OpType, flags: OpFlags) -> VieOp {
	VieOp { byte, kind, flags }
}

fn one_byte_opcode(byte: u8) -> Option<VieOp> {
	let string = OpFlags::NO_MODRM.union(OpFlags::NO_GLA_VERIFICATION);
	Some(match byte {
		0x0f => op(byte, OpType::TwoByte, OpFlags::empty()),
		0x0b => op(byte, OpType::Or, OpFlags::empty()),
		0x23 => op(byte, OpType::And, OpFlags::empty()),
		0x2b => op(byte, OpType::Sub, OpFlags::empty()),
		0x39 | 0x3b => op(byte, OpType::Cmp, OpFlags::empty()),
		0x88..=0x8b => op(byte, OpType::Mov, OpFlags::empty()),
		0xa1 | 0xa3 => op(byte, OpType::Mov, OpFlags::MOFFSET.union(OpFlags::NO_MODRM)),
		0xa4 | 0xa5 => op(byte, OpType::Movs, string),
		0xaa | 0xab => op(byte, OpType::Stos, string),
		0xc6 => op(byte, OpType::Mov, OpFlags::IMM8),
		0xc7 => op(byte, OpType::Mov, OpFlags::IMM),
		0x80 | 0x83 => op(byte, OpType::Group1, OpFlags::IMM8),
		0x81 => op(byte, OpType::Group1, OpFlags::IMM),
		0x8f => op(byte, OpType::Pop, OpFlags::empty()),
		0xf6 => op(byte, OpType::Test, OpFlags::IMM8),
		0xf7 => op(byte, OpType::Test, OpFlags::IMM),
		0xff => op(byte, OpType::Push, OpFlags::empty()),
		_ => return None,
	})
}

fn two_byte_opcode(byte: u8) -> Option<VieOp> {
	Some(match byte {
		0xae => op(byte, OpType::Clflush, OpFlags::NO_GLA_VERIFICATION),
		0xb6 | 0xb7 => op(byte, OpType::Movzx, OpFlags::empty()),
		0xba => op(byte, OpType::BitTest, OpFlags::IMM8),
		0xbe => op(byte, OpType::Movsx, OpFlags::empty()),
		_ => return None,
	})
}

const MOD_INDIRECT: u8 = 0;
const MOD_INDIRECT_DISP8: u8 = 1;
const MOD_INDIRECT_DISP32: u8 = 2;
const MOD_DIRECT: u8 = 3;

const RM_SIB: u8 = 4;
const RM_DISP32: u8 = 5;

/// A decoded instruction.
#[derive(Clone, Default)]
pub struct Vie {
	pub inst: [u8; VIE_INST_SIZE],
	pub num_valid: u8,
	pub num_processed: u8,

	pub addrsize: u8,
	pub opsize: u8,
	pub rex_present: bool,
	pub rex_w: bool,
	pub rex_r: bool,
	pub rex_x: bool,
	pub rex_b: bool,
	pub repz_present: bool,
	pub repnz_present: bool,
	pub opsize_override: bool,
	pub addrsize_override: bool,
	pub segment_override: Option<Seg>,

	pub modrm_mod: u8,
	pub reg: u8,
	pub rm: u8,
	pub scale: u8,
	pub base_register: Option<Reg>,
	/// Second base register of the 16-bit `[bx+si]` style forms.
	pub base2_register: Option<Reg>,
	pub index_register: Option<Reg>,
	pub displacement: i64,
	pub immediate: i64,

	pub op: VieOp,
	pub decoded: bool,
}

impl fmt::Debug for Vie {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Vie")
			.field("bytes", &&self.inst[..self.num_valid as usize])
			.field("op", &self.op)
			.field("opsize", &self.opsize)
			.field("addrsize", &self.addrsize)
			.field("reg", &self.reg)
			.field("displacement", &self.displacement)
			.field("immediate", &self.immediate)
			.finish()
	}
}

impl Vie {
	pub fn new(bytes: &[u8]) -> Self {
		let mut vie = Vie::default();
		let len = bytes.len().min(VIE_INST_SIZE);
		vie.inst[..len].copy_from_slice(&bytes[..len]);
		vie.num_valid = len as u8;
		vie
	}

	pub fn bytes(&self) -> &[u8] {
		&self.inst[..self.num_valid as usize]
	}

	fn peek(&self) -> Result<u8> {
		if self.num_processed < self.num_valid {
			Ok(self.inst[self.num_processed as usize])
		} else {
			Err(VmmError::Emulation(format!(
				"instruction truncated after {} byte(s)",
				self.num_valid
			)))
		}
	}

	fn advance(&mut self) {
		self.num_processed += 1;
	}

	fn next_byte(&mut self) -> Result<u8> {
		let byte = self.peek()?;
		self.advance();
		Ok(byte)
	}

	fn unsupported(&self, what: &str) -> VmmError {
		VmmError::Emulation(format!("{what} in {:02x?}", self.bytes()))
	}

	fn decode_prefixes(&mut self, cpu_mode: CpuMode, cs_d: bool) -> Result<()> {
		loop {
			let byte = self.peek()?;
			match byte {
				0x66 => self.opsize_override = true,
				0x67 => self.addrsize_override = true,
				0xf3 => self.repz_present = true,
				0xf2 => self.repnz_present = true,
				0x2e => self.segment_override = Some(Seg::Cs),
				0x36 => self.segment_override = Some(Seg::Ss),
				0x3e => self.segment_override = Some(Seg::Ds),
				0x26 => self.segment_override = Some(Seg::Es),
				0x64 => self.segment_override = Some(Seg::Fs),
				0x65 => self.segment_override = Some(Seg::Gs),
				_ => break,
			}
			self.advance();
		}

		// REX is only a prefix in 64-bit mode and must come last.
		if cpu_mode == CpuMode::Long {
			let byte = self.peek()?;
			if byte & 0xf0 == 0x40 {
				self.rex_present = true;
				self.rex_w = byte & 0x8 != 0;
				self.rex_r = byte & 0x4 != 0;
				self.rex_x = byte & 0x2 != 0;
				self.rex_b = byte & 0x1 != 0;
				self.advance();
			}
		}

		if cpu_mode == CpuMode::Long {
			self.addrsize = if self.addrsize_override { 4 } else { 8 };
			self.opsize = if self.rex_w {
				8
			} else if self.opsize_override {
				2
			} else {
				4
			};
		} else if cs_d {
			self.addrsize = if self.addrsize_override { 2 } else { 4 };
			self.opsize = if self.opsize_override { 2 } else { 4 };
		} else {
			self.addrsize = if self.addrsize_override { 4 } else { 2 };
			self.opsize = if self.opsize_override { 4 } else { 2 };
		}
		Ok(())
	}

	fn decode_opcode(&mut self) -> Result<()> {
		let byte = self.next_byte()?;
		self.op = one_byte_opcode(byte).ok_or_else(|| self.unsupported("unknown opcode"))?;
		if self.op.kind == OpType::TwoByte {
			let byte = self.next_byte()?;
			self.op =
				two_byte_opcode(byte).ok_or_else(|| self.unsupported("unknown two-byte opcode"))?;
		}
		Ok(())
	}

	fn decode_modrm(&mut self, cpu_mode: CpuMode) -> Result<()> {
		if self.op.flags.contains(OpFlags::NO_MODRM) {
			return Ok(());
		}
		if cpu_mode == CpuMode::Real {
			return Err(self.unsupported("ModRM decoding in real mode"));
		}

		let byte = self.next_byte()?;
		self.modrm_mod = (byte >> 6) & 0x3;
		self.reg = (byte >> 3) & 0x7;
		self.rm = byte & 0x7;
		if self.modrm_mod == MOD_DIRECT {
			return Err(self.unsupported("register operand"));
		}
		self.reg |= (self.rex_r as u8) << 3;

		if self.addrsize == 2 {
			return self.decode_modrm16();
		}

		if self.rm == RM_SIB {
			// The SIB byte decides base and index.
			return Ok(());
		}
		self.rm |= (self.rex_b as u8) << 3;
		if self.modrm_mod == MOD_INDIRECT && self.rm & 0x7 == RM_DISP32 {
			self.base_register = (cpu_mode == CpuMode::Long).then_some(Reg::Rip);
			self.displacement = 4;
		} else {
			self.base_register = Some(Reg::gpr(self.rm as usize));
			self.displacement = match self.modrm_mod {
				MOD_INDIRECT_DISP8 => 1,
				MOD_INDIRECT_DISP32 => 4,
				_ => 0,
			};
		}
		Ok(())
	}

	/// 16-bit addressing: fixed base/index pairs, 8 or 16 bit displacement.
	fn decode_modrm16(&mut self) -> Result<()> {
		let (base, base2) = match self.rm {
			0 => (Some(Reg::Rbx), Some(Reg::Rsi)),
			1 => (Some(Reg::Rbx), Some(Reg::Rdi)),
			2 => (Some(Reg::Rbp), Some(Reg::Rsi)),
			3 => (Some(Reg::Rbp), Some(Reg::Rdi)),
			4 => (Some(Reg::Rsi), None),
			5 => (Some(Reg::Rdi), None),
			6 if self.modrm_mod == MOD_INDIRECT => (None, None),
			6 => (Some(Reg::Rbp), None),
			_ => (Some(Reg::Rbx), None),
		};
		self.base_register = base;
		self.base2_register = base2;
		self.displacement = match self.modrm_mod {
			MOD_INDIRECT if self.rm == 6 => 2,
			MOD_INDIRECT_DISP8 => 1,
			MOD_INDIRECT_DISP32 => 2,
			_ => 0,
		};
		Ok(())
	}

	fn decode_sib(&mut self) -> Result<()> {
		if self.op.flags.contains(OpFlags::NO_MODRM)
			|| self.addrsize == 2
			|| self.modrm_mod == MOD_DIRECT
			|| self.rm != RM_SIB
		{
			return Ok(());
		}
		let byte = self.next_byte()?;
		let ss = (byte >> 6) & 0x3;
		let index = ((byte >> 3) & 0x7) | ((self.rex_x as u8) << 3);
		let base = (byte & 0x7) | ((self.rex_b as u8) << 3);

		self.displacement = match self.modrm_mod {
			MOD_INDIRECT_DISP8 => 1,
			MOD_INDIRECT_DISP32 => 4,
			_ => 0,
		};
		if self.modrm_mod == MOD_INDIRECT && base & 0x7 == RM_DISP32 {
			self.displacement = 4;
		} else {
			self.base_register = Some(Reg::gpr(base as usize));
		}
		// An index of %rsp means no index.
		if index != 4 {
			self.index_register = Some(Reg::gpr(index as usize));
		}
		self.scale = 1 << ss;
		Ok(())
	}

	/// Reads `n` little-endian bytes, sign extended.
	fn read_signed(&mut self, n: u8) -> Result<i64> {
		let mut raw = 0u64;
		for i in 0..n {
			raw |= (self.next_byte()? as u64) << (8 * i);
		}
		let shift = 64 - 8 * n as u32;
		Ok(((raw << shift) as i64) >> shift)
	}

	fn decode_displacement(&mut self) -> Result<()> {
		// decode_modrm/decode_sib leave the displacement width here.
		let width = self.displacement as u8;
		self.displacement = 0;
		if width == 0 {
			return Ok(());
		}
		self.displacement = self.read_signed(width)?;
		Ok(())
	}

	fn decode_immediate(&mut self) -> Result<()> {
		let width = if self.op.flags.contains(OpFlags::IMM) {
			// 64-bit operands still take a sign-extended 32-bit immediate.
			if self.opsize == 2 { 2 } else { 4 }
		} else if self.op.flags.contains(OpFlags::IMM8) {
			1
		} else {
			return Ok(());
		};
		self.immediate = self.read_signed(width)?;
		Ok(())
	}

	fn decode_moffset(&mut self) -> Result<()> {
		if !self.op.flags.contains(OpFlags::MOFFSET) {
			return Ok(());
		}
		let mut raw = 0u64;
		for i in 0..self.addrsize {
			raw |= (self.next_byte()? as u64) << (8 * i);
		}
		self.displacement = raw as i64;
		Ok(())
	}

	/// Recomputes the effective linear address and checks it against the one
	/// the hardware reported.
	fn verify_gla(&self, cpu: &dyn VieCpu, cpu_mode: CpuMode, gla: u64) -> Result<()> {
		if gla == VIE_INVALID_GLA || self.op.flags.contains(OpFlags::NO_GLA_VERIFICATION) {
			return Ok(());
		}
		let mut base = 0u64;
		if let Some(reg) = self.base_register {
			base = cpu.reg(reg)?;
			if reg == Reg::Rip {
				base = base.wrapping_add(self.num_processed as u64);
			}
		}
		if let Some(reg) = self.base2_register {
			base = base.wrapping_add(cpu.reg(reg)?);
		}
		let mut idx = 0u64;
		if let Some(reg) = self.index_register {
			idx = cpu.reg(reg)?;
		}
		let mut ea = base
			.wrapping_add(idx.wrapping_mul(self.scale as u64))
			.wrapping_add(self.displacement as u64);
		ea &= size2mask(self.addrsize);

		let seg = self.segment_override.unwrap_or(match self.base_register {
			Some(Reg::Rsp) | Some(Reg::Rbp) => Seg::Ss,
			_ => Seg::Ds,
		});
		if cpu_mode != CpuMode::Long || matches!(seg, Seg::Fs | Seg::Gs) {
			ea = ea.wrapping_add(cpu.seg_desc(seg)?.base);
			if cpu_mode != CpuMode::Long {
				ea &= 0xffff_ffff;
			}
		}

		if ea != gla {
			return Err(VmmError::Emulation(format!(
				"gla mismatch: computed {ea:#x}, hardware reported {gla:#x}"
			)));
		}
		Ok(())
	}
}

/// Decodes the bytes already fetched into `vie`.
///
/// `gla` is the faulting linear address, or [`VIE_INVALID_GLA`] if the exit
/// did not provide one.
pub fn decode_instruction(
	vie: &mut Vie,
	cpu: &dyn VieCpu,
	gla: u64,
	cpu_mode: CpuMode,
	cs_d: bool,
) -> Result<()> {
	vie.num_processed = 0;
	vie.decode_prefixes(cpu_mode, cs_d)?;
	vie.decode_opcode()?;
	vie.decode_modrm(cpu_mode)?;
	vie.decode_sib()?;
	vie.decode_displacement()?;
	vie.decode_immediate()?;
	vie.decode_moffset()?;
	vie.verify_gla(cpu, cpu_mode, gla)?;
	vie.decoded = true;
	trace!("decoded {vie:?}");
	Ok(())
}

/// Copies up to `len` instruction bytes starting at linear `rip`.
pub fn fetch_instruction(
	mem: &GuestMemory,
	paging: &GuestPaging,
	rip: u64,
	len: usize,
) -> Result<Vie> {
	let len = len.min(VIE_INST_SIZE);
	let mut buf = [0u8; VIE_INST_SIZE];
	let mut done = 0;
	while done < len {
		let gla = rip.wrapping_add(done as u64);
		let gpa = paging::gla2gpa(mem, paging, gla, Prot::Exec)?;
		let in_page = PAGE_SIZE - (gpa as usize & (PAGE_SIZE - 1));
		let n = in_page.min(len - done);
		mem.read(gpa, &mut buf[done..done + n])?;
		done += n;
	}
	Ok(Vie::new(&buf[..len]))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::emulate::SegDesc;

	struct Zero;

	impl VieCpu for Zero {
		fn reg(&self, _: Reg) -> Result<u64> {
			Ok(0)
		}
		fn set_reg(&mut self, _: Reg, _: u64) -> Result<()> {
			Ok(())
		}
		fn seg_desc(&self, _: Seg) -> Result<SegDesc> {
			Ok(SegDesc::default())
		}
	}

	fn decode64(bytes: &[u8]) -> Vie {
		let mut vie = Vie::new(bytes);
		decode_instruction(&mut vie, &Zero, VIE_INVALID_GLA, CpuMode::Long, false).unwrap();
		vie
	}

	#[test]
	fn mov_store_with_disp32() {
		// mov %eax, 0xfee000b0(%rbx)
		let vie = decode64(&[0x89, 0x83, 0xb0, 0x00, 0xe0, 0xfe]);
		assert_eq!(vie.op.kind, OpType::Mov);
		assert_eq!(vie.opsize, 4);
		assert_eq!(vie.reg, 0);
		assert_eq!(vie.base_register, Some(Reg::Rbx));
		assert_eq!(vie.displacement, 0xfee000b0u32 as i32 as i64);
		assert_eq!(vie.num_processed, 6);
	}

	#[test]
	fn rex_and_sib() {
		// mov 0x10(%r8,%rcx,4), %r9
		let vie = decode64(&[0x4d, 0x8b, 0x4c, 0x88, 0x10]);
		assert_eq!(vie.opsize, 8);
		assert_eq!(vie.reg, 9);
		assert_eq!(vie.base_register, Some(Reg::R8));
		assert_eq!(vie.index_register, Some(Reg::Rcx));
		assert_eq!(vie.scale, 4);
		assert_eq!(vie.displacement, 0x10);
	}

	#[test]
	fn group1_imm8_is_sign_extended() {
		// andl $-16, (%rdi)
		let vie = decode64(&[0x83, 0x27, 0xf0]);
		assert_eq!(vie.op.kind, OpType::Group1);
		assert_eq!(vie.reg, 4);
		assert_eq!(vie.immediate, -16);
	}

	#[test]
	fn moffset_and_string_ops() {
		let vie = decode64(&[0x48, 0xa1, 1, 2, 3, 4, 5, 6, 7, 8]);
		assert_eq!(vie.displacement, 0x0807_0605_0403_0201);
		let vie = decode64(&[0xf3, 0xab]);
		assert!(vie.repz_present);
		assert_eq!(vie.op.kind, OpType::Stos);
	}

	#[test]
	fn gla_is_verified() {
		let mut vie = Vie::new(&[0x8b, 0x03]);
		assert!(decode_instruction(&mut vie, &Zero, 0x1000, CpuMode::Long, false).is_err());
		let mut vie = Vie::new(&[0x8b, 0x03]);
		decode_instruction(&mut vie, &Zero, 0, CpuMode::Long, false).unwrap();
	}

	#[test]
	fn rejects_unknown_and_truncated() {
		let mut vie = Vie::new(&[0x90]);
		assert!(decode_instruction(&mut vie, &Zero, VIE_INVALID_GLA, CpuMode::Long, false).is_err());
		let mut vie = Vie::new(&[0xc7, 0x00, 0x01]);
		assert!(decode_instruction(&mut vie, &Zero, VIE_INVALID_GLA, CpuMode::Long, false).is_err());
	}

	#[test]
	fn sixteen_bit_forms() {
		let mut vie = Vie::new(&[0x8b, 0x00]);
		decode_instruction(&mut vie, &Zero, VIE_INVALID_GLA, CpuMode::Protected, false).unwrap();
		assert_eq!(vie.opsize, 2);
		assert_eq!(vie.base_register, Some(Reg::Rbx));
		assert_eq!(vie.base2_register, Some(Reg::Rsi));
	}
}
