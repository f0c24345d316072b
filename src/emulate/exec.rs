//! Replays a decoded instruction against an MMIO handler.

use super::{
	GuestPaging, Prot, Seg, VieCpu, alignment_check, calculate_gla,
	decode::{OpType, Vie},
	paging, size2mask, update_register,
};
use crate::{
	consts::*,
	error::{Fault, Result, VmmError},
	mem::GuestMemory,
	vmx::backend::Reg,
};

/// Device side of an emulated access.
pub trait MmioBus {
	fn mmio_read(&mut self, gpa: u64, size: u8) -> Result<u64>;
	fn mmio_write(&mut self, gpa: u64, size: u8, value: u64) -> Result<()>;
}

/// What the caller does with the guest's instruction pointer afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
	/// Advance past the instruction.
	Done,
	/// Run the same instruction again (a `rep` prefix with iterations left).
	Repeat,
}

const RFLAGS_STATUS_BITS: u64 = PSL_C | PSL_PF | PSL_AF | PSL_Z | PSL_N | PSL_V;

fn parity_even(value: u64) -> bool {
	(value as u8).count_ones() % 2 == 0
}

fn sign_bit(size: u8) -> u64 {
	1 << (size as u32 * 8 - 1)
}

fn result_flags(result: u64, size: u8) -> u64 {
	let result = result & size2mask(size);
	let mut flags = 0;
	if parity_even(result) {
		flags |= PSL_PF;
	}
	if result == 0 {
		flags |= PSL_Z;
	}
	if result & sign_bit(size) != 0 {
		flags |= PSL_N;
	}
	flags
}

/// Status flags of `x - y` at operand width `size`.
pub fn sub_flags(x: u64, y: u64, size: u8) -> u64 {
	let mask = size2mask(size);
	let (x, y) = (x & mask, y & mask);
	let result = x.wrapping_sub(y) & mask;
	let mut flags = result_flags(result, size);
	if x < y {
		flags |= PSL_C;
	}
	if (x ^ y ^ result) & 0x10 != 0 {
		flags |= PSL_AF;
	}
	if (x ^ y) & (x ^ result) & sign_bit(size) != 0 {
		flags |= PSL_V;
	}
	flags
}

/// Status flags of a logical operation: CF and OF clear.
pub fn logic_flags(result: u64, size: u8) -> u64 {
	result_flags(result, size)
}

fn set_status_flags(cpu: &mut dyn VieCpu, flags: u64) -> Result<()> {
	let rflags = cpu.reg(Reg::Rflags)?;
	cpu.set_reg(Reg::Rflags, (rflags & !RFLAGS_STATUS_BITS) | flags)
}

/// Reads the byte register `reg` the legacy way: without REX, 4..7 name
/// the high bytes of the first four registers.
fn read_byte_reg(cpu: &dyn VieCpu, vie: &Vie) -> Result<u64> {
	let (reg, shift) = byte_reg(vie);
	Ok((cpu.reg(reg)? >> shift) & 0xff)
}

fn write_byte_reg(cpu: &mut dyn VieCpu, vie: &Vie, value: u64) -> Result<()> {
	let (reg, shift) = byte_reg(vie);
	let orig = cpu.reg(reg)?;
	let mask = 0xffu64 << shift;
	cpu.set_reg(reg, (orig & !mask) | ((value & 0xff) << shift))
}

fn byte_reg(vie: &Vie) -> (Reg, u32) {
	if !vie.rex_present && (4..8).contains(&vie.reg) {
		(Reg::gpr(vie.reg as usize - 4), 8)
	} else {
		(Reg::gpr(vie.reg as usize), 0)
	}
}

fn sign_extend(value: u64, size: u8) -> u64 {
	let shift = 64 - size as u32 * 8;
	(((value << shift) as i64) >> shift) as u64
}

struct Ctx<'a> {
	cpu: &'a mut dyn VieCpu,
	mem: &'a GuestMemory,
	gpa: u64,
	vie: &'a Vie,
	paging: &'a GuestPaging,
	bus: &'a mut dyn MmioBus,
}

impl Ctx<'_> {
	fn read(&mut self, size: u8) -> Result<u64> {
		let value = self.bus.mmio_read(self.gpa, size)?;
		Ok(value & size2mask(size))
	}

	fn write(&mut self, size: u8, value: u64) -> Result<()> {
		self.bus.mmio_write(self.gpa, size, value & size2mask(size))
	}

	fn reg(&self) -> Reg {
		Reg::gpr(self.vie.reg as usize)
	}

	fn mov(&mut self) -> Result<Completion> {
		let size = self.vie.opsize;
		match self.vie.op.byte {
			0x88 => {
				let value = read_byte_reg(self.cpu, self.vie)?;
				self.write(1, value)?;
			}
			0x89 => {
				let value = self.cpu.reg(self.reg())?;
				self.write(size, value)?;
			}
			0x8a => {
				let value = self.read(1)?;
				write_byte_reg(self.cpu, self.vie, value)?;
			}
			0x8b => {
				let value = self.read(size)?;
				let reg = self.reg();
				update_register(self.cpu, reg, value, size)?;
			}
			0xa1 => {
				let value = self.read(size)?;
				update_register(self.cpu, Reg::Rax, value, size)?;
			}
			0xa3 => {
				let value = self.cpu.reg(Reg::Rax)?;
				self.write(size, value)?;
			}
			0xc6 => self.write(1, self.vie.immediate as u64)?,
			0xc7 => self.write(size, self.vie.immediate as u64)?,
			byte => return Err(VmmError::Emulation(format!("mov opcode {byte:#x}"))),
		}
		Ok(Completion::Done)
	}

	fn movx(&mut self) -> Result<Completion> {
		let src_size = match self.vie.op.byte {
			0xb6 | 0xbe => 1,
			_ => 2,
		};
		let mut value = self.read(src_size)?;
		if self.vie.op.kind == OpType::Movsx {
			value = sign_extend(value, src_size);
		}
		let reg = self.reg();
		update_register(self.cpu, reg, value, self.vie.opsize)?;
		Ok(Completion::Done)
	}

	/// Register-source arithmetic: `reg = reg op mem` or a compare.
	fn alu_reg(&mut self) -> Result<Completion> {
		let size = self.vie.opsize;
		let mem = self.read(size)?;
		let reg = self.cpu.reg(self.reg())? & size2mask(size);
		let (result, flags) = match (self.vie.op.kind, self.vie.op.byte) {
			(OpType::Or, _) => (Some(reg | mem), logic_flags(reg | mem, size)),
			(OpType::And, _) => (Some(reg & mem), logic_flags(reg & mem, size)),
			(OpType::Sub, _) => (Some(reg.wrapping_sub(mem)), sub_flags(reg, mem, size)),
			// cmp r/m, reg
			(OpType::Cmp, 0x39) => (None, sub_flags(mem, reg, size)),
			// cmp reg, r/m
			_ => (None, sub_flags(reg, mem, size)),
		};
		if let Some(result) = result {
			let reg = self.reg();
			update_register(self.cpu, reg, result, size)?;
		}
		set_status_flags(self.cpu, flags)?;
		Ok(Completion::Done)
	}

	/// `op r/m, imm`: OR, AND and CMP of the 0x80/0x81/0x83 group.
	fn group1(&mut self) -> Result<Completion> {
		let size = if self.vie.op.byte == 0x80 {
			1
		} else {
			self.vie.opsize
		};
		let imm = self.vie.immediate as u64 & size2mask(size);
		let mem = self.read(size)?;
		let (result, flags) = match self.vie.reg & 7 {
			1 => (Some(mem | imm), logic_flags(mem | imm, size)),
			4 => (Some(mem & imm), logic_flags(mem & imm, size)),
			7 => (None, sub_flags(mem, imm, size)),
			other => {
				return Err(VmmError::Emulation(format!(
					"group 1 operation /{other} is not emulated"
				)));
			}
		};
		if let Some(result) = result {
			self.write(size, result)?;
		}
		set_status_flags(self.cpu, flags)?;
		Ok(Completion::Done)
	}

	fn test(&mut self) -> Result<Completion> {
		if self.vie.reg & 7 != 0 {
			return Err(VmmError::Emulation(format!(
				"group 3 operation /{} is not emulated",
				self.vie.reg & 7
			)));
		}
		let size = if self.vie.op.byte == 0xf6 {
			1
		} else {
			self.vie.opsize
		};
		let mem = self.read(size)?;
		let result = mem & self.vie.immediate as u64;
		set_status_flags(self.cpu, logic_flags(result, size))?;
		Ok(Completion::Done)
	}

	/// BT/BTS/BTR/BTC with an immediate bit offset.
	fn bittest(&mut self) -> Result<Completion> {
		let size = self.vie.opsize;
		let bit = (self.vie.immediate as u64) & (size as u64 * 8 - 1);
		let mask = 1u64 << bit;
		let mem = self.read(size)?;
		let updated = match self.vie.reg & 7 {
			4 => None,
			5 => Some(mem | mask),
			6 => Some(mem & !mask),
			7 => Some(mem ^ mask),
			other => {
				return Err(VmmError::Emulation(format!(
					"bit test operation /{other} is not emulated"
				)));
			}
		};
		if let Some(updated) = updated {
			self.write(size, updated)?;
		}
		let rflags = self.cpu.reg(Reg::Rflags)?;
		let rflags = if mem & mask != 0 {
			rflags | PSL_C
		} else {
			rflags & !PSL_C
		};
		self.cpu.set_reg(Reg::Rflags, rflags)?;
		Ok(Completion::Done)
	}

	fn rep_count(&self) -> Result<Option<u64>> {
		if self.vie.repz_present || self.vie.repnz_present {
			Ok(Some(self.cpu.reg(Reg::Rcx)? & size2mask(self.vie.addrsize)))
		} else {
			Ok(None)
		}
	}

	fn string_step(&self, size: u8) -> Result<u64> {
		let rflags = self.cpu.reg(Reg::Rflags)?;
		let step = size as u64;
		Ok(if rflags & PSL_D != 0 {
			step.wrapping_neg()
		} else {
			step
		})
	}

	fn string_size(&self) -> u8 {
		if self.vie.op.byte & 1 == 0 {
			1
		} else {
			self.vie.opsize
		}
	}

	fn advance_index(&mut self, reg: Reg, step: u64) -> Result<()> {
		let value = self.cpu.reg(reg)?.wrapping_add(step);
		update_register(self.cpu, reg, value, self.vie.addrsize)
	}

	/// Ends one iteration of a string instruction.
	fn finish_rep(&mut self, count: Option<u64>) -> Result<Completion> {
		let Some(count) = count else {
			return Ok(Completion::Done);
		};
		let left = count - 1;
		update_register(self.cpu, Reg::Rcx, left, self.vie.addrsize)?;
		Ok(if left > 0 {
			Completion::Repeat
		} else {
			Completion::Done
		})
	}

	/// Linear-to-physical translation of a string operand.
	fn string_operand(&mut self, seg: Seg, index: Reg, size: u8, prot: Prot) -> Result<u64> {
		let desc = self.cpu.seg_desc(seg)?;
		let offset = self.cpu.reg(index)?;
		let gla = calculate_gla(
			self.paging.cpu_mode,
			seg,
			&desc,
			offset,
			size,
			self.vie.addrsize,
			prot,
		)?;
		let cr0 = self.cpu.reg(Reg::Cr0)?;
		let rflags = self.cpu.reg(Reg::Rflags)?;
		if alignment_check(self.paging.cpl, size, cr0, rflags, gla) {
			return Err(Fault::new(IDT_AC, Some(0)).into());
		}
		paging::gla2gpa(self.mem, self.paging, gla, prot)
	}

	fn load(&mut self, gpa: u64, size: u8) -> Result<u64> {
		if self.mem.is_ram(gpa) {
			let mut buf = [0u8; 8];
			self.mem.read(gpa, &mut buf[..size as usize])?;
			Ok(u64::from_le_bytes(buf))
		} else {
			Ok(self.bus.mmio_read(gpa, size)? & size2mask(size))
		}
	}

	fn store(&mut self, gpa: u64, size: u8, value: u64) -> Result<()> {
		if self.mem.is_ram(gpa) {
			self.mem.write(gpa, &value.to_le_bytes()[..size as usize])
		} else {
			self.bus.mmio_write(gpa, size, value & size2mask(size))
		}
	}

	fn movs(&mut self) -> Result<Completion> {
		let count = self.rep_count()?;
		if count == Some(0) {
			return Ok(Completion::Done);
		}
		let size = self.string_size();
		let src_seg = self.vie.segment_override.unwrap_or(Seg::Ds);
		let src = self.string_operand(src_seg, Reg::Rsi, size, Prot::Read)?;
		let dst = self.string_operand(Seg::Es, Reg::Rdi, size, Prot::Write)?;
		let value = self.load(src, size)?;
		self.store(dst, size, value)?;

		let step = self.string_step(size)?;
		self.advance_index(Reg::Rsi, step)?;
		self.advance_index(Reg::Rdi, step)?;
		self.finish_rep(count)
	}

	fn stos(&mut self) -> Result<Completion> {
		let count = self.rep_count()?;
		if count == Some(0) {
			return Ok(Completion::Done);
		}
		let size = self.string_size();
		let value = self.cpu.reg(Reg::Rax)?;
		self.write(size, value)?;

		let step = self.string_step(size)?;
		self.advance_index(Reg::Rdi, step)?;
		self.finish_rep(count)
	}

	fn stack_size(&self) -> u8 {
		if self.paging.cpu_mode == super::CpuMode::Long {
			if self.vie.opsize_override { 2 } else { 8 }
		} else {
			self.vie.opsize
		}
	}

	fn stack_addrsize(&self) -> Result<u8> {
		Ok(match self.paging.cpu_mode {
			super::CpuMode::Long => 8,
			_ if self.cpu.seg_desc(Seg::Ss)?.db() => 4,
			_ => 2,
		})
	}

	/// `push r/m` with a device operand, `pop r/m` into one.
	fn push_pop(&mut self) -> Result<Completion> {
		let push = self.vie.op.kind == OpType::Push;
		let group = self.vie.reg & 7;
		if (push && group != 6) || (!push && group != 0) {
			return Err(VmmError::Emulation(format!(
				"opcode {:#x} /{group} is not emulated",
				self.vie.op.byte
			)));
		}
		let size = self.stack_size();
		let stack_addrsize = self.stack_addrsize()?;
		let rsp = self.cpu.reg(Reg::Rsp)?;
		let (offset, prot) = if push {
			(rsp.wrapping_sub(size as u64), Prot::Write)
		} else {
			(rsp, Prot::Read)
		};

		let desc = self.cpu.seg_desc(Seg::Ss)?;
		let gla = calculate_gla(
			self.paging.cpu_mode,
			Seg::Ss,
			&desc,
			offset,
			size,
			stack_addrsize,
			prot,
		)?;
		let stack = paging::gla2gpa(self.mem, self.paging, gla, prot)?;
		if push {
			let value = self.read(size)?;
			self.store(stack, size, value)?;
			update_register(self.cpu, Reg::Rsp, offset, stack_addrsize)?;
		} else {
			let value = self.load(stack, size)?;
			self.write(size, value)?;
			update_register(
				self.cpu,
				Reg::Rsp,
				rsp.wrapping_add(size as u64),
				stack_addrsize,
			)?;
		}
		Ok(Completion::Done)
	}
}

/// Executes `vie` for an access that faulted at `gpa`.
pub fn emulate_instruction(
	cpu: &mut dyn VieCpu,
	mem: &GuestMemory,
	gpa: u64,
	vie: &Vie,
	paging: &GuestPaging,
	bus: &mut dyn MmioBus,
) -> Result<Completion> {
	if !vie.decoded {
		return Err(VmmError::Emulation("instruction not decoded".into()));
	}
	let mut ctx = Ctx {
		cpu,
		mem,
		gpa,
		vie,
		paging,
		bus,
	};
	match vie.op.kind {
		OpType::Mov => ctx.mov(),
		OpType::Movzx | OpType::Movsx => ctx.movx(),
		OpType::Or | OpType::And | OpType::Sub | OpType::Cmp => ctx.alu_reg(),
		OpType::Group1 => ctx.group1(),
		OpType::Test => ctx.test(),
		OpType::BitTest => ctx.bittest(),
		OpType::Movs => ctx.movs(),
		OpType::Stos => ctx.stos(),
		OpType::Push | OpType::Pop => ctx.push_pop(),
		// Cache maintenance has no effect on emulated devices.
		OpType::Clflush => Ok(Completion::Done),
		OpType::None | OpType::TwoByte => Err(VmmError::Emulation(format!(
			"cannot execute {:02x?}",
			vie.bytes()
		))),
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::emulate::{
		CpuMode, PagingMode, SegDesc,
		decode::{VIE_INVALID_GLA, decode_instruction},
	};
	use crate::mem::SegmentKind;

	#[derive(Default)]
	struct Regs(HashMap<Reg, u64>);

	impl VieCpu for Regs {
		fn reg(&self, reg: Reg) -> Result<u64> {
			Ok(self.0.get(&reg).copied().unwrap_or(0))
		}
		fn set_reg(&mut self, reg: Reg, value: u64) -> Result<()> {
			self.0.insert(reg, value);
			Ok(())
		}
		fn seg_desc(&self, _: Seg) -> Result<SegDesc> {
			Ok(SegDesc {
				base: 0,
				limit: 0xffff_ffff,
				access: 0xa093,
			})
		}
	}

	#[derive(Default)]
	struct Device {
		regs: HashMap<u64, u64>,
		writes: Vec<(u64, u8, u64)>,
	}

	impl MmioBus for Device {
		fn mmio_read(&mut self, gpa: u64, _size: u8) -> Result<u64> {
			Ok(self.regs.get(&gpa).copied().unwrap_or(0))
		}
		fn mmio_write(&mut self, gpa: u64, size: u8, value: u64) -> Result<()> {
			self.regs.insert(gpa, value);
			self.writes.push((gpa, size, value));
			Ok(())
		}
	}

	const FLAT64: GuestPaging = GuestPaging {
		cr3: 0,
		cpl: 0,
		cpu_mode: CpuMode::Long,
		paging_mode: PagingMode::Flat,
	};

	fn run(bytes: &[u8], regs: &mut Regs, dev: &mut Device, gpa: u64) -> Completion {
		let mem = GuestMemory::new();
		mem.add(0, 0x10000, SegmentKind::Ram).unwrap();
		run_with(bytes, regs, dev, gpa, &mem)
	}

	fn run_with(
		bytes: &[u8],
		regs: &mut Regs,
		dev: &mut Device,
		gpa: u64,
		mem: &GuestMemory,
	) -> Completion {
		let mut vie = Vie::new(bytes);
		decode_instruction(&mut vie, regs, VIE_INVALID_GLA, CpuMode::Long, false).unwrap();
		emulate_instruction(regs, mem, gpa, &vie, &FLAT64, dev).unwrap()
	}

	#[test]
	fn mov_to_and_from_device() {
		let mut regs = Regs::default();
		let mut dev = Device::default();
		regs.0.insert(Reg::Rax, 0x1234_5678_9abc_def0);
		// mov %eax, (%rbx)
		run(&[0x89, 0x03], &mut regs, &mut dev, 0xfee0_00b0);
		assert_eq!(dev.writes, vec![(0xfee0_00b0, 4, 0x9abc_def0)]);

		dev.regs.insert(0xfee0_0020, 0xffff_ffff_0100_0000);
		// mov (%rbx), %ecx zero-extends
		regs.0.insert(Reg::Rcx, u64::MAX);
		run(&[0x8b, 0x0b], &mut regs, &mut dev, 0xfee0_0020);
		assert_eq!(regs.0[&Reg::Rcx], 0x0100_0000);
	}

	#[test]
	fn high_byte_registers() {
		let mut regs = Regs::default();
		let mut dev = Device::default();
		regs.0.insert(Reg::Rax, 0xab00);
		// mov %ah, (%rbx)
		run(&[0x88, 0x23], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(dev.writes[0].2, 0xab);
	}

	#[test]
	fn movzx_movsx() {
		let mut regs = Regs::default();
		let mut dev = Device::default();
		dev.regs.insert(0x8000_0000, 0x80);
		run(&[0x0f, 0xb6, 0x03], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(regs.0[&Reg::Rax], 0x80);
		run(&[0x48, 0x0f, 0xbe, 0x03], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(regs.0[&Reg::Rax], 0xffff_ffff_ffff_ff80);
	}

	#[test]
	fn cmp_and_test_set_flags() {
		let mut regs = Regs::default();
		let mut dev = Device::default();
		regs.0.insert(Reg::Rflags, PSL_RESERVED_ONE);
		dev.regs.insert(0x8000_0000, 5);
		// cmpl $5, (%rbx)
		run(&[0x83, 0x3b, 0x05], &mut regs, &mut dev, 0x8000_0000);
		assert_ne!(regs.0[&Reg::Rflags] & PSL_Z, 0);
		assert!(dev.writes.is_empty());
		// cmpl $6, (%rbx) borrows
		run(&[0x83, 0x3b, 0x06], &mut regs, &mut dev, 0x8000_0000);
		let flags = regs.0[&Reg::Rflags];
		assert_ne!(flags & PSL_C, 0);
		assert_ne!(flags & PSL_N, 0);
		assert_eq!(flags & PSL_Z, 0);
		// testl $4, (%rbx)
		run(&[0xf7, 0x03, 4, 0, 0, 0], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(regs.0[&Reg::Rflags] & (PSL_Z | PSL_C), 0);
	}

	#[test]
	fn read_modify_write_ops() {
		let mut regs = Regs::default();
		let mut dev = Device::default();
		dev.regs.insert(0x8000_0000, 0xf0);
		// orl $0x0f, (%rbx)
		run(&[0x83, 0x0b, 0x0f], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(dev.regs[&0x8000_0000], 0xff);
		// andl $0x3c, (%rbx)
		run(&[0x83, 0x23, 0x3c], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(dev.regs[&0x8000_0000], 0x3c);
		// btsl $0, (%rbx)
		run(&[0x0f, 0xba, 0x2b, 0x00], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(dev.regs[&0x8000_0000], 0x3d);
		assert_eq!(regs.0[&Reg::Rflags] & PSL_C, 0);
		// sub (%rbx), %ecx
		regs.0.insert(Reg::Rcx, 0x40);
		run(&[0x2b, 0x0b], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(regs.0[&Reg::Rcx], 3);
	}

	#[test]
	fn rep_stos_repeats_until_rcx_is_zero() {
		let mut regs = Regs::default();
		let mut dev = Device::default();
		regs.0.insert(Reg::Rcx, 2);
		regs.0.insert(Reg::Rdi, 0x8000_0000);
		regs.0.insert(Reg::Rax, 7);
		let first = run(&[0xf3, 0xab], &mut regs, &mut dev, 0x8000_0000);
		assert_eq!(first, Completion::Repeat);
		let second = run(&[0xf3, 0xab], &mut regs, &mut dev, 0x8000_0004);
		assert_eq!(second, Completion::Done);
		assert_eq!(regs.0[&Reg::Rcx], 0);
		assert_eq!(regs.0[&Reg::Rdi], 0x8000_0008);
		assert_eq!(dev.writes.len(), 2);
	}

	#[test]
	fn movs_from_ram_to_device() {
		let mem = GuestMemory::new();
		mem.add(0, 0x10000, SegmentKind::Ram).unwrap();
		mem.write_u32(0x100, 0xcafe_f00d).unwrap();
		let mut regs = Regs::default();
		let mut dev = Device::default();
		regs.0.insert(Reg::Rsi, 0x100);
		regs.0.insert(Reg::Rdi, 0x8000_0000);
		run_with(&[0xa5], &mut regs, &mut dev, 0x8000_0000, &mem);
		assert_eq!(dev.writes, vec![(0x8000_0000, 4, 0xcafe_f00d)]);
		assert_eq!(regs.0[&Reg::Rsi], 0x104);
	}

	#[test]
	fn push_device_operand() {
		let mem = GuestMemory::new();
		mem.add(0, 0x10000, SegmentKind::Ram).unwrap();
		let mut regs = Regs::default();
		let mut dev = Device::default();
		dev.regs.insert(0x8000_0000, 0x1122_3344_5566_7788);
		regs.0.insert(Reg::Rsp, 0x2000);
		// pushq (%rbx)
		run_with(&[0xff, 0x33], &mut regs, &mut dev, 0x8000_0000, &mem);
		assert_eq!(regs.0[&Reg::Rsp], 0x1ff8);
		assert_eq!(mem.read_u64(0x1ff8).unwrap(), 0x1122_3344_5566_7788);
	}

	#[test]
	fn flag_helpers() {
		assert_eq!(sub_flags(0x80, 1, 1) & PSL_V, PSL_V);
		assert_eq!(sub_flags(1, 1, 4) & (PSL_Z | PSL_PF), PSL_Z | PSL_PF);
		assert_eq!(logic_flags(0x8000_0000, 4) & PSL_N, PSL_N);
	}
}
