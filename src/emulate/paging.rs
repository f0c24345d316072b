//! Software walk of the guest's page tables.

use super::{GuestPaging, PagingMode, Prot};
use crate::{
	error::{Fault, Result},
	mem::GuestMemory,
};

const PG_V: u64 = 1 << 0;
const PG_RW: u64 = 1 << 1;
const PG_U: u64 = 1 << 2;
const PG_A: u64 = 1 << 5;
const PG_M: u64 = 1 << 6;
const PG_PS: u64 = 1 << 7;
const PG_NX: u64 = 1 << 63;

const PGEX_P: u32 = 1 << 0;
const PGEX_W: u32 = 1 << 1;
const PGEX_U: u32 = 1 << 2;
const PGEX_I: u32 = 1 << 4;

const PAE_FRAME: u64 = 0x000f_ffff_ffff_f000;

fn pf_error_code(usermode: bool, prot: Prot, pte: u64) -> u32 {
	let mut error = 0;
	if pte & PG_V != 0 {
		error |= PGEX_P;
	}
	match prot {
		Prot::Write => error |= PGEX_W,
		Prot::Exec => error |= PGEX_I,
		Prot::Read => {}
	}
	if usermode {
		error |= PGEX_U;
	}
	error
}

fn canonical(gla: u64) -> bool {
	let top = (gla as i64) >> 47;
	top == 0 || top == -1
}

/// Walks a page-table entry: checks presence and permissions, then sets the
/// accessed bit (and dirty on the last level of a write).
fn check_entry(
	mem: &GuestMemory,
	entry_gpa: u64,
	wide: bool,
	usermode: bool,
	prot: Prot,
	gla: u64,
	leaf: bool,
) -> Result<u64> {
	let pte = if wide {
		mem.read_u64(entry_gpa)?
	} else {
		mem.read_u32(entry_gpa)? as u64
	};
	let fault = || Fault::pf(pf_error_code(usermode, prot, pte), gla);
	if pte & PG_V == 0
		|| (usermode && pte & PG_U == 0)
		|| (prot == Prot::Write && pte & PG_RW == 0)
		|| (prot == Prot::Exec && wide && pte & PG_NX != 0)
	{
		return Err(fault().into());
	}

	let mut update = PG_A;
	if leaf && prot == Prot::Write {
		update |= PG_M;
	}
	if pte & update != update {
		let pte = pte | update;
		if wide {
			mem.write_u64(entry_gpa, pte)?;
		} else {
			mem.write_u32(entry_gpa, pte as u32)?;
		}
	}
	Ok(pte)
}

/// Translates a guest linear address. A translation failure is returned as
/// the `#PF` (or `#GP` for a non-canonical address) the guest should take.
pub fn gla2gpa(mem: &GuestMemory, paging: &GuestPaging, gla: u64, prot: Prot) -> Result<u64> {
	let usermode = paging.cpl == 3;
	match paging.paging_mode {
		PagingMode::Flat => Ok(gla),
		PagingMode::Bits32 => {
			let gla = gla & 0xffff_ffff;
			let pde_gpa = (paging.cr3 & 0xffff_f000) + ((gla >> 22) & 0x3ff) * 4;
			let pde = mem.read_u32(pde_gpa)? as u64;
			let large = pde & PG_PS != 0;
			let pde = check_entry(mem, pde_gpa, false, usermode, prot, gla, large)?;
			if large {
				return Ok((pde & 0xffc0_0000) | (gla & 0x003f_ffff));
			}
			let pte_gpa = (pde & 0xffff_f000) + ((gla >> 12) & 0x3ff) * 4;
			let pte = check_entry(mem, pte_gpa, false, usermode, prot, gla, true)?;
			Ok((pte & 0xffff_f000) | (gla & 0xfff))
		}
		PagingMode::Pae => {
			let gla = gla & 0xffff_ffff;
			let pdpte_gpa = (paging.cr3 & 0xffff_ffe0) + ((gla >> 30) & 0x3) * 8;
			let pdpte = mem.read_u64(pdpte_gpa)?;
			if pdpte & PG_V == 0 {
				return Err(Fault::pf(pf_error_code(usermode, prot, pdpte), gla).into());
			}
			walk_wide(mem, pdpte & PAE_FRAME, &[21, 12], usermode, prot, gla)
		}
		PagingMode::Long => {
			if !canonical(gla) {
				return Err(Fault::gp(0).into());
			}
			walk_wide(mem, paging.cr3 & PAE_FRAME, &[39, 30, 21, 12], usermode, prot, gla)
		}
	}
}

fn walk_wide(
	mem: &GuestMemory,
	mut table: u64,
	shifts: &[u32],
	usermode: bool,
	prot: Prot,
	gla: u64,
) -> Result<u64> {
	for (level, &shift) in shifts.iter().enumerate() {
		let entry_gpa = table + ((gla >> shift) & 0x1ff) * 8;
		let raw = mem.read_u64(entry_gpa)?;
		let last = level == shifts.len() - 1;
		// 1 GiB and 2 MiB pages end the walk early.
		let large = !last && (shift == 30 || shift == 21) && raw & PG_PS != 0;
		let pte = check_entry(mem, entry_gpa, true, usermode, prot, gla, last || large)?;
		if last || large {
			let page_mask = (1u64 << shift) - 1;
			return Ok((pte & PAE_FRAME & !page_mask) | (gla & page_mask));
		}
		table = pte & PAE_FRAME;
	}
	unreachable!("page walk always ends on the last level")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{consts::IDT_PF, emulate::CpuMode, mem::SegmentKind};

	fn memory() -> GuestMemory {
		let mem = GuestMemory::new();
		mem.add(0, 0x20_0000, SegmentKind::Ram).unwrap();
		mem
	}

	fn long_paging() -> GuestPaging {
		GuestPaging {
			cr3: 0x1000,
			cpl: 0,
			cpu_mode: CpuMode::Long,
			paging_mode: PagingMode::Long,
		}
	}

	#[test]
	fn four_level_walk_sets_accessed_and_dirty() {
		let mem = memory();
		mem.write_u64(0x1000, 0x2000 | PG_V | PG_RW).unwrap();
		mem.write_u64(0x2000, 0x3000 | PG_V | PG_RW).unwrap();
		mem.write_u64(0x3000, 0x4000 | PG_V | PG_RW).unwrap();
		mem.write_u64(0x4000 + 5 * 8, 0x9000 | PG_V | PG_RW).unwrap();

		let gpa = gla2gpa(&mem, &long_paging(), 0x5123, Prot::Write).unwrap();
		assert_eq!(gpa, 0x9123);
		assert_eq!(mem.read_u64(0x4000 + 5 * 8).unwrap() & (PG_A | PG_M), PG_A | PG_M);
		assert_eq!(mem.read_u64(0x1000).unwrap() & PG_M, 0);
	}

	#[test]
	fn two_megabyte_pages() {
		let mem = memory();
		mem.write_u64(0x1000, 0x2000 | PG_V).unwrap();
		mem.write_u64(0x2000, 0x3000 | PG_V).unwrap();
		mem.write_u64(0x3000 + 8, 0x40_0000 | PG_V | PG_PS).unwrap();
		let gpa = gla2gpa(&mem, &long_paging(), 0x20_1234, Prot::Read).unwrap();
		assert_eq!(gpa, 0x40_1234);
	}

	#[test]
	fn protection_faults() {
		let mem = memory();
		mem.write_u64(0x1000, 0x2000 | PG_V).unwrap();
		let err = gla2gpa(&mem, &long_paging(), 0x5000, Prot::Write).unwrap_err();
		match err {
			crate::VmmError::GuestFault(f) => {
				assert_eq!(f.vector, IDT_PF);
				assert_eq!(f.errcode, Some(PGEX_P | PGEX_W));
				assert_eq!(f.cr2, Some(0x5000));
			}
			other => panic!("unexpected {other}"),
		}
		let err = gla2gpa(&mem, &long_paging(), 0x8000_0000_0000, Prot::Read).unwrap_err();
		assert!(matches!(err, crate::VmmError::GuestFault(f) if f.vector == crate::consts::IDT_GP));
	}

	#[test]
	fn legacy_32bit_large_page() {
		let mem = memory();
		mem.write_u32(0x1000 + 4, (0x40_0000 | PG_V | PG_PS) as u32).unwrap();
		let paging = GuestPaging {
			cr3: 0x1000,
			cpl: 0,
			cpu_mode: CpuMode::Protected,
			paging_mode: PagingMode::Bits32,
		};
		assert_eq!(
			gla2gpa(&mem, &paging, 0x40_0abc, Prot::Read).unwrap(),
			0x40_0abc
		);
	}
}
