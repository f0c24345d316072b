//! Linux x86 boot protocol loader for bzImage kernels, entered directly in
//! 32-bit protected mode.

use std::path::Path;

use align_address::Align;
use zerocopy::{
	FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
	little_endian::{U16, U32, U64},
};

use super::{BootState, LoaderError, check_room, copy_in, read_file, write_flat_gdt};
use crate::{
	consts::{HIGHMEM_BASE, MIB, PAGE_SIZE},
	error::Result,
	vm::Vm,
	vmx::backend::Reg,
};

const GDT_ADDR: u64 = 0x2000;
pub const ZEROPAGE_ADDR: u64 = 0x3000;
pub const CMDLINE_ADDR: u64 = 0x4000;
const CMDLINE_LIMIT: u64 = 0x1_0000 - CMDLINE_ADDR;
const DEFAULT_KERNEL_ADDR: u64 = MIB;

const SETUP_HEADER_OFFSET: usize = 0x1f1;
const HDRS: u32 = u32::from_le_bytes(*b"HdrS");
const MIN_VERSION: u16 = 0x020a;
const LOADED_HIGH: u8 = 1 << 0;
const CAN_USE_HEAP: u8 = 1 << 7;
const LOADER_TYPE: u8 = 0x0d;

const E820_ENTRIES_OFFSET: u64 = 0x1e8;
const E820_TABLE_OFFSET: u64 = 0x2d0;
const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SetupHeader {
	pub setup_sects: u8,
	pub root_flags: U16,
	pub syssize: U32,
	pub ram_size: U16,
	pub vid_mode: U16,
	pub root_dev: U16,
	pub boot_flag: U16,
	pub jump: U16,
	pub header: U32,
	pub version: U16,
	pub realmode_swtch: U32,
	pub start_sys_seg: U16,
	pub kernel_version: U16,
	pub type_of_loader: u8,
	pub loadflags: u8,
	pub setup_move_size: U16,
	pub code32_start: U32,
	pub ramdisk_image: U32,
	pub ramdisk_size: U32,
	pub bootsect_kludge: U32,
	pub heap_end_ptr: U16,
	pub ext_loader_ver: u8,
	pub ext_loader_type: u8,
	pub cmd_line_ptr: U32,
	pub initrd_addr_max: U32,
	pub kernel_alignment: U32,
	pub relocatable_kernel: u8,
	pub min_alignment: u8,
	pub xloadflags: U16,
	pub cmdline_size: U32,
	pub hardware_subarch: U32,
	pub hardware_subarch_data: U64,
	pub payload_offset: U32,
	pub payload_length: U32,
	pub setup_data: U64,
	pub pref_address: U64,
	pub init_size: U32,
	pub handover_offset: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct E820Entry {
	pub addr: U64,
	pub size: U64,
	pub kind: U32,
}

impl E820Entry {
	fn new(addr: u64, size: u64, kind: u32) -> Self {
		Self {
			addr: addr.into(),
			size: size.into(),
			kind: kind.into(),
		}
	}
}

/// The BIOS memory map handed to the kernel.
pub fn e820_map(vm: &Vm) -> Vec<E820Entry> {
	let lowmem = vm.mem().lowmem_size();
	let highmem = vm.mem().highmem_size();
	let mut map = vec![
		E820Entry::new(0, 0x9_fc00, E820_RAM),
		E820Entry::new(0x9_fc00, MIB - 0x9_fc00, E820_RESERVED),
	];
	if lowmem > MIB {
		map.push(E820Entry::new(MIB, lowmem - MIB, E820_RAM));
	}
	if highmem > 0 {
		map.push(E820Entry::new(HIGHMEM_BASE, highmem, E820_RAM));
	}
	map
}

fn parse_header(image: &[u8]) -> std::result::Result<SetupHeader, LoaderError> {
	let hdr = image
		.get(SETUP_HEADER_OFFSET..)
		.and_then(|b| SetupHeader::read_from_prefix(b).ok())
		.map(|(hdr, _)| hdr)
		.ok_or(LoaderError::InvalidBzImage("truncated setup header"))?;
	if hdr.setup_sects < 1 {
		return Err(LoaderError::InvalidBzImage("no setup sectors"));
	}
	if hdr.header.get() != HDRS {
		return Err(LoaderError::InvalidBzImage("missing HdrS signature"));
	}
	if hdr.version.get() < MIN_VERSION {
		return Err(LoaderError::InvalidBzImage("boot protocol older than 2.10"));
	}
	if hdr.loadflags & LOADED_HIGH == 0 {
		return Err(LoaderError::InvalidBzImage("zImage kernels are not supported"));
	}
	Ok(hdr)
}

pub fn load(vm: &Vm, kernel: &Path, initrd: Option<&Path>, cmdline: &str) -> Result<BootState> {
	let image = read_file(kernel)?;
	let mut hdr = parse_header(&image)?;
	let setup_len = (hdr.setup_sects as usize + 1) * 512;
	let payload = image
		.get(setup_len..)
		.filter(|p| !p.is_empty())
		.ok_or(LoaderError::InvalidBzImage("no protected-mode kernel"))?;

	let align = (hdr.kernel_alignment.get() as u64).max(PAGE_SIZE as u64);
	let pref = hdr.pref_address.get();
	let kernel_addr = if hdr.relocatable_kernel != 0 || pref < DEFAULT_KERNEL_ADDR {
		DEFAULT_KERNEL_ADDR.align_up(align)
	} else {
		pref
	};
	let init_size = (hdr.init_size.get() as u64).max(payload.len() as u64);
	check_room(vm, "kernel", kernel_addr, init_size)?;
	copy_in(vm, "kernel", kernel_addr, payload)?;
	let kernel_end = kernel_addr + init_size;
	info!("bzImage protocol {:#x} at {kernel_addr:#x}", hdr.version.get());

	let cmdline_max = (hdr.cmdline_size.get() as u64).min(CMDLINE_LIMIT - 1);
	if cmdline.len() as u64 > cmdline_max {
		return Err(LoaderError::InvalidOption(format!(
			"command line exceeds {cmdline_max} bytes"
		))
		.into());
	}
	let mut cl = cmdline.as_bytes().to_vec();
	cl.push(0);
	copy_in(vm, "command line", CMDLINE_ADDR, &cl)?;

	if let Some(path) = initrd {
		let data = read_file(path)?;
		let top = (hdr.initrd_addr_max.get() as u64 + 1).min(vm.mem().lowmem_size());
		let addr = top
			.checked_sub(data.len() as u64)
			.map(|a| a.align_down(PAGE_SIZE as u64))
			.filter(|a| *a >= kernel_end)
			.ok_or(LoaderError::NoRoom {
				what: "initrd",
				gpa: kernel_end,
				len: data.len() as u64,
			})?;
		copy_in(vm, "initrd", addr, &data)?;
		debug!("initrd at {addr:#x}+{:#x}", data.len());
		hdr.ramdisk_image = (addr as u32).into();
		hdr.ramdisk_size = (data.len() as u32).into();
	}

	hdr.vid_mode = U16::new(0xffff);
	hdr.type_of_loader = LOADER_TYPE;
	hdr.loadflags |= CAN_USE_HEAP;
	hdr.heap_end_ptr = U16::new(0xfe00);
	hdr.code32_start = (kernel_addr as u32).into();
	hdr.cmd_line_ptr = (CMDLINE_ADDR as u32).into();

	vm.mem().fill(ZEROPAGE_ADDR, PAGE_SIZE, 0)?;
	vm.mem()
		.write(ZEROPAGE_ADDR + SETUP_HEADER_OFFSET as u64, hdr.as_bytes())?;
	let e820 = e820_map(vm);
	vm.mem()
		.write_u8(ZEROPAGE_ADDR + E820_ENTRIES_OFFSET, e820.len() as u8)?;
	vm.mem()
		.write(ZEROPAGE_ADDR + E820_TABLE_OFFSET, e820.as_bytes())?;

	let gdt = write_flat_gdt(vm, GDT_ADDR, 2, 3)?;
	let mut state = BootState::flat32(gdt, kernel_addr);
	state.regs.extend([
		(Reg::Rsi, ZEROPAGE_ADDR),
		(Reg::Rbp, 0),
		(Reg::Rdi, 0),
		(Reg::Rbx, 0),
	]);
	Ok(state)
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use tempfile::NamedTempFile;

	use super::*;
	use crate::pci::tests::vm;

	fn bzimage(version: u16, loadflags: u8) -> Vec<u8> {
		let mut image = vec![0u8; 5 * 512 + 0x3000];
		let hdr = &mut image[SETUP_HEADER_OFFSET..];
		let (hdr, _) = SetupHeader::mut_from_prefix(hdr).unwrap();
		hdr.setup_sects = 4;
		hdr.header = HDRS.into();
		hdr.version = version.into();
		hdr.loadflags = loadflags;
		hdr.relocatable_kernel = 1;
		hdr.kernel_alignment = U32::new(0x20_0000);
		hdr.initrd_addr_max = U32::new(0x7fff_ffff);
		hdr.cmdline_size = U32::new(2047);
		hdr.init_size = U32::new(0x8_0000);
		image[5 * 512] = 0xfc;
		image
	}

	fn temp(data: &[u8]) -> NamedTempFile {
		let mut f = NamedTempFile::new().unwrap();
		f.write_all(data).unwrap();
		f
	}

	#[test]
	fn setup_header_layout() {
		assert_eq!(size_of::<SetupHeader>(), 0x268 - SETUP_HEADER_OFFSET);
		assert_eq!(size_of::<E820Entry>(), 20);
	}

	#[test]
	fn header_checks() {
		assert!(parse_header(&bzimage(0x020f, LOADED_HIGH)).is_ok());
		assert!(matches!(
			parse_header(&bzimage(0x0209, LOADED_HIGH)),
			Err(LoaderError::InvalidBzImage(_))
		));
		assert!(matches!(
			parse_header(&bzimage(0x020f, 0)),
			Err(LoaderError::InvalidBzImage(_))
		));
		let mut image = bzimage(0x020f, LOADED_HIGH);
		image[0x202] = b'X';
		assert!(parse_header(&image).is_err());
		assert!(parse_header(&image[..0x200]).is_err());
	}

	#[test]
	fn boot_params() {
		let vm = vm();
		vm.setup_memory(256 * MIB).unwrap();
		let kernel = temp(&bzimage(0x020f, LOADED_HIGH));
		let initrd = temp(&[0x5a; 10_000]);
		let state = load(&vm, kernel.path(), Some(initrd.path()), "console=ttyS0").unwrap();

		// 1 MiB rounded up to the 2 MiB kernel alignment.
		assert_eq!(state.reg(Reg::Rip), Some(0x20_0000));
		assert_eq!(vm.mem().read_u8(0x20_0000).unwrap(), 0xfc);
		assert_eq!(state.reg(Reg::Rsi), Some(ZEROPAGE_ADDR));
		assert_eq!(state.segment(Reg::Cs).unwrap().0, 0x10);
		assert_eq!(state.segment(Reg::Ss).unwrap().0, 0x18);

		let hdr: SetupHeader = vm
			.mem()
			.read_obj(ZEROPAGE_ADDR + SETUP_HEADER_OFFSET as u64)
			.unwrap();
		assert_eq!(hdr.type_of_loader, 0x0d);
		assert_eq!(hdr.cmd_line_ptr.get() as u64, CMDLINE_ADDR);
		let ramdisk = hdr.ramdisk_image.get() as u64;
		assert_eq!(hdr.ramdisk_size.get(), 10_000);
		assert_eq!(ramdisk % PAGE_SIZE as u64, 0);
		assert!(ramdisk + 10_000 <= 256 * MIB && ramdisk + 10_000 > 256 * MIB - 0x4000);
		assert_eq!(vm.mem().read_u8(ramdisk).unwrap(), 0x5a);

		let mut cl = [0u8; 14];
		vm.mem().read(CMDLINE_ADDR, &mut cl).unwrap();
		assert_eq!(&cl, b"console=ttyS0\0");

		assert_eq!(vm.mem().read_u8(ZEROPAGE_ADDR + E820_ENTRIES_OFFSET).unwrap(), 3);
		let ram: E820Entry = vm
			.mem()
			.read_obj(ZEROPAGE_ADDR + E820_TABLE_OFFSET + 2 * 20)
			.unwrap();
		assert_eq!(ram, E820Entry::new(MIB, 255 * MIB, E820_RAM));
	}

	#[test]
	fn kernel_must_fit() {
		let vm = vm();
		vm.setup_memory(2 * MIB).unwrap();
		let kernel = temp(&bzimage(0x020f, LOADED_HIGH));
		let err = load(&vm, kernel.path(), None, "").unwrap_err();
		assert!(matches!(
			err,
			crate::error::VmmError::Loader(LoaderError::NoRoom { what: "kernel", .. })
		));
	}
}
