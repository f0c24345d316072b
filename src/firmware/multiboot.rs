//! Multiboot (version 1) loader.

use std::path::{Path, PathBuf};

use align_address::Align;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{BootState, LoaderError, copy_in, read_file, write_flat_gdt};
use crate::{
	consts::{KIB, MIB, PAGE_SIZE},
	error::Result,
	vm::Vm,
	vmx::backend::Reg,
};

pub const HEADER_MAGIC: u32 = 0x1bad_b002;
pub const BOOTLOADER_MAGIC: u32 = 0x2bad_b002;
const SEARCH_LIMIT: usize = 8192;

/// Header flags.
const PAGE_ALIGN: u32 = 1 << 0;
const MEMORY_INFO: u32 = 1 << 1;
const AOUT_KLUDGE: u32 = 1 << 16;

/// Info flags.
pub const INFO_MEMORY: u32 = 1 << 0;
pub const INFO_CMDLINE: u32 = 1 << 2;
pub const INFO_MODS: u32 = 1 << 3;

const GDT_ADDR: u64 = 0x1000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Header {
	magic: u32,
	flags: u32,
	checksum: u32,
	header_addr: u32,
	load_addr: u32,
	load_end_addr: u32,
	bss_end_addr: u32,
	entry_addr: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Info {
	pub flags: u32,
	pub mem_lower: u32,
	pub mem_upper: u32,
	pub boot_device: u32,
	pub cmdline: u32,
	pub mods_count: u32,
	pub mods_addr: u32,
	pub syms: [u32; 4],
	pub mmap_length: u32,
	pub mmap_addr: u32,
	pub drives_length: u32,
	pub drives_addr: u32,
	pub config_table: u32,
	pub boot_loader_name: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Module {
	pub mod_start: u32,
	pub mod_end: u32,
	pub string: u32,
	pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct Elf32Header {
	ident: [u8; 16],
	kind: u16,
	machine: u16,
	version: u32,
	entry: u32,
	phoff: u32,
	shoff: u32,
	flags: u32,
	ehsize: u16,
	phentsize: u16,
	phnum: u16,
	shentsize: u16,
	shnum: u16,
	shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct Elf32Phdr {
	kind: u32,
	offset: u32,
	vaddr: u32,
	paddr: u32,
	filesz: u32,
	memsz: u32,
	flags: u32,
	align: u32,
}

const ELFMAG: [u8; 4] = *b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// Finds the header: 4-byte aligned within the first 8 KiB, with a valid
/// checksum. Returns it together with its file offset.
fn find_header(image: &[u8]) -> Option<(usize, Header)> {
	let limit = image.len().min(SEARCH_LIMIT);
	(0..limit.saturating_sub(11)).step_by(4).find_map(|off| {
		let mut header = Header::default();
		let avail = (image.len() - off).min(size_of::<Header>());
		header.as_mut_bytes()[..avail].copy_from_slice(&image[off..off + avail]);
		let sum = header
			.magic
			.wrapping_add(header.flags)
			.wrapping_add(header.checksum);
		(header.magic == HEADER_MAGIC && sum == 0).then_some((off, header))
	})
}

/// Where the kernel landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Loaded {
	entry: u64,
	end: u64,
}

fn load_aout(vm: &Vm, image: &[u8], off: usize, h: &Header) -> Result<Loaded> {
	if h.header_addr < h.load_addr || (h.header_addr - h.load_addr) as usize > off {
		return Err(LoaderError::InvalidOption("multiboot load address after header".into()).into());
	}
	let file_start = off - (h.header_addr - h.load_addr) as usize;
	let file_end = if h.load_end_addr == 0 {
		image.len()
	} else {
		file_start + h.load_end_addr.saturating_sub(h.load_addr) as usize
	};
	let data = image
		.get(file_start..file_end)
		.ok_or(LoaderError::InvalidOption("multiboot load range beyond the file".into()))?;
	let load_end = h.load_addr as u64 + data.len() as u64;
	copy_in(vm, "kernel", h.load_addr as u64, data)?;
	let mut end = load_end;
	if h.bss_end_addr as u64 > load_end {
		let bss = h.bss_end_addr as u64 - load_end;
		super::check_room(vm, "kernel bss", load_end, bss)?;
		vm.mem().fill(load_end, bss as usize, 0)?;
		end = h.bss_end_addr as u64;
	}
	Ok(Loaded {
		entry: h.entry_addr as u64,
		end,
	})
}

fn load_elf(vm: &Vm, image: &[u8]) -> Result<Loaded> {
	let (ehdr, _) =
		Elf32Header::read_from_prefix(image).map_err(|_| LoaderError::InvalidElf("truncated header"))?;
	if ehdr.ident[..4] != ELFMAG {
		return Err(LoaderError::InvalidElf("bad magic").into());
	}
	if ehdr.ident[4] != ELFCLASS32 || ehdr.ident[5] != ELFDATA2LSB || ehdr.machine != EM_386 {
		return Err(LoaderError::InvalidElf("not a little-endian i386 image").into());
	}
	if ehdr.phentsize as usize != size_of::<Elf32Phdr>() {
		return Err(LoaderError::InvalidElf("unexpected program header size").into());
	}
	let mut end = 0;
	for i in 0..ehdr.phnum as usize {
		let at = ehdr.phoff as usize + i * size_of::<Elf32Phdr>();
		let (phdr, _) = image
			.get(at..)
			.and_then(|b| Elf32Phdr::read_from_prefix(b).ok())
			.ok_or(LoaderError::InvalidElf("program header beyond the file"))?;
		if phdr.kind != PT_LOAD || phdr.memsz == 0 {
			continue;
		}
		let data = image
			.get(phdr.offset as usize..(phdr.offset as usize + phdr.filesz as usize))
			.ok_or(LoaderError::InvalidElf("segment beyond the file"))?;
		if phdr.memsz < phdr.filesz {
			return Err(LoaderError::InvalidElf("segment memory size below file size").into());
		}
		let gpa = phdr.paddr as u64;
		super::check_room(vm, "kernel segment", gpa, phdr.memsz as u64)?;
		vm.mem().write(gpa, data)?;
		vm.mem().fill(
			gpa + phdr.filesz as u64,
			(phdr.memsz - phdr.filesz) as usize,
			0,
		)?;
		debug!("PT_LOAD {gpa:#x}+{:#x}", phdr.memsz);
		end = end.max(gpa + phdr.memsz as u64);
	}
	if end == 0 {
		return Err(LoaderError::InvalidElf("no loadable segments").into());
	}
	Ok(Loaded {
		entry: ehdr.entry as u64,
		end,
	})
}

/// Places NUL-terminated strings one after another.
struct Strings {
	base: u64,
	buf: Vec<u8>,
}

impl Strings {
	fn push(&mut self, s: &str) -> u32 {
		let at = self.base + self.buf.len() as u64;
		self.buf.extend_from_slice(s.as_bytes());
		self.buf.push(0);
		at as u32
	}
}

pub fn load(vm: &Vm, kernel: &Path, modules: &[(PathBuf, String)], cmdline: &str) -> Result<BootState> {
	let image = read_file(kernel)?;
	let (off, header) = find_header(&image).ok_or(LoaderError::NoMultibootHeader)?;
	// Bits 0-15 are requirements; only page alignment and memory info are
	// understood.
	let unknown = header.flags & 0xffff & !(PAGE_ALIGN | MEMORY_INFO);
	if unknown != 0 {
		return Err(LoaderError::MultibootFlags(unknown).into());
	}
	let kernel = if header.flags & AOUT_KLUDGE != 0 {
		if off + size_of::<Header>() > image.len() {
			return Err(LoaderError::NoMultibootHeader.into());
		}
		load_aout(vm, &image, off, &header)?
	} else {
		load_elf(vm, &image)?
	};
	info!(
		"multiboot kernel loaded up to {:#x}, entry {:#x}",
		kernel.end, kernel.entry
	);

	let page = PAGE_SIZE as u64;
	let mut next = kernel.end.align_up(page);
	let mut placed = Vec::with_capacity(modules.len());
	for (path, _) in modules {
		let data = read_file(path)?;
		copy_in(vm, "module", next, &data)?;
		debug!("module {} at {next:#x}+{:#x}", path.display(), data.len());
		placed.push((next, next + data.len() as u64));
		next = (next + data.len() as u64).align_up(page);
	}

	let info_gpa = next;
	let mods_gpa = info_gpa + size_of::<Info>() as u64;
	let mut strings = Strings {
		base: mods_gpa + (modules.len() * size_of::<Module>()) as u64,
		buf: Vec::new(),
	};
	let lowmem = vm.mem().lowmem_size();
	let mut info = Info {
		flags: INFO_MEMORY | INFO_CMDLINE,
		mem_lower: 640,
		mem_upper: (lowmem.saturating_sub(MIB) / KIB) as u32,
		cmdline: strings.push(cmdline),
		..Default::default()
	};
	let mods: Vec<Module> = placed
		.iter()
		.zip(modules)
		.map(|((start, end), (_, cl))| Module {
			mod_start: *start as u32,
			mod_end: *end as u32,
			string: strings.push(cl),
			reserved: 0,
		})
		.collect();
	if !mods.is_empty() {
		info.flags |= INFO_MODS;
		info.mods_count = mods.len() as u32;
		info.mods_addr = mods_gpa as u32;
	}
	copy_in(vm, "multiboot info", info_gpa, info.as_bytes())?;
	copy_in(vm, "module list", mods_gpa, mods.as_bytes())?;
	copy_in(vm, "command lines", strings.base, &strings.buf)?;

	let gdt = write_flat_gdt(vm, GDT_ADDR, 1, 2)?;
	let mut state = BootState::flat32(gdt, kernel.entry);
	state.regs.push((Reg::Rax, BOOTLOADER_MAGIC as u64));
	state.regs.push((Reg::Rbx, info_gpa));
	Ok(state)
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use tempfile::NamedTempFile;

	use super::*;
	use crate::{consts::CR0_PE, pci::tests::vm};

	fn aout_kernel(entry: u32) -> Vec<u8> {
		// Loaded at 1 MiB; the header sits 0x20 bytes into the image.
		let mut image = vec![0x90u8; 0x2000];
		let flags = PAGE_ALIGN | MEMORY_INFO | AOUT_KLUDGE;
		let header = Header {
			magic: HEADER_MAGIC,
			flags,
			checksum: 0u32.wrapping_sub(HEADER_MAGIC).wrapping_sub(flags),
			header_addr: 0x10_0020,
			load_addr: 0x10_0000,
			load_end_addr: 0x10_2000,
			bss_end_addr: 0x10_3000,
			entry_addr: entry,
		};
		image[0x20..0x40].copy_from_slice(header.as_bytes());
		image
	}

	fn temp(data: &[u8]) -> NamedTempFile {
		let mut f = NamedTempFile::new().unwrap();
		f.write_all(data).unwrap();
		f
	}

	#[test]
	fn header_search() {
		let image = aout_kernel(0x10_0040);
		assert_eq!(find_header(&image).unwrap().0, 0x20);

		let mut broken = image.clone();
		broken[0x28] ^= 1;
		assert!(find_header(&broken).is_none());

		let mut late = vec![0u8; SEARCH_LIMIT + 64];
		late[SEARCH_LIMIT..SEARCH_LIMIT + 32].copy_from_slice(&image[0x20..0x40]);
		assert!(find_header(&late).is_none());
	}

	#[test]
	fn aout_with_module() {
		let vm = vm();
		vm.setup_memory(16 * MIB).unwrap();
		let kernel = temp(&aout_kernel(0x10_0040));
		let module = temp(&[0xaa; 5000]);
		let state = load(
			&vm,
			kernel.path(),
			&[(module.path().to_path_buf(), "initrd".into())],
			"console=ttyS0 quiet",
		)
		.unwrap();

		assert_eq!(state.reg(Reg::Rip), Some(0x10_0040));
		assert_eq!(state.reg(Reg::Rax), Some(0x2bad_b002));
		assert_eq!(state.reg(Reg::Cr0).unwrap() & CR0_PE, CR0_PE);
		assert_eq!(state.segment(Reg::Cs).unwrap().0, 0x08);
		assert_eq!(state.segment(Reg::Ds).unwrap().0, 0x10);

		// The kernel is copied and its bss cleared.
		assert_eq!(vm.mem().read_u8(0x10_1fff).unwrap(), 0x90);
		assert_eq!(vm.mem().read_u8(0x10_2000).unwrap(), 0);

		let info_gpa = state.reg(Reg::Rbx).unwrap();
		let info: Info = vm.mem().read_obj(info_gpa).unwrap();
		assert_eq!(info.flags, INFO_MEMORY | INFO_CMDLINE | INFO_MODS);
		assert_eq!(info.mods_count, 1);
		assert_eq!(info.mem_lower, 640);
		assert_eq!(info.mem_upper, 15 * 1024);

		let module: Module = vm.mem().read_obj(info.mods_addr as u64).unwrap();
		assert_eq!(module.mod_start, 0x10_3000);
		assert_eq!(module.mod_end, 0x10_3000 + 5000);
		assert_eq!(vm.mem().read_u8(module.mod_start as u64).unwrap(), 0xaa);
		assert_eq!(module.mod_start as u64 % PAGE_SIZE as u64, 0);

		let mut cl = [0u8; 20];
		vm.mem().read(info.cmdline as u64, &mut cl).unwrap();
		assert_eq!(&cl[..19], b"console=ttyS0 quiet");
		assert_eq!(cl[19], 0);
		let mut name = [0u8; 7];
		vm.mem().read(module.string as u64, &mut name).unwrap();
		assert_eq!(&name, b"initrd\0");
	}

	#[test]
	fn elf_kernel() {
		let mut image = vec![0u8; 0x3000];
		let ehdr_len = size_of::<Elf32Header>();
		image[..4].copy_from_slice(&ELFMAG);
		image[4] = ELFCLASS32;
		image[5] = ELFDATA2LSB;
		image[18..20].copy_from_slice(&EM_386.to_le_bytes());
		image[24..28].copy_from_slice(&0x20_0010u32.to_le_bytes());
		image[28..32].copy_from_slice(&(ehdr_len as u32).to_le_bytes());
		image[42..44].copy_from_slice(&32u16.to_le_bytes());
		image[44..46].copy_from_slice(&1u16.to_le_bytes());
		let phdr: [u32; 8] = [PT_LOAD, 0x1000, 0x20_0000, 0x20_0000, 0x1000, 0x4000, 5, 0x1000];
		image[ehdr_len..ehdr_len + 32].copy_from_slice(phdr.as_bytes());
		// Multiboot header without the a.out kludge inside the segment.
		let flags = PAGE_ALIGN;
		for (i, word) in [HEADER_MAGIC, flags, 0u32.wrapping_sub(HEADER_MAGIC + flags)]
			.iter()
			.enumerate()
		{
			image[0x1000 + 4 * i..0x1004 + 4 * i].copy_from_slice(&word.to_le_bytes());
		}
		image[0x1100] = 0xf4;

		let vm = vm();
		vm.setup_memory(16 * MIB).unwrap();
		let kernel = temp(&image);
		let state = load(&vm, kernel.path(), &[], "").unwrap();
		assert_eq!(state.reg(Reg::Rip), Some(0x20_0010));
		assert_eq!(vm.mem().read_u8(0x20_0100).unwrap(), 0xf4);
		let info: Info = vm.mem().read_obj(state.reg(Reg::Rbx).unwrap()).unwrap();
		assert_eq!(info.flags, INFO_MEMORY | INFO_CMDLINE);
		// Info goes after the bss of the only segment.
		assert_eq!(state.reg(Reg::Rbx), Some(0x20_4000));
	}

	#[test]
	fn rejects_video_requests_and_missing_header() {
		let vm = vm();
		vm.setup_memory(16 * MIB).unwrap();
		let mut image = aout_kernel(0x10_0040);
		let flags = AOUT_KLUDGE | (1 << 2);
		image[0x24..0x28].copy_from_slice(&flags.to_le_bytes());
		image[0x28..0x2c].copy_from_slice(&0u32.wrapping_sub(HEADER_MAGIC).wrapping_sub(flags).to_le_bytes());
		let kernel = temp(&image);
		let err = load(&vm, kernel.path(), &[], "").unwrap_err();
		assert!(matches!(
			err,
			crate::error::VmmError::Loader(LoaderError::MultibootFlags(4))
		));

		let kernel = temp(&[0u8; 4096]);
		let err = load(&vm, kernel.path(), &[], "").unwrap_err();
		assert!(matches!(
			err,
			crate::error::VmmError::Loader(LoaderError::NoMultibootHeader)
		));
	}
}
