//! Guest boot: kernel loaders, the boot ROM and the MP table.
//!
//! Exactly one loader runs before the boot processor enters the guest. It
//! copies the images into guest memory and returns the register state the
//! BSP starts with. Loaders keep no host resources once they return.

use std::{
	fs,
	path::{Path, PathBuf},
	str::FromStr,
};

use thiserror::Error;
use x86_64::structures::gdt::DescriptorFlags;

use crate::{
	consts::{CR0_ET, CR0_PE, PSL_RESERVED_ONE},
	emulate::SegDesc,
	error::Result,
	vm::Vm,
	vmx::backend::Reg,
};

pub mod bootrom;
pub mod kexec;
pub mod mptable;
pub mod multiboot;
pub mod userboot;

#[derive(Error, Debug)]
pub enum LoaderError {
	#[error("cannot read {}: {source}", .path.display())]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("no multiboot header in the first 8 KiB of the kernel")]
	NoMultibootHeader,
	#[error("multiboot kernel requests unsupported features {0:#x}")]
	MultibootFlags(u32),
	#[error("invalid ELF image: {0}")]
	InvalidElf(&'static str),
	#[error("not a loadable bzImage: {0}")]
	InvalidBzImage(&'static str),
	#[error("{what} ({len:#x} bytes at {gpa:#x}) does not fit into guest memory")]
	NoRoom { what: &'static str, gpa: u64, len: u64 },
	#[error("boot ROM size {0:#x} must be a multiple of 4 KiB between 4 KiB and 16 MiB")]
	BootromSize(u64),
	#[error("userboot: {0}")]
	Userboot(String),
	#[error("invalid firmware option: {0}")]
	InvalidOption(String),
}

/// Register state for the boot processor, applied after the reset state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootState {
	pub regs: Vec<(Reg, u64)>,
	pub segments: Vec<(Reg, u16, SegDesc)>,
	pub gdtr: Option<(u64, u32)>,
	pub idtr: Option<(u64, u32)>,
	pub efer: Option<u64>,
}

impl BootState {
	pub fn reg(&self, reg: Reg) -> Option<u64> {
		self.regs.iter().find(|(r, _)| *r == reg).map(|(_, v)| *v)
	}

	pub fn segment(&self, reg: Reg) -> Option<(u16, SegDesc)> {
		self.segments
			.iter()
			.find(|(r, ..)| *r == reg)
			.map(|(_, sel, desc)| (*sel, *desc))
	}

	/// Flat 32-bit protected mode without paging, using the GDT at `gdt`
	/// that [`write_flat_gdt`] built.
	pub(crate) fn flat32(gdt: FlatGdt, entry: u64) -> Self {
		let code = SegDesc {
			base: 0,
			limit: 0xffff_ffff,
			access: ACCESS_CODE32,
		};
		let data = SegDesc {
			access: ACCESS_DATA32,
			..code
		};
		let mut segments = vec![(Reg::Cs, gdt.code, code)];
		for reg in [Reg::Ss, Reg::Ds, Reg::Es, Reg::Fs, Reg::Gs] {
			segments.push((reg, gdt.data, data));
		}
		segments.push((
			Reg::Tr,
			0,
			SegDesc {
				base: 0,
				limit: 0,
				access: ACCESS_TSS_BUSY,
			},
		));
		segments.push((Reg::Ldtr, 0, SegDesc::UNUSABLE));
		Self {
			regs: vec![
				(Reg::Rip, entry),
				(Reg::Rflags, PSL_RESERVED_ONE),
				(Reg::Cr0, CR0_PE | CR0_ET),
			],
			segments,
			gdtr: Some((gdt.base, gdt.limit)),
			idtr: Some((0, 0)),
			efer: Some(0),
		}
	}
}

/// VMX access rights: present, DPL 0, 32-bit, 4 KiB granularity.
pub(crate) const ACCESS_CODE32: u32 = 0xc09b;
pub(crate) const ACCESS_DATA32: u32 = 0xc093;
pub(crate) const ACCESS_CODE64: u32 = 0xa09b;
pub(crate) const ACCESS_TSS_BUSY: u32 = 0x8b;

/// A GDT with one flat code and one flat data descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlatGdt {
	pub base: u64,
	pub limit: u32,
	pub code: u16,
	pub data: u16,
}

/// Writes a null descriptor followed by flat descriptors at the given
/// indices. Unused slots stay null.
pub(crate) fn write_flat_gdt(vm: &Vm, base: u64, code_index: u16, data_index: u16) -> Result<FlatGdt> {
	let entries = code_index.max(data_index) as u64 + 1;
	let mut gdt = vec![0u64; entries as usize];
	gdt[code_index as usize] = DescriptorFlags::KERNEL_CODE32.bits();
	gdt[data_index as usize] = DescriptorFlags::KERNEL_DATA.bits();
	for (i, desc) in gdt.iter().enumerate() {
		vm.mem().write_u64(base + 8 * i as u64, *desc)?;
	}
	Ok(FlatGdt {
		base,
		limit: (entries * 8 - 1) as u32,
		code: code_index << 3,
		data: data_index << 3,
	})
}

/// The `-f` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firmware {
	/// `kexec,kernel[,initrd[,cmdline]]`
	Kexec {
		kernel: PathBuf,
		initrd: Option<PathBuf>,
		cmdline: String,
	},
	/// `multiboot,kernel[,mod[;cl][:mod[;cl]]...][,cmdline]`
	Multiboot {
		kernel: PathBuf,
		modules: Vec<(PathBuf, String)>,
		cmdline: String,
	},
	/// `fbsd,userboot,volume[,env]`
	Userboot {
		userboot: PathBuf,
		volume: PathBuf,
		env: Vec<String>,
	},
	/// `bootrom,path`
	Bootrom(PathBuf),
}

fn non_empty(s: Option<&str>) -> Option<&str> {
	s.filter(|s| !s.is_empty())
}

impl FromStr for Firmware {
	type Err = LoaderError;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let invalid = || LoaderError::InvalidOption(s.to_string());
		let (kind, rest) = s.split_once(',').ok_or_else(invalid)?;
		match kind {
			"kexec" => {
				let mut it = rest.splitn(3, ',');
				let kernel = non_empty(it.next()).ok_or_else(invalid)?.into();
				let initrd = non_empty(it.next()).map(PathBuf::from);
				let cmdline = unquote(it.next().unwrap_or_default());
				Ok(Firmware::Kexec {
					kernel,
					initrd,
					cmdline,
				})
			}
			"multiboot" => {
				let mut it = rest.splitn(3, ',');
				let kernel = non_empty(it.next()).ok_or_else(invalid)?.into();
				let modules = non_empty(it.next())
					.map(|mods| {
						mods.split(':')
							.filter(|m| !m.is_empty())
							.map(|m| match m.split_once(';') {
								Some((path, cl)) => (PathBuf::from(path), cl.to_string()),
								None => (PathBuf::from(m), String::new()),
							})
							.collect()
					})
					.unwrap_or_default();
				let cmdline = unquote(it.next().unwrap_or_default());
				Ok(Firmware::Multiboot {
					kernel,
					modules,
					cmdline,
				})
			}
			"fbsd" => {
				let mut it = rest.splitn(3, ',');
				let userboot = non_empty(it.next()).ok_or_else(invalid)?.into();
				let volume = non_empty(it.next()).ok_or_else(invalid)?.into();
				let env = match non_empty(it.next()) {
					Some(env) => shell_words::split(env).map_err(|_| invalid())?,
					None => Vec::new(),
				};
				Ok(Firmware::Userboot {
					userboot,
					volume,
					env,
				})
			}
			"bootrom" => Ok(Firmware::Bootrom(
				non_empty(Some(rest)).ok_or_else(invalid)?.into(),
			)),
			_ => Err(invalid()),
		}
	}
}

/// Strips one pair of surrounding double quotes.
fn unquote(s: &str) -> String {
	s.strip_prefix('"')
		.and_then(|s| s.strip_suffix('"'))
		.unwrap_or(s)
		.to_string()
}

pub(crate) fn read_file(path: &Path) -> std::result::Result<Vec<u8>, LoaderError> {
	fs::read(path).map_err(|source| LoaderError::Read {
		path: path.to_path_buf(),
		source,
	})
}

/// Copies `data` to `gpa`, failing unless the whole range is low RAM.
pub(crate) fn copy_in(vm: &Vm, what: &'static str, gpa: u64, data: &[u8]) -> Result<()> {
	check_room(vm, what, gpa, data.len() as u64)?;
	vm.mem().write(gpa, data)
}

pub(crate) fn check_room(vm: &Vm, what: &'static str, gpa: u64, len: u64) -> Result<()> {
	match gpa.checked_add(len) {
		Some(end) if end <= vm.mem().lowmem_size() => Ok(()),
		_ => Err(LoaderError::NoRoom { what, gpa, len }.into()),
	}
}

/// Loads the selected firmware and returns the boot processor's state.
pub fn load(vm: &Vm, firmware: &Firmware) -> Result<BootState> {
	let state = match firmware {
		Firmware::Kexec {
			kernel,
			initrd,
			cmdline,
		} => {
			info!("kexec {} {cmdline:?}", kernel.display());
			kexec::load(vm, kernel, initrd.as_deref(), cmdline)?
		}
		Firmware::Multiboot {
			kernel,
			modules,
			cmdline,
		} => {
			info!("multiboot {} {cmdline:?}", kernel.display());
			multiboot::load(vm, kernel, modules, cmdline)?
		}
		Firmware::Userboot {
			userboot,
			volume,
			env,
		} => {
			info!("userboot {} on {}", userboot.display(), volume.display());
			let config = userboot::UserbootConfig {
				userboot: userboot.clone(),
				disks: vec![volume.clone()],
				env: env.clone(),
				..Default::default()
			};
			userboot::load(vm, config)?
		}
		Firmware::Bootrom(path) => {
			info!("boot ROM {}", path.display());
			bootrom::load(vm, path)?
		}
	};
	if vm.config().mptable {
		mptable::build(vm)?;
	}
	Ok(state)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn firmware_forms() {
		assert_eq!(
			"kexec,vmlinuz,initrd.gz,\"earlyprintk=serial console=ttyS0\""
				.parse::<Firmware>()
				.unwrap(),
			Firmware::Kexec {
				kernel: "vmlinuz".into(),
				initrd: Some("initrd.gz".into()),
				cmdline: "earlyprintk=serial console=ttyS0".into(),
			}
		);
		assert_eq!(
			"kexec,vmlinuz,,ro,quiet".parse::<Firmware>().unwrap(),
			Firmware::Kexec {
				kernel: "vmlinuz".into(),
				initrd: None,
				cmdline: "ro,quiet".into(),
			}
		);
		assert_eq!(
			"multiboot,kernel.elf,a.mod;x=1:b.mod,console=ttyS0 quiet"
				.parse::<Firmware>()
				.unwrap(),
			Firmware::Multiboot {
				kernel: "kernel.elf".into(),
				modules: vec![("a.mod".into(), "x=1".into()), ("b.mod".into(), String::new())],
				cmdline: "console=ttyS0 quiet".into(),
			}
		);
		assert_eq!(
			"fbsd,userboot.so,disk.img,\"boot_verbose=1 comconsole_speed=115200\""
				.parse::<Firmware>()
				.unwrap(),
			Firmware::Userboot {
				userboot: "userboot.so".into(),
				volume: "disk.img".into(),
				env: vec!["boot_verbose=1".into(), "comconsole_speed=115200".into()],
			}
		);
		assert_eq!(
			"bootrom,/usr/share/firmware/BHYVE_UEFI.fd"
				.parse::<Firmware>()
				.unwrap(),
			Firmware::Bootrom("/usr/share/firmware/BHYVE_UEFI.fd".into())
		);

		for bad in ["kexec", "kexec,", "fbsd,userboot.so", "bootrom,", "uefi,x"] {
			assert!(bad.parse::<Firmware>().is_err(), "{bad}");
		}
	}

	#[test]
	fn flat_gdt() {
		let vm = crate::pci::tests::vm();
		vm.setup_memory(crate::consts::MIB).unwrap();
		let gdt = write_flat_gdt(&vm, 0x2000, 2, 3).unwrap();
		assert_eq!(
			gdt,
			FlatGdt {
				base: 0x2000,
				limit: 31,
				code: 0x10,
				data: 0x18
			}
		);
		assert_eq!(vm.mem().read_u64(0x2000).unwrap(), 0);
		assert_eq!(vm.mem().read_u64(0x2010).unwrap(), 0x00cf_9b00_0000_ffff);
		assert_eq!(vm.mem().read_u64(0x2018).unwrap(), 0x00cf_9300_0000_ffff);

		let state = BootState::flat32(gdt, 0x10_0000);
		assert_eq!(state.reg(Reg::Rip), Some(0x10_0000));
		assert_eq!(state.reg(Reg::Cr0), Some(CR0_PE | CR0_ET));
		let (sel, cs) = state.segment(Reg::Cs).unwrap();
		assert_eq!((sel, cs.limit, cs.access), (0x10, 0xffff_ffff, ACCESS_CODE32));
		assert_eq!(state.segment(Reg::Ss).unwrap().0, 0x18);
	}

	#[test]
	fn copy_in_checks_bounds() {
		let vm = crate::pci::tests::vm();
		vm.setup_memory(crate::consts::MIB).unwrap();
		copy_in(&vm, "blob", 0xf_f000, &[1; 0x1000]).unwrap();
		let err = copy_in(&vm, "blob", 0xf_f001, &[1; 0x1000]).unwrap_err();
		assert!(matches!(
			err,
			crate::error::VmmError::Loader(LoaderError::NoRoom { what: "blob", .. })
		));
	}
}
