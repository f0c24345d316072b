//! Host side of the FreeBSD `userboot.so` loader interface (version 3).
//!
//! The loader runs on its own thread and calls back into the host for
//! console, file and disk I/O and for guest memory access. It ends with
//! either `exec`, which yields the boot state of the BSP, or `exit`. Neither
//! returns to the loader, so the thread parks for the rest of the process.

use std::{
	ffi::{CStr, CString, c_char, c_int, c_void},
	fs::{self, File, Metadata},
	io::{self, Read, Seek, SeekFrom, Write},
	os::{
		fd::AsFd,
		unix::fs::{DirEntryExt, FileExt, MetadataExt},
	},
	path::{Path, PathBuf},
	sync::{Arc, mpsc},
	thread,
	time::Duration,
};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use x86_64::structures::gdt::DescriptorFlags;

use super::{
	ACCESS_CODE64, ACCESS_DATA32, ACCESS_TSS_BUSY, BootState, FlatGdt, LoaderError, write_flat_gdt,
};
use crate::{
	consts::{CR0_NE, CR0_PE, CR0_PG, CR4_PAE, EFER_LMA, EFER_LME, PSL_RESERVED_ONE, msr},
	devices::uart,
	emulate::SegDesc,
	error::{Result, VmmError},
	vm::Vm,
	vmx::backend::Reg,
};

const USERBOOT_VERSION: c_int = 3;
/// Userboot addresses guest memory through a 31-bit window.
const GUEST_MASK: u64 = 0x7fff_ffff;
const SECTOR_SIZE: u32 = 512;

const DIOCGSECTORSIZE: u64 = 0x4004_6480;
const DIOCGMEDIASIZE: u64 = 0x4008_6481;

const DT_UNKNOWN: u8 = 0;
const DT_DIR: u8 = 4;
const DT_REG: u8 = 8;
const DT_LNK: u8 = 10;
const MAXNAMLEN: usize = 255;

const FIXED_ENV: [&str; 2] = ["smbios.bios.vendor=BHYVE", "boot_serial=1"];

#[derive(Debug, Clone, Default)]
pub struct UserbootConfig {
	pub userboot: PathBuf,
	/// Disk images, unit 0 first.
	pub disks: Vec<PathBuf>,
	/// Extra `name=value` loader variables.
	pub env: Vec<String>,
	/// Directory served as the loader's host file system.
	pub host_root: Option<PathBuf>,
}

/// `struct loader_callbacks` of `userboot.h`, version 3.
#[repr(C)]
#[derive(Clone, Copy)]
struct LoaderCallbacks {
	getc: extern "C" fn(*mut c_void) -> c_int,
	putc: extern "C" fn(*mut c_void, c_int),
	poll: extern "C" fn(*mut c_void) -> c_int,
	open: extern "C" fn(*mut c_void, *const c_char, *mut *mut c_void) -> c_int,
	close: extern "C" fn(*mut c_void, *mut c_void) -> c_int,
	isdir: extern "C" fn(*mut c_void, *mut c_void) -> c_int,
	read: extern "C" fn(*mut c_void, *mut c_void, *mut c_void, usize, *mut usize) -> c_int,
	readdir: extern "C" fn(*mut c_void, *mut c_void, *mut u32, *mut u8, *mut usize, *mut c_char)
		-> c_int,
	seek: extern "C" fn(*mut c_void, *mut c_void, u64, c_int) -> c_int,
	stat: extern "C" fn(*mut c_void, *mut c_void, *mut c_int, *mut c_int, *mut c_int, *mut u64)
		-> c_int,
	diskread: extern "C" fn(*mut c_void, c_int, u64, *mut c_void, usize, *mut usize) -> c_int,
	copyin: extern "C" fn(*mut c_void, *const c_void, u64, usize) -> c_int,
	copyout: extern "C" fn(*mut c_void, u64, *mut c_void, usize) -> c_int,
	setreg: extern "C" fn(*mut c_void, c_int, u64),
	setmsr: extern "C" fn(*mut c_void, c_int, u64),
	setcr: extern "C" fn(*mut c_void, c_int, u64),
	setgdt: extern "C" fn(*mut c_void, u64, usize),
	exec: extern "C" fn(*mut c_void, u64),
	delay: extern "C" fn(*mut c_void, c_int),
	exit: extern "C" fn(*mut c_void, c_int),
	getmem: extern "C" fn(*mut c_void, *mut u64, *mut u64),
	diskioctl: extern "C" fn(*mut c_void, c_int, u64, *mut c_void) -> c_int,
	getenv: extern "C" fn(*mut c_void, c_int) -> *const c_char,
}

const CALLBACKS: LoaderCallbacks = LoaderCallbacks {
	getc: cb_getc,
	putc: cb_putc,
	poll: cb_poll,
	open: cb_open,
	close: cb_close,
	isdir: cb_isdir,
	read: cb_read,
	readdir: cb_readdir,
	seek: cb_seek,
	stat: cb_stat,
	diskread: cb_diskread,
	copyin: cb_copyin,
	copyout: cb_copyout,
	setreg: cb_setreg,
	setmsr: cb_setmsr,
	setcr: cb_setcr,
	setgdt: cb_setgdt,
	exec: cb_exec,
	delay: cb_delay,
	exit: cb_exit,
	getmem: cb_getmem,
	diskioctl: cb_diskioctl,
	getenv: cb_getenv,
};

type LoaderMain = unsafe extern "C" fn(*mut LoaderCallbacks, *mut c_void, c_int, c_int);

/// An open file or directory of the host file system.
enum Handle {
	File { file: File, meta: Metadata },
	Dir {
		entries: Vec<(String, u32, u8)>,
		next: usize,
		meta: Metadata,
	},
}

impl Handle {
	fn meta(&self) -> &Metadata {
		match self {
			Handle::File { meta, .. } | Handle::Dir { meta, .. } => meta,
		}
	}
}

/// Registers the loader set before `exec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LoaderRegs {
	rsp: u64,
	efer: u64,
	cr0: u64,
	cr3: u64,
	cr4: u64,
	gdt: (u64, u32),
}

type Outcome = std::result::Result<BootState, LoaderError>;

pub(crate) struct Host {
	vm: Arc<Vm>,
	root: Option<PathBuf>,
	disks: Vec<File>,
	env: Vec<CString>,
	regs: LoaderRegs,
	done: mpsc::SyncSender<Outcome>,
}

fn errno(err: &io::Error) -> c_int {
	err.raw_os_error().unwrap_or(libc::EIO)
}

/// # Safety
/// `arg` is the `Host` handed to `loader_main`, used from the loader thread only.
unsafe fn host<'a>(arg: *mut c_void) -> &'a mut Host {
	unsafe { &mut *(arg as *mut Host) }
}

/// # Safety
/// `h` came from [`cb_open`] and was not closed.
unsafe fn handle<'a>(h: *mut c_void) -> &'a mut Handle {
	unsafe { &mut *(h as *mut Handle) }
}

impl Host {
	pub(crate) fn new(
		vm: Arc<Vm>,
		config: &UserbootConfig,
		done: mpsc::SyncSender<Outcome>,
	) -> std::result::Result<Self, LoaderError> {
		let disks = config
			.disks
			.iter()
			.map(|path| {
				fs::OpenOptions::new()
					.read(true)
					.write(true)
					.open(path)
					.map_err(|source| LoaderError::Read {
						path: path.clone(),
						source,
					})
			})
			.collect::<std::result::Result<Vec<_>, _>>()?;
		let env = FIXED_ENV
			.iter()
			.map(|s| s.to_string())
			.chain(config.env.iter().cloned())
			.map(|s| CString::new(s).map_err(|e| LoaderError::InvalidOption(e.to_string())))
			.collect::<std::result::Result<Vec<_>, _>>()?;
		Ok(Self {
			vm,
			root: config.host_root.clone(),
			disks,
			env,
			regs: LoaderRegs::default(),
			done,
		})
	}

	fn resolve(&self, name: &str) -> Option<PathBuf> {
		let root = self.root.as_ref()?;
		// Normalized against "/" so that ".." cannot leave the root.
		let clean = clean_path::clean(Path::new("/").join(name));
		Some(root.join(clean.strip_prefix("/").ok()?))
	}

	fn open(&self, name: &str) -> io::Result<Handle> {
		let path = self
			.resolve(name)
			.ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
		let meta = fs::metadata(&path)?;
		if meta.is_dir() {
			let mut entries = Vec::new();
			for entry in fs::read_dir(&path)? {
				let entry = entry?;
				let kind = match entry.file_type() {
					Ok(t) if t.is_dir() => DT_DIR,
					Ok(t) if t.is_file() => DT_REG,
					Ok(t) if t.is_symlink() => DT_LNK,
					_ => DT_UNKNOWN,
				};
				entries.push((
					entry.file_name().to_string_lossy().into_owned(),
					entry.ino() as u32,
					kind,
				));
			}
			Ok(Handle::Dir {
				entries,
				next: 0,
				meta,
			})
		} else {
			Ok(Handle::File {
				file: File::open(&path)?,
				meta,
			})
		}
	}

	fn copyin(&self, data: &[u8], gpa: u64) -> Result<()> {
		self.vm.mem().write(gpa & GUEST_MASK, data)
	}

	fn copyout(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
		self.vm.mem().read(gpa & GUEST_MASK, buf)
	}

	fn diskread(&self, unit: usize, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
		let disk = self
			.disks
			.get(unit)
			.ok_or_else(|| io::Error::from_raw_os_error(libc::ENXIO))?;
		let mut done = 0;
		while done < buf.len() {
			match disk.read_at(&mut buf[done..], offset + done as u64)? {
				0 => break,
				n => done += n,
			}
		}
		Ok(done)
	}

	fn getenv(&self, num: usize) -> Option<&CStr> {
		self.env.get(num).map(CString::as_c_str)
	}

	/// Builds the BSP state for `exec`. A loader that set CR3 enters the
	/// kernel in long mode, otherwise in flat 32-bit protected mode.
	fn boot_state(&self, rip: u64) -> Result<BootState> {
		let regs = &self.regs;
		if regs.cr3 == 0 {
			let gdt = write_flat_gdt(&self.vm, regs.gdt.0, 1, 2)?;
			let mut state = BootState::flat32(gdt, rip);
			state.regs.retain(|(r, _)| *r != Reg::Cr0);
			state.regs.extend([
				(Reg::Rsp, regs.rsp),
				(Reg::Cr0, CR0_PE | CR0_NE),
				(Reg::Cr4, 0),
			]);
			return Ok(state);
		}

		let gdt = FlatGdt {
			base: regs.gdt.0,
			limit: 3 * 8 - 1,
			code: 1 << 3,
			data: 2 << 3,
		};
		self.vm.mem().write_u64(gdt.base, 0)?;
		self.vm
			.mem()
			.write_u64(gdt.base + 8, DescriptorFlags::KERNEL_CODE64.bits())?;
		self.vm
			.mem()
			.write_u64(gdt.base + 16, DescriptorFlags::KERNEL_DATA.bits())?;
		let code = SegDesc {
			base: 0,
			limit: 0,
			access: ACCESS_CODE64,
		};
		let data = SegDesc {
			access: ACCESS_DATA32 & 0xff,
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
		Ok(BootState {
			regs: vec![
				(Reg::Rip, rip),
				(Reg::Rsp, regs.rsp),
				(Reg::Rflags, PSL_RESERVED_ONE),
				(Reg::Cr3, regs.cr3),
				(Reg::Cr4, regs.cr4 | CR4_PAE),
				(Reg::Cr0, regs.cr0 | CR0_PG | CR0_PE | CR0_NE),
			],
			segments,
			gdtr: Some((gdt.base, gdt.limit)),
			idtr: Some((0, 0)),
			efer: Some(regs.efer | EFER_LME | EFER_LMA),
		})
	}

	/// Hands the outcome to [`load`] and never returns to the loader.
	fn finish(&mut self, outcome: Outcome) -> ! {
		if self.done.send(outcome).is_err() {
			warn!("userboot finished after the host stopped waiting");
		}
		loop {
			thread::park();
		}
	}
}

extern "C" fn cb_getc(_arg: *mut c_void) -> c_int {
	let mut byte = [0u8; 1];
	match nix::unistd::read(io::stdin().as_fd(), &mut byte) {
		Ok(1) => byte[0] as c_int,
		_ => -1,
	}
}

extern "C" fn cb_putc(_arg: *mut c_void, c: c_int) {
	let mut out = io::stdout().lock();
	if out.write_all(&[c as u8]).and_then(|_| out.flush()).is_err() {
		debug!("userboot console write failed");
	}
}

extern "C" fn cb_poll(_arg: *mut c_void) -> c_int {
	let stdin = io::stdin();
	let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
	match poll(&mut fds, PollTimeout::ZERO) {
		Ok(n) if n > 0 => 1,
		_ => 0,
	}
}

extern "C" fn cb_open(arg: *mut c_void, filename: *const c_char, h_return: *mut *mut c_void) -> c_int {
	let host = unsafe { host(arg) };
	let name = unsafe { CStr::from_ptr(filename) }.to_string_lossy();
	match host.open(&name) {
		Ok(handle) => {
			trace!("userboot open {name}");
			unsafe { *h_return = Box::into_raw(Box::new(handle)) as *mut c_void };
			0
		}
		Err(err) => errno(&err),
	}
}

extern "C" fn cb_close(_arg: *mut c_void, h: *mut c_void) -> c_int {
	drop(unsafe { Box::from_raw(h as *mut Handle) });
	0
}

extern "C" fn cb_isdir(_arg: *mut c_void, h: *mut c_void) -> c_int {
	matches!(unsafe { handle(h) }, Handle::Dir { .. }) as c_int
}

extern "C" fn cb_read(
	_arg: *mut c_void,
	h: *mut c_void,
	dst: *mut c_void,
	size: usize,
	resid: *mut usize,
) -> c_int {
	let Handle::File { file, .. } = (unsafe { handle(h) }) else {
		return libc::EISDIR;
	};
	let buf = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, size) };
	let mut done = 0;
	while done < size {
		match file.read(&mut buf[done..]) {
			Ok(0) => break,
			Ok(n) => done += n,
			Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
			Err(err) => return errno(&err),
		}
	}
	unsafe { *resid = size - done };
	0
}

extern "C" fn cb_readdir(
	_arg: *mut c_void,
	h: *mut c_void,
	fileno: *mut u32,
	kind: *mut u8,
	namelen: *mut usize,
	name: *mut c_char,
) -> c_int {
	let Handle::Dir { entries, next, .. } = (unsafe { handle(h) }) else {
		return libc::ENOTDIR;
	};
	let Some((entry, ino, dtype)) = entries.get(*next) else {
		return libc::ENOENT;
	};
	*next += 1;
	let bytes = &entry.as_bytes()[..entry.len().min(MAXNAMLEN)];
	unsafe {
		*fileno = *ino;
		*kind = *dtype;
		*namelen = bytes.len();
		std::ptr::copy_nonoverlapping(bytes.as_ptr(), name as *mut u8, bytes.len());
		*name.add(bytes.len()) = 0;
	}
	0
}

extern "C" fn cb_seek(_arg: *mut c_void, h: *mut c_void, offset: u64, whence: c_int) -> c_int {
	let Handle::File { file, .. } = (unsafe { handle(h) }) else {
		return libc::EISDIR;
	};
	let pos = match whence {
		libc::SEEK_SET => SeekFrom::Start(offset),
		libc::SEEK_CUR => SeekFrom::Current(offset as i64),
		libc::SEEK_END => SeekFrom::End(offset as i64),
		_ => return libc::EINVAL,
	};
	match file.seek(pos) {
		Ok(_) => 0,
		Err(err) => errno(&err),
	}
}

extern "C" fn cb_stat(
	_arg: *mut c_void,
	h: *mut c_void,
	mode: *mut c_int,
	uid: *mut c_int,
	gid: *mut c_int,
	size: *mut u64,
) -> c_int {
	let meta = unsafe { handle(h) }.meta();
	unsafe {
		*mode = meta.mode() as c_int;
		*uid = meta.uid() as c_int;
		*gid = meta.gid() as c_int;
		*size = meta.size();
	}
	0
}

extern "C" fn cb_diskread(
	arg: *mut c_void,
	unit: c_int,
	offset: u64,
	dst: *mut c_void,
	size: usize,
	resid: *mut usize,
) -> c_int {
	let host = unsafe { host(arg) };
	let buf = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, size) };
	match host.diskread(unit as usize, offset, buf) {
		Ok(done) => {
			unsafe { *resid = size - done };
			0
		}
		Err(err) => errno(&err),
	}
}

extern "C" fn cb_copyin(arg: *mut c_void, from: *const c_void, to: u64, size: usize) -> c_int {
	let host = unsafe { host(arg) };
	let data = unsafe { std::slice::from_raw_parts(from as *const u8, size) };
	match host.copyin(data, to) {
		Ok(()) => 0,
		Err(_) => libc::EFAULT,
	}
}

extern "C" fn cb_copyout(arg: *mut c_void, from: u64, to: *mut c_void, size: usize) -> c_int {
	let host = unsafe { host(arg) };
	let buf = unsafe { std::slice::from_raw_parts_mut(to as *mut u8, size) };
	match host.copyout(from, buf) {
		Ok(()) => 0,
		Err(_) => libc::EFAULT,
	}
}

extern "C" fn cb_setreg(arg: *mut c_void, reg: c_int, value: u64) {
	let host = unsafe { host(arg) };
	match reg {
		4 => host.regs.rsp = value,
		_ => warn!("userboot: ignoring register {reg} = {value:#x}"),
	}
}

extern "C" fn cb_setmsr(arg: *mut c_void, reg: c_int, value: u64) {
	let host = unsafe { host(arg) };
	match reg as u32 {
		msr::IA32_EFER => host.regs.efer = value,
		_ => warn!("userboot: ignoring MSR {reg:#x} = {value:#x}"),
	}
}

extern "C" fn cb_setcr(arg: *mut c_void, reg: c_int, value: u64) {
	let host = unsafe { host(arg) };
	match reg {
		0 => host.regs.cr0 = value,
		3 => host.regs.cr3 = value,
		4 => host.regs.cr4 = value,
		_ => warn!("userboot: ignoring CR{reg} = {value:#x}"),
	}
}

extern "C" fn cb_setgdt(arg: *mut c_void, base: u64, size: usize) {
	let host = unsafe { host(arg) };
	host.regs.gdt = (base, size.saturating_sub(1) as u32);
}

extern "C" fn cb_exec(arg: *mut c_void, pc: u64) {
	let host = unsafe { host(arg) };
	info!("userboot: exec {pc:#x}");
	let outcome = host.boot_state(pc).map_err(|err| match err {
		VmmError::Loader(err) => err,
		other => LoaderError::Userboot(other.to_string()),
	});
	host.finish(outcome)
}

extern "C" fn cb_delay(_arg: *mut c_void, usec: c_int) {
	thread::sleep(Duration::from_micros(usec.max(0) as u64));
}

extern "C" fn cb_exit(arg: *mut c_void, value: c_int) {
	let host = unsafe { host(arg) };
	host.finish(Err(LoaderError::Userboot(format!(
		"loader exited with status {value}"
	))))
}

extern "C" fn cb_getmem(arg: *mut c_void, lowmem: *mut u64, highmem: *mut u64) {
	let host = unsafe { host(arg) };
	unsafe {
		*lowmem = host.vm.mem().lowmem_size();
		*highmem = host.vm.mem().highmem_size();
	}
}

extern "C" fn cb_diskioctl(arg: *mut c_void, unit: c_int, cmd: u64, data: *mut c_void) -> c_int {
	let host = unsafe { host(arg) };
	let Some(disk) = host.disks.get(unit as usize) else {
		return libc::ENXIO;
	};
	match cmd {
		DIOCGSECTORSIZE => unsafe { *(data as *mut u32) = SECTOR_SIZE },
		DIOCGMEDIASIZE => match disk.metadata() {
			Ok(meta) => unsafe { *(data as *mut i64) = meta.len() as i64 },
			Err(err) => return errno(&err),
		},
		_ => return libc::ENOTTY,
	}
	0
}

extern "C" fn cb_getenv(arg: *mut c_void, num: c_int) -> *const c_char {
	let host = unsafe { host(arg) };
	host.getenv(num as usize)
		.map_or(std::ptr::null(), CStr::as_ptr)
}

fn dl_error() -> String {
	let msg = unsafe { libc::dlerror() };
	if msg.is_null() {
		"unknown error".into()
	} else {
		unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
	}
}

fn open_loader(path: &Path) -> std::result::Result<LoaderMain, LoaderError> {
	let cpath = CString::new(path.as_os_str().as_encoded_bytes())
		.map_err(|e| LoaderError::InvalidOption(e.to_string()))?;
	let lib = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_LOCAL | libc::RTLD_NOW) };
	if lib.is_null() {
		return Err(LoaderError::Userboot(dl_error()));
	}
	let sym = unsafe { libc::dlsym(lib, c"loader_main".as_ptr()) };
	if sym.is_null() {
		return Err(LoaderError::Userboot(dl_error()));
	}
	// SAFETY: `loader_main` has this signature in every userboot version.
	Ok(unsafe { std::mem::transmute::<*mut c_void, LoaderMain>(sym) })
}

/// Runs `userboot.so` until it execs the kernel.
pub fn load(vm: &Vm, config: UserbootConfig) -> Result<BootState> {
	let vm = vm
		.arc()
		.ok_or_else(|| LoaderError::Userboot("virtual machine is gone".into()))?;
	let loader_main = open_loader(&config.userboot)?;
	let (tx, rx) = mpsc::sync_channel(1);
	let host = Host::new(vm, &config, tx)?;
	let ndisks = host.disks.len() as c_int;
	uart::stdin_raw_mode()?;

	thread::Builder::new()
		.name("userboot".into())
		.spawn(move || {
			let mut host = host;
			let mut callbacks = CALLBACKS;
			unsafe {
				loader_main(
					&mut callbacks,
					&mut host as *mut Host as *mut c_void,
					USERBOOT_VERSION,
					ndisks,
				)
			};
			host.finish(Err(LoaderError::Userboot(
				"loader returned without booting a kernel".into(),
			)));
		})?;

	let outcome = rx
		.recv()
		.map_err(|_| LoaderError::Userboot("loader thread died".into()))?;
	uart::restore_terminal();
	Ok(outcome?)
}

#[cfg(test)]
mod tests {
	use std::ptr;

	use tempfile::TempDir;

	use super::*;
	use crate::{consts::MIB, firmware::ACCESS_CODE32, pci::tests::vm};

	fn host(root: Option<&Path>, disks: Vec<PathBuf>) -> (Box<Host>, mpsc::Receiver<Outcome>) {
		let vm = vm();
		vm.setup_memory(8 * MIB).unwrap();
		let (tx, rx) = mpsc::sync_channel(1);
		let config = UserbootConfig {
			disks,
			env: vec!["kern.hz=100".into()],
			host_root: root.map(Path::to_path_buf),
			..Default::default()
		};
		(Box::new(Host::new(vm, &config, tx).unwrap()), rx)
	}

	fn arg(host: &mut Host) -> *mut c_void {
		host as *mut Host as *mut c_void
	}

	fn env(host: &mut Host, num: c_int) -> Option<String> {
		let p = cb_getenv(arg(host), num);
		(!p.is_null()).then(|| unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
	}

	#[test]
	fn environment() {
		let (mut host, _rx) = host(None, vec![]);
		assert_eq!(env(&mut host, 0).as_deref(), Some("smbios.bios.vendor=BHYVE"));
		assert_eq!(env(&mut host, 1).as_deref(), Some("boot_serial=1"));
		assert_eq!(env(&mut host, 2).as_deref(), Some("kern.hz=100"));
		assert_eq!(env(&mut host, 3), None);
	}

	#[test]
	fn host_files() {
		let dir = TempDir::new().unwrap();
		fs::create_dir(dir.path().join("boot")).unwrap();
		fs::write(dir.path().join("boot/loader.conf"), b"autoboot_delay=1\n").unwrap();
		let (mut host, _rx) = host(Some(dir.path()), vec![]);
		let a = arg(&mut host);

		let mut h = ptr::null_mut();
		assert_eq!(cb_open(a, c"/boot/loader.conf".as_ptr(), &mut h), 0);
		assert_eq!(cb_isdir(a, h), 0);
		let (mut mode, mut uid, mut gid, mut size) = (0, 0, 0, 0);
		assert_eq!(cb_stat(a, h, &mut mode, &mut uid, &mut gid, &mut size), 0);
		assert_eq!(size, 17);
		assert_eq!(cb_seek(a, h, 9, libc::SEEK_SET), 0);
		let mut buf = [0u8; 32];
		let mut resid = 0;
		assert_eq!(cb_read(a, h, buf.as_mut_ptr() as *mut c_void, 32, &mut resid), 0);
		assert_eq!(resid, 32 - 8);
		assert_eq!(&buf[..8], b"delay=1\n");
		assert_eq!(cb_close(a, h), 0);

		let mut d = ptr::null_mut();
		assert_eq!(cb_open(a, c"/boot/../boot".as_ptr(), &mut d), 0);
		assert_eq!(cb_isdir(a, d), 1);
		let (mut ino, mut kind, mut len) = (0u32, 0u8, 0usize);
		let mut name = [0 as c_char; MAXNAMLEN + 1];
		assert_eq!(
			cb_readdir(a, d, &mut ino, &mut kind, &mut len, name.as_mut_ptr()),
			0
		);
		assert_eq!(kind, DT_REG);
		assert_eq!(len, "loader.conf".len());
		assert_eq!(
			unsafe { CStr::from_ptr(name.as_ptr()) }.to_str().unwrap(),
			"loader.conf"
		);
		assert_eq!(
			cb_readdir(a, d, &mut ino, &mut kind, &mut len, name.as_mut_ptr()),
			libc::ENOENT
		);
		assert_eq!(cb_close(a, d), 0);

		// Paths cannot climb out of the root.
		assert_eq!(
			host.resolve("/../../etc/passwd"),
			Some(dir.path().join("etc/passwd"))
		);
		let mut h = ptr::null_mut();
		assert_eq!(cb_open(a, c"/missing".as_ptr(), &mut h), libc::ENOENT);
	}

	#[test]
	fn no_host_root() {
		let (mut host, _rx) = host(None, vec![]);
		let mut h = ptr::null_mut();
		assert_eq!(cb_open(arg(&mut host), c"/boot".as_ptr(), &mut h), libc::ENOENT);
	}

	#[test]
	fn disks_and_memory() {
		let dir = TempDir::new().unwrap();
		let image = dir.path().join("disk.img");
		let mut data = vec![0u8; 4096];
		data[512..516].copy_from_slice(b"UFS2");
		fs::write(&image, &data).unwrap();
		let (mut host, _rx) = host(None, vec![image]);
		let a = arg(&mut host);

		let mut buf = [0u8; 1024];
		let mut resid = 0;
		assert_eq!(
			cb_diskread(a, 0, 512, buf.as_mut_ptr() as *mut c_void, 1024, &mut resid),
			0
		);
		assert_eq!((resid, &buf[..4]), (0, &b"UFS2"[..]));
		assert_eq!(
			cb_diskread(a, 0, 3584, buf.as_mut_ptr() as *mut c_void, 1024, &mut resid),
			0
		);
		assert_eq!(resid, 512);
		assert_eq!(
			cb_diskread(a, 1, 0, buf.as_mut_ptr() as *mut c_void, 1, &mut resid),
			libc::ENXIO
		);

		let mut sector = 0u32;
		assert_eq!(cb_diskioctl(a, 0, DIOCGSECTORSIZE, &mut sector as *mut u32 as *mut c_void), 0);
		assert_eq!(sector, 512);
		let mut media = 0i64;
		assert_eq!(cb_diskioctl(a, 0, DIOCGMEDIASIZE, &mut media as *mut i64 as *mut c_void), 0);
		assert_eq!(media, 4096);
		assert_eq!(cb_diskioctl(a, 0, 0, ptr::null_mut()), libc::ENOTTY);

		let (mut low, mut high) = (0, 0);
		cb_getmem(a, &mut low, &mut high);
		assert_eq!((low, high), (8 * MIB, 0));

		// Guest addresses are masked to 31 bits.
		let payload = *b"kernel";
		assert_eq!(cb_copyin(a, payload.as_ptr() as *const c_void, 0x8010_0000, 6), 0);
		let mut back = [0u8; 6];
		assert_eq!(cb_copyout(a, 0x10_0000, back.as_mut_ptr() as *mut c_void, 6), 0);
		assert_eq!(back, payload);
		assert_eq!(
			cb_copyout(a, 0x7000_0000, back.as_mut_ptr() as *mut c_void, 6),
			libc::EFAULT
		);
	}

	#[test]
	fn exec_states() {
		let (mut host, _rx) = host(None, vec![]);
		let a = arg(&mut host);
		cb_setreg(a, 4, 0x9_f000);
		cb_setgdt(a, 0x5000, 24);
		let state = host.boot_state(0x20_0000).unwrap();
		assert_eq!(state.reg(Reg::Rip), Some(0x20_0000));
		assert_eq!(state.reg(Reg::Rsp), Some(0x9_f000));
		assert_eq!(state.reg(Reg::Cr0), Some(CR0_PE | CR0_NE));
		assert_eq!(state.segment(Reg::Cs).unwrap().1.access, ACCESS_CODE32);
		assert_eq!(state.gdtr, Some((0x5000, 23)));

		let a = arg(&mut host);
		cb_setmsr(a, msr::IA32_EFER as c_int, EFER_LME);
		cb_setcr(a, 3, 0x1000);
		cb_setcr(a, 4, CR4_PAE);
		let state = host.boot_state(0xffff_ffff_8020_0000).unwrap();
		assert_eq!(state.reg(Reg::Cr3), Some(0x1000));
		assert_eq!(state.reg(Reg::Cr0), Some(CR0_PG | CR0_PE | CR0_NE));
		assert_eq!(state.efer, Some(EFER_LME | EFER_LMA));
		let (sel, cs) = state.segment(Reg::Cs).unwrap();
		assert_eq!((sel, cs.access), (8, ACCESS_CODE64));
		assert_eq!(
			host.vm.mem().read_u64(0x5008).unwrap(),
			DescriptorFlags::KERNEL_CODE64.bits()
		);
	}
}
