//! Port I/O dispatch. Every `IN`/`OUT`/`INS`/`OUTS` exit ends up here,
//! whether the port belongs to an in-core device or to a PCI BAR.

use std::{
	collections::BTreeMap,
	fmt,
	sync::{Arc, RwLock},
};

use crate::{
	consts::PAGE_SIZE,
	emulate::{Prot, alignment_check, calculate_gla, paging, size2mask, update_register},
	error::{Fault, Result, VmmError},
	vm::Vm,
	vmx::{ExitKind, InoutStrExit, VmxVcpu, backend::Reg},
};

/// Back-to-back string iterations handled per exit.
const MAX_STRING_ITERATIONS: u64 = 16;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PortFlags: u8 {
		const IN = 1 << 0;
		const OUT = 1 << 1;
		const INOUT = Self::IN.bits() | Self::OUT.bits();
	}
}

/// `(vm, vcpu, is_in, port, bytes, eax)`. For `in` the handler stores the
/// result in `eax`; for `out` it holds the value written.
pub trait PortHandler: Send + Sync {
	fn handle(&self, vm: &Vm, vcpu: usize, is_in: bool, port: u16, bytes: u8, eax: &mut u32)
	-> Result<()>;
}

impl<F> PortHandler for F
where
	F: Fn(&Vm, usize, bool, u16, u8, &mut u32) -> Result<()> + Send + Sync,
{
	fn handle(
		&self,
		vm: &Vm,
		vcpu: usize,
		is_in: bool,
		port: u16,
		bytes: u8,
		eax: &mut u32,
	) -> Result<()> {
		self(vm, vcpu, is_in, port, bytes, eax)
	}
}

/// Boxes a closure as a port handler.
pub fn handler<F>(f: F) -> Arc<dyn PortHandler>
where
	F: Fn(&Vm, usize, bool, u16, u8, &mut u32) -> Result<()> + Send + Sync + 'static,
{
	Arc::new(f)
}

struct PortRange {
	name: String,
	len: u16,
	flags: PortFlags,
	handler: Arc<dyn PortHandler>,
}

impl fmt::Debug for PortRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PortRange")
			.field("name", &self.name)
			.field("len", &self.len)
			.field("flags", &self.flags)
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Default)]
pub struct InoutPorts {
	ranges: RwLock<BTreeMap<u16, PortRange>>,
}

impl InoutPorts {
	pub fn new() -> Self {
		Self::default()
	}

	/// Claims `len` ports starting at `port`.
	pub fn register(
		&self,
		name: impl Into<String>,
		port: u16,
		len: u16,
		flags: PortFlags,
		handler: Arc<dyn PortHandler>,
	) -> Result<()> {
		let end = port as u32 + len as u32;
		if len == 0 || end > 0x1_0000 {
			return Err(VmmError::InvalidArgument(format!(
				"port range {port:#x}+{len}"
			)));
		}
		let mut ranges = self.write();
		let overlap = ranges
			.range(..=(end - 1) as u16)
			.next_back()
			.is_some_and(|(&base, r)| base as u32 + r.len as u32 > port as u32);
		if overlap {
			return Err(VmmError::PortConflict { port, len });
		}
		let name = name.into();
		debug!("port {port:#x}+{len}: {name}");
		ranges.insert(
			port,
			PortRange {
				name,
				len,
				flags,
				handler,
			},
		);
		Ok(())
	}

	/// Releases a range previously claimed with exactly these bounds.
	pub fn unregister(&self, port: u16, len: u16) -> Result<()> {
		let mut ranges = self.write();
		match ranges.get(&port) {
			Some(range) if range.len == len => {
				ranges.remove(&port);
				Ok(())
			}
			_ => Err(VmmError::InvalidArgument(format!(
				"port range {port:#x}+{len} is not registered"
			))),
		}
	}

	pub fn is_registered(&self, port: u16) -> bool {
		self.lookup(port).is_some()
	}

	fn lookup(&self, port: u16) -> Option<(Arc<dyn PortHandler>, PortFlags)> {
		let ranges = self.read();
		let (&base, range) = ranges.range(..=port).next_back()?;
		(base as u32 + range.len as u32 > port as u32)
			.then(|| (range.handler.clone(), range.flags))
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u16, PortRange>> {
		self.ranges.read().unwrap_or_else(|err| err.into_inner())
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<u16, PortRange>> {
		self.ranges.write().unwrap_or_else(|err| err.into_inner())
	}

	/// Runs the handler for one access. Unclaimed ports read as all-ones
	/// and swallow writes unless the VM runs with strict I/O.
	pub fn dispatch(
		&self,
		vm: &Vm,
		vcpu: usize,
		is_in: bool,
		port: u16,
		bytes: u8,
		eax: &mut u32,
	) -> Result<()> {
		let unhandled = VmmError::UnhandledPort { port, bytes, is_in };
		let Some((handler, flags)) = self.lookup(port) else {
			if vm.config().strictio {
				return Err(unhandled);
			}
			if is_in {
				*eax = size2mask(bytes) as u32;
			}
			return Ok(());
		};
		let allowed = if is_in { PortFlags::IN } else { PortFlags::OUT };
		if !flags.contains(allowed) {
			return Err(unhandled);
		}
		handler.handle(vm, vcpu, is_in, port, bytes, eax)
	}

	/// Completes the port I/O exit recorded in `vcpu`.
	pub fn emulate(&self, vm: &Vm, vcpu: &mut VmxVcpu) -> Result<()> {
		match vcpu.exit.kind {
			ExitKind::Inout(io) => {
				let mask = size2mask(io.bytes) as u32;
				let mut val = io.eax & mask;
				self.dispatch(vm, vcpu.id(), io.is_in, io.port, io.bytes, &mut val)?;
				if io.is_in {
					update_register(vcpu, Reg::Rax, (val & mask) as u64, io.bytes)?;
				}
				Ok(())
			}
			ExitKind::InoutStr(vis) => self.emulate_string(vm, vcpu, &vis),
			kind => Err(VmmError::InvalidArgument(format!(
				"{kind:?} is not a port I/O exit"
			))),
		}
	}

	fn emulate_string(&self, vm: &Vm, vcpu: &mut VmxVcpu, vis: &InoutStrExit) -> Result<()> {
		let io = vis.inout;
		let prot = if io.is_in { Prot::Write } else { Prot::Read };
		let idxreg = if io.is_in { Reg::Rdi } else { Reg::Rsi };
		let mut index = vis.index;
		let mut count = vis.count & size2mask(vis.addrsize);
		let mut iterations = count.min(MAX_STRING_ITERATIONS);
		let mut failure = None;

		while iterations > 0 {
			let gla = match calculate_gla(
				vis.paging.cpu_mode,
				vis.seg,
				&vis.seg_desc,
				index,
				io.bytes,
				vis.addrsize,
				prot,
			) {
				Ok(gla) => gla,
				Err(VmmError::GuestFault(_)) => {
					vm.inject_gp(vcpu)?;
					break;
				}
				Err(err) => return Err(err),
			};
			let gpas = match translate(vm, vis, gla, io.bytes, prot) {
				Ok(gpas) => gpas,
				Err(VmmError::GuestFault(fault)) => {
					vm.inject_fault(vcpu, fault)?;
					break;
				}
				Err(err) => return Err(err),
			};
			if alignment_check(vis.paging.cpl, io.bytes, vis.cr0, vis.rflags, gla) {
				vm.inject_fault(vcpu, Fault::new(crate::consts::IDT_AC, Some(0)))?;
				break;
			}

			let mut buf = [0u8; 4];
			let data = &mut buf[..io.bytes as usize];
			if !io.is_in {
				copy_in(vm, &gpas, data)?;
			}
			let mut val = u32::from_le_bytes(buf);
			if let Err(err) = self.dispatch(vm, vcpu.id(), io.is_in, io.port, io.bytes, &mut val) {
				failure = Some(err);
				break;
			}
			if io.is_in {
				copy_out(vm, &gpas, &val.to_le_bytes()[..io.bytes as usize])?;
			}

			if vis.rflags & crate::consts::PSL_D != 0 {
				index = index.wrapping_sub(io.bytes as u64);
			} else {
				index = index.wrapping_add(io.bytes as u64);
			}
			count -= 1;
			iterations -= 1;
		}

		update_register(vcpu, idxreg, index, vis.addrsize)?;
		if io.rep {
			update_register(vcpu, Reg::Rcx, count, vis.addrsize)?;
		}
		if let Some(err) = failure {
			return Err(err);
		}
		if count != 0 {
			vm.restart_instruction(vcpu)?;
		}
		Ok(())
	}
}

/// Guest-physical pieces backing `len` bytes at `gla`, split at a page
/// boundary if needed.
fn translate(vm: &Vm, vis: &InoutStrExit, gla: u64, len: u8, prot: Prot) -> Result<Vec<(u64, usize)>> {
	let mut pieces = Vec::with_capacity(2);
	let mut gla = gla;
	let mut left = len as usize;
	while left > 0 {
		let in_page = PAGE_SIZE - (gla as usize & (PAGE_SIZE - 1));
		let n = in_page.min(left);
		let gpa = paging::gla2gpa(vm.mem(), &vis.paging, gla, prot)?;
		pieces.push((gpa, n));
		gla = gla.wrapping_add(n as u64);
		left -= n;
	}
	Ok(pieces)
}

fn copy_in(vm: &Vm, gpas: &[(u64, usize)], buf: &mut [u8]) -> Result<()> {
	let mut off = 0;
	for &(gpa, n) in gpas {
		vm.mem().read(gpa, &mut buf[off..off + n])?;
		off += n;
	}
	Ok(())
}

fn copy_out(vm: &Vm, gpas: &[(u64, usize)], buf: &[u8]) -> Result<()> {
	let mut off = 0;
	for &(gpa, n) in gpas {
		vm.mem().write(gpa, &buf[off..off + n])?;
		off += n;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Mutex,
		atomic::{AtomicU32, Ordering},
	};

	use super::*;
	use crate::vm::VmConfig;
	use crate::vmx::mock::MockBackend;

	fn vm(strictio: bool) -> Arc<Vm> {
		Vm::create(
			Arc::new(MockBackend::new()),
			VmConfig {
				strictio,
				..Default::default()
			},
		)
		.unwrap()
	}

	#[test]
	fn overlapping_ranges_conflict() {
		let ports = InoutPorts::new();
		let nop = handler(|_, _, _, _, _, _| Ok(()));
		ports.register("a", 0x100, 8, PortFlags::INOUT, nop.clone()).unwrap();
		assert!(matches!(
			ports.register("b", 0x104, 2, PortFlags::INOUT, nop.clone()),
			Err(VmmError::PortConflict { port: 0x104, len: 2 })
		));
		assert!(ports.register("c", 0xfc, 8, PortFlags::INOUT, nop.clone()).is_err());
		ports.register("d", 0x108, 1, PortFlags::INOUT, nop.clone()).unwrap();
		ports.register("e", 0xffff, 1, PortFlags::INOUT, nop.clone()).unwrap();
		assert!(ports.register("f", 0xfff0, 0x20, PortFlags::INOUT, nop).is_err());

		assert!(ports.unregister(0x100, 4).is_err());
		ports.unregister(0x100, 8).unwrap();
		assert!(!ports.is_registered(0x107));
		assert!(ports.is_registered(0x108));
	}

	#[test]
	fn unclaimed_ports() {
		let lax = vm(false);
		let mut val = 0;
		lax.inout().dispatch(&lax, 0, true, 0x7777, 2, &mut val).unwrap();
		assert_eq!(val, 0xffff);
		lax.inout().dispatch(&lax, 0, false, 0x7777, 1, &mut val).unwrap();

		let strict = vm(true);
		assert!(matches!(
			strict.inout().dispatch(&strict, 0, true, 0x7777, 1, &mut val),
			Err(VmmError::UnhandledPort { port: 0x7777, .. })
		));
	}

	#[test]
	fn direction_is_enforced() {
		let vm = vm(false);
		let last = Arc::new(AtomicU32::new(0));
		let l = last.clone();
		vm.inout()
			.register(
				"sink",
				0x500,
				1,
				PortFlags::OUT,
				handler(move |_, _, _, _, _, eax| {
					l.store(*eax, Ordering::SeqCst);
					Ok(())
				}),
			)
			.unwrap();
		let mut val = 0x5a;
		vm.inout().dispatch(&vm, 0, false, 0x500, 1, &mut val).unwrap();
		assert_eq!(last.load(Ordering::SeqCst), 0x5a);
		assert!(vm.inout().dispatch(&vm, 0, true, 0x500, 1, &mut val).is_err());
	}

	#[test]
	fn handler_sees_the_port() {
		let vm = vm(false);
		let seen = Arc::new(Mutex::new(Vec::new()));
		let s = seen.clone();
		vm.inout()
			.register(
				"window",
				0x600,
				4,
				PortFlags::INOUT,
				handler(move |_, _, is_in, port, bytes, eax| {
					s.lock().unwrap().push((is_in, port, bytes));
					*eax = port as u32;
					Ok(())
				}),
			)
			.unwrap();
		let mut val = 0;
		vm.inout().dispatch(&vm, 0, true, 0x603, 1, &mut val).unwrap();
		assert_eq!(val, 0x603);
		assert_eq!(*seen.lock().unwrap(), vec![(true, 0x603, 1)]);
	}
}
