//! Guest-physical ranges emulated in software: PCI BARs and anything else
//! that is neither RAM nor one of the APICs or the HPET.

use std::{
	collections::BTreeMap,
	fmt,
	sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
	error::{Result, VmmError},
	vm::Vm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioDir {
	Read,
	Write,
}

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MemFlags: u8 {
		const READ = 1 << 0;
		const WRITE = 1 << 1;
		const RW = Self::READ.bits() | Self::WRITE.bits();
		/// Cannot be unregistered.
		const IMMUTABLE = 1 << 2;
	}
}

/// `(vm, vcpu, dir, gpa, size, value)`. Reads store into `value`.
pub trait MmioHandler: Send + Sync {
	fn handle(&self, vm: &Vm, vcpu: usize, dir: MmioDir, gpa: u64, size: u8, value: &mut u64)
	-> Result<()>;
}

impl<F> MmioHandler for F
where
	F: Fn(&Vm, usize, MmioDir, u64, u8, &mut u64) -> Result<()> + Send + Sync,
{
	fn handle(
		&self,
		vm: &Vm,
		vcpu: usize,
		dir: MmioDir,
		gpa: u64,
		size: u8,
		value: &mut u64,
	) -> Result<()> {
		self(vm, vcpu, dir, gpa, size, value)
	}
}

pub fn handler<F>(f: F) -> Arc<dyn MmioHandler>
where
	F: Fn(&Vm, usize, MmioDir, u64, u8, &mut u64) -> Result<()> + Send + Sync + 'static,
{
	Arc::new(f)
}

struct Region {
	name: String,
	size: u64,
	flags: MemFlags,
	handler: Arc<dyn MmioHandler>,
}

impl fmt::Debug for Region {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Region")
			.field("name", &self.name)
			.field("size", &format_args!("{:#x}", self.size))
			.field("flags", &self.flags)
			.finish_non_exhaustive()
	}
}

type RegionMap = BTreeMap<u64, Region>;

#[derive(Debug, Default)]
struct Tables {
	regions: RegionMap,
	/// Consulted only when no regular region claims the address.
	fallback: RegionMap,
}

#[derive(Debug, Default)]
pub struct MmioRegions {
	tables: RwLock<Tables>,
}

fn find(map: &RegionMap, gpa: u64) -> Option<&Region> {
	let (&base, region) = map.range(..=gpa).next_back()?;
	(gpa - base < region.size).then_some(region)
}

fn overlaps(map: &RegionMap, base: u64, size: u64) -> bool {
	let last = base + (size - 1);
	map.range(..=last)
		.next_back()
		.is_some_and(|(&b, r)| b + (r.size - 1) >= base)
}

impl MmioRegions {
	pub fn new() -> Self {
		Self::default()
	}

	fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
		self.tables.read().unwrap_or_else(|err| err.into_inner())
	}

	fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
		self.tables.write().unwrap_or_else(|err| err.into_inner())
	}

	pub fn register(
		&self,
		name: impl Into<String>,
		base: u64,
		size: u64,
		flags: MemFlags,
		handler: Arc<dyn MmioHandler>,
	) -> Result<()> {
		self.insert(false, name.into(), base, size, flags, handler)
	}

	/// Registers a catch-all region, e.g. for unassigned parts of the PCI
	/// hole.
	pub fn register_fallback(
		&self,
		name: impl Into<String>,
		base: u64,
		size: u64,
		handler: Arc<dyn MmioHandler>,
	) -> Result<()> {
		self.insert(true, name.into(), base, size, MemFlags::RW, handler)
	}

	fn insert(
		&self,
		fallback: bool,
		name: String,
		base: u64,
		size: u64,
		flags: MemFlags,
		handler: Arc<dyn MmioHandler>,
	) -> Result<()> {
		if size == 0 || base.checked_add(size - 1).is_none() {
			return Err(VmmError::InvalidArgument(format!(
				"MMIO range {base:#x}+{size:#x}"
			)));
		}
		let mut tables = self.write_tables();
		let map = if fallback {
			&mut tables.fallback
		} else {
			&mut tables.regions
		};
		if overlaps(map, base, size) {
			return Err(VmmError::MmioConflict { base, len: size });
		}
		debug!("MMIO {base:#x}+{size:#x}: {name}");
		map.insert(
			base,
			Region {
				name,
				size,
				flags,
				handler,
			},
		);
		Ok(())
	}

	pub fn unregister(&self, base: u64, size: u64) -> Result<()> {
		let mut tables = self.write_tables();
		match tables.regions.get(&base) {
			Some(region) if region.size == size && !region.flags.contains(MemFlags::IMMUTABLE) => {
				trace!("MMIO {base:#x}+{size:#x}: {} removed", region.name);
				tables.regions.remove(&base);
				Ok(())
			}
			_ => Err(VmmError::InvalidArgument(format!(
				"MMIO range {base:#x}+{size:#x} cannot be unregistered"
			))),
		}
	}

	fn lookup(&self, gpa: u64) -> Option<(Arc<dyn MmioHandler>, MemFlags)> {
		let tables = self.read_tables();
		find(&tables.regions, gpa)
			.or_else(|| find(&tables.fallback, gpa))
			.map(|region| (region.handler.clone(), region.flags))
	}

	pub fn is_claimed(&self, gpa: u64) -> bool {
		self.lookup(gpa).is_some()
	}

	pub fn read(&self, vm: &Vm, vcpu: usize, gpa: u64, size: u8) -> Result<u64> {
		let (handler, flags) = self.lookup(gpa).ok_or(VmmError::UnhandledMmio(gpa))?;
		if !flags.contains(MemFlags::READ) {
			return Err(VmmError::UnhandledMmio(gpa));
		}
		let mut value = 0;
		handler.handle(vm, vcpu, MmioDir::Read, gpa, size, &mut value)?;
		Ok(value)
	}

	pub fn write(&self, vm: &Vm, vcpu: usize, gpa: u64, size: u8, value: u64) -> Result<()> {
		let (handler, flags) = self.lookup(gpa).ok_or(VmmError::UnhandledMmio(gpa))?;
		if !flags.contains(MemFlags::WRITE) {
			return Err(VmmError::UnhandledMmio(gpa));
		}
		let mut value = value;
		handler.handle(vm, vcpu, MmioDir::Write, gpa, size, &mut value)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::*;
	use crate::{vm::VmConfig, vmx::mock::MockBackend};

	fn vm() -> Arc<Vm> {
		Vm::create(Arc::new(MockBackend::new()), VmConfig::default()).unwrap()
	}

	fn register(map: &mut RegionMap, base: u64, size: u64) {
		map.insert(
			base,
			Region {
				name: String::new(),
				size,
				flags: MemFlags::RW,
				handler: handler(|_, _, _, _, _, _| Ok(())),
			},
		);
	}

	#[test]
	fn overlap_detection() {
		let mut map = RegionMap::new();
		register(&mut map, 0x1000, 0x1000);
		assert!(overlaps(&map, 0x1fff, 1));
		assert!(overlaps(&map, 0x800, 0x900));
		assert!(!overlaps(&map, 0x2000, 0x1000));
		assert!(!overlaps(&map, 0, 0x1000));
		register(&mut map, 0xffff_ffff_ffff_f000, 0x1000);
		assert!(find(&map, u64::MAX).is_some());
	}

	#[test]
	fn dispatch_and_fallback() {
		let vm = vm();
		let stored = Arc::new(AtomicU64::new(0));
		let s = stored.clone();
		vm.mmio()
			.register(
				"bar",
				0xc000_0000,
				0x100,
				MemFlags::RW,
				handler(move |_, _, dir, gpa, _, value| {
					match dir {
						MmioDir::Read => *value = gpa - 0xc000_0000,
						MmioDir::Write => s.store(*value, Ordering::SeqCst),
					}
					Ok(())
				}),
			)
			.unwrap();
		vm.mmio()
			.register_fallback(
				"hole",
				0xc000_0000,
				0x1000_0000,
				handler(|_, _, dir, _, _, value| {
					if dir == MmioDir::Read {
						*value = u64::MAX;
					}
					Ok(())
				}),
			)
			.unwrap();

		assert_eq!(vm.mmio().read(&vm, 0, 0xc000_0010, 4).unwrap(), 0x10);
		vm.mmio().write(&vm, 0, 0xc000_0020, 4, 0xabcd).unwrap();
		assert_eq!(stored.load(Ordering::SeqCst), 0xabcd);
		assert_eq!(vm.mmio().read(&vm, 0, 0xc000_1000, 4).unwrap(), u64::MAX);
		assert!(matches!(
			vm.mmio().read(&vm, 0, 0xe000_0000, 4),
			Err(VmmError::UnhandledMmio(0xe000_0000))
		));

		assert!(matches!(
			vm.mmio().register(
				"clash",
				0xc000_0080,
				0x100,
				MemFlags::RW,
				handler(|_, _, _, _, _, _| Ok(()))
			),
			Err(VmmError::MmioConflict { .. })
		));
		vm.mmio().unregister(0xc000_0000, 0x100).unwrap();
		assert_eq!(vm.mmio().read(&vm, 0, 0xc000_0010, 4).unwrap(), u64::MAX);
	}

	#[test]
	fn immutable_regions_stay() {
		let vm = vm();
		vm.mmio()
			.register(
				"fixed",
				0xd000_0000,
				0x10,
				MemFlags::READ | MemFlags::IMMUTABLE,
				handler(|_, _, _, _, _, _| Ok(())),
			)
			.unwrap();
		assert!(vm.mmio().unregister(0xd000_0000, 0x10).is_err());
		assert!(vm.mmio().write(&vm, 0, 0xd000_0000, 4, 1).is_err());
	}
}
