//! The VM container: guest memory, vCPU slots, lifecycle sets, suspend and
//! pause, plus the in-core device fabric.

mod rendezvous;
mod run;
mod vcpu;

use std::{
	fmt,
	sync::{
		Arc, Condvar, Mutex, OnceLock, Weak,
		atomic::{AtomicBool, AtomicU8, Ordering},
	},
};

pub use rendezvous::RendezvousFn;
pub(crate) use vcpu::{VcpuInner, VcpuSlot};
use uuid::Uuid;

use crate::{
	callout::Callouts,
	consts::*,
	cpuid::CpuidPolicy,
	cpuset::CpuSet,
	devices::{
		atpic::Atpic, atpit::Atpit, hpet::Hpet, ioapic::Ioapic, lapic::Lapic, pmtmr::Pmtmr,
		rtc::Rtc,
	},
	error::{LockExt, Result, VmmError},
	inout::InoutPorts,
	mem::{GuestMemory, MemSegment, SegmentKind},
	mmio::MmioRegions,
	pci::PciBus,
	vmx::{
		backend::{Backend, MemPerm},
		caps::VmxCaps,
	},
};

/// Why the VM stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SuspendHow {
	None = 0,
	Poweroff,
	Halt,
	Reset,
	TripleFault,
}

impl SuspendHow {
	fn from_u8(raw: u8) -> Self {
		match raw {
			1 => SuspendHow::Poweroff,
			2 => SuspendHow::Halt,
			3 => SuspendHow::Reset,
			4 => SuspendHow::TripleFault,
			_ => SuspendHow::None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VcpuState {
	Idle,
	Frozen,
	Running,
	Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum X2apicState {
	#[default]
	Disabled,
	Enabled,
}

/// VM-wide knobs derived from the command line.
#[derive(Debug, Clone)]
pub struct VmConfig {
	pub ncpus: usize,
	/// Exit on HLT instead of letting the guest spin.
	pub hlt_exit: bool,
	pub pause_exit: bool,
	/// Unregistered ports fail the run instead of reading all-ones.
	pub strictio: bool,
	/// Unknown MSRs raise #GP instead of being ignored.
	pub strictmsr: bool,
	pub x2apic: bool,
	pub rtc_localtime: bool,
	pub mptable: bool,
	pub acpi: bool,
	pub virtio_msix: bool,
	pub uuid: Option<Uuid>,
}

impl Default for VmConfig {
	fn default() -> Self {
		Self {
			ncpus: 1,
			hlt_exit: false,
			pause_exit: false,
			strictio: false,
			strictmsr: true,
			x2apic: false,
			rtc_localtime: true,
			mptable: true,
			acpi: false,
			virtio_msix: true,
			uuid: None,
		}
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CpuSets {
	pub active: CpuSet,
	pub suspended: CpuSet,
	pub halted: CpuSet,
}

pub struct Vm {
	me: Weak<Vm>,
	backend: Arc<dyn Backend>,
	pub(crate) caps: VmxCaps,
	pub(crate) cpuid: CpuidPolicy,
	config: VmConfig,
	mem: GuestMemory,
	pub(crate) vcpus: Box<[VcpuSlot]>,
	pub(crate) sets: Mutex<CpuSets>,
	suspend: AtomicU8,
	pub(crate) rendezvous: rendezvous::Rendezvous,
	paused: Mutex<bool>,
	pause_cv: Condvar,
	destroyed: AtomicBool,
	pub(crate) callouts: Callouts,
	pub(crate) lapics: Box<[Lapic]>,
	pub(crate) ioapic: Ioapic,
	pub(crate) hpet: Hpet,
	pub(crate) rtc: Rtc,
	pub(crate) atpic: Atpic,
	pub(crate) atpit: Atpit,
	pub(crate) pmtmr: Pmtmr,
	pub(crate) inout: InoutPorts,
	pub(crate) mmio: MmioRegions,
	pci: PciBus,
	bootrom: OnceLock<(u64, u64)>,
}

impl fmt::Debug for Vm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Vm")
			.field("config", &self.config)
			.field("sets", &*self.sets.locked())
			.field("suspend", &self.suspend_state())
			.finish_non_exhaustive()
	}
}

impl Vm {
	/// Creates the VM and its in-core devices. Control capabilities are
	/// negotiated here once and kept for every vCPU.
	pub fn create(backend: Arc<dyn Backend>, config: VmConfig) -> Result<Arc<Vm>> {
		Self::create_with_cpuid(backend, config, CpuidPolicy::native())
	}

	/// Like [`Vm::create`] with an explicit CPUID source.
	pub fn create_with_cpuid(
		backend: Arc<dyn Backend>,
		config: VmConfig,
		cpuid: CpuidPolicy,
	) -> Result<Arc<Vm>> {
		if config.ncpus == 0 || config.ncpus > VM_MAXCPU {
			return Err(VmmError::InvalidVcpu(config.ncpus));
		}
		let caps = VmxCaps::negotiate(backend.as_ref())?;
		let callouts = Callouts::start()?;
		let ncpus = config.ncpus;

		let vm = Arc::new_cyclic(|me: &Weak<Vm>| {
			let lapics = (0..ncpus)
				.map(|id| Lapic::new(id, me, &callouts))
				.collect();
			let hpet = Hpet::new(me, &callouts);
			let rtc = Rtc::new(me, &callouts, config.rtc_localtime);
			let atpit = Atpit::new(me, &callouts);
			Vm {
				me: me.clone(),
				backend,
				caps,
				cpuid,
				mem: GuestMemory::new(),
				vcpus: (0..ncpus).map(|_| VcpuSlot::default()).collect(),
				sets: Mutex::new(CpuSets::default()),
				suspend: AtomicU8::new(SuspendHow::None as u8),
				rendezvous: rendezvous::Rendezvous::default(),
				paused: Mutex::new(false),
				pause_cv: Condvar::new(),
				destroyed: AtomicBool::new(false),
				callouts,
				lapics,
				ioapic: Ioapic::new(),
				hpet,
				rtc,
				atpic: Atpic::new(),
				atpit,
				pmtmr: Pmtmr::new(),
				inout: InoutPorts::new(),
				mmio: MmioRegions::new(),
				pci: PciBus::new(),
				bootrom: OnceLock::new(),
				config,
			}
		});
		vm.register_incore_ports()?;
		info!("created VM with {ncpus} vCPU(s)");
		Ok(vm)
	}

	fn register_incore_ports(&self) -> Result<()> {
		crate::devices::atpic::register_ports(self)?;
		crate::devices::atpit::register_ports(self)?;
		crate::devices::pmtmr::register_ports(self)?;
		crate::devices::rtc::register_ports(self)?;
		crate::pci::register_ports(self)?;
		Ok(())
	}

	/// Strong reference to this VM, for handing to worker threads.
	pub fn arc(&self) -> Option<Arc<Vm>> {
		self.me.upgrade()
	}

	pub fn weak(&self) -> Weak<Vm> {
		self.me.clone()
	}

	pub fn config(&self) -> &VmConfig {
		&self.config
	}

	pub fn ncpus(&self) -> usize {
		self.config.ncpus
	}

	pub fn mem(&self) -> &GuestMemory {
		&self.mem
	}

	pub(crate) fn backend(&self) -> &dyn Backend {
		self.backend.as_ref()
	}

	pub fn inout(&self) -> &InoutPorts {
		&self.inout
	}

	pub fn mmio(&self) -> &MmioRegions {
		&self.mmio
	}

	pub fn pci(&self) -> &PciBus {
		&self.pci
	}

	pub fn ioapic(&self) -> &Ioapic {
		&self.ioapic
	}

	pub fn hpet(&self) -> &Hpet {
		&self.hpet
	}

	pub fn rtc(&self) -> &Rtc {
		&self.rtc
	}

	pub fn atpic(&self) -> &Atpic {
		&self.atpic
	}

	pub fn atpit(&self) -> &Atpit {
		&self.atpit
	}

	pub fn pmtmr(&self) -> &Pmtmr {
		&self.pmtmr
	}

	pub fn lapic(&self, vcpu: usize) -> Result<&Lapic> {
		self.lapics.get(vcpu).ok_or(VmmError::InvalidVcpu(vcpu))
	}

	pub fn cpuid(&self) -> &CpuidPolicy {
		&self.cpuid
	}

	pub fn callouts(&self) -> &Callouts {
		&self.callouts
	}

	pub(crate) fn slot(&self, vcpu: usize) -> Result<&VcpuSlot> {
		self.vcpus.get(vcpu).ok_or(VmmError::InvalidVcpu(vcpu))
	}

	/// Installs a memory segment and maps it into the guest.
	pub fn add_memory(&self, gpa: u64, len: usize, kind: SegmentKind) -> Result<&MemSegment> {
		let seg = self.mem.add(gpa, len, kind)?;
		let perm = match kind {
			SegmentKind::Ram => MemPerm::ReadWriteExec,
			SegmentKind::Rom => MemPerm::ReadExec,
		};
		self.backend.map(seg.host_start(), gpa, len, perm)?;
		debug!("mapped {kind:?} segment {gpa:#x}+{len:#x}");
		Ok(seg)
	}

	/// Splits `size` bytes of RAM between low memory and the range above 4 GiB.
	pub fn setup_memory(&self, size: u64) -> Result<()> {
		let lowmem = size.min(LOWMEM_LIMIT);
		let highmem = size - lowmem;
		if lowmem > 0 {
			self.add_memory(0, lowmem as usize, SegmentKind::Ram)?;
		}
		if highmem > 0 {
			self.add_memory(HIGHMEM_BASE, highmem as usize, SegmentKind::Ram)?;
		}
		Ok(())
	}

	/// Places a ROM image so that it ends at 4 GiB.
	pub fn setup_bootrom(&self, image: &[u8]) -> Result<u64> {
		let len = image.len();
		let gpa = HIGHMEM_BASE - len as u64;
		let seg = self.add_memory(gpa, len, SegmentKind::Rom)?;
		// SAFETY: the segment was just installed and nothing else references it yet.
		unsafe { seg.as_slice_mut() }.copy_from_slice(image);
		self.bootrom
			.set((gpa, len as u64))
			.map_err(|_| VmmError::InvalidArgument("boot ROM already installed".into()))?;
		Ok(gpa)
	}

	pub fn bootrom(&self) -> Option<(u64, u64)> {
		self.bootrom.get().copied()
	}

	pub fn activate_cpu(&self, vcpu: usize) -> Result<()> {
		self.slot(vcpu)?;
		let mut sets = self.sets.locked();
		if sets.active.contains(vcpu) {
			return Err(VmmError::Busy(vcpu));
		}
		sets.active.insert(vcpu);
		debug!("vCPU {vcpu} activated");
		Ok(())
	}

	pub fn active_cpus(&self) -> CpuSet {
		self.sets.locked().active
	}

	pub fn suspended_cpus(&self) -> CpuSet {
		self.sets.locked().suspended
	}

	pub fn halted_cpus(&self) -> CpuSet {
		self.sets.locked().halted
	}

	pub fn suspend_state(&self) -> SuspendHow {
		SuspendHow::from_u8(self.suspend.load(Ordering::Acquire))
	}

	pub fn is_suspended(&self) -> bool {
		self.suspend_state() != SuspendHow::None
	}

	/// Atomically installs `how` and wakes every active vCPU.
	pub fn suspend(&self, how: SuspendHow) -> Result<()> {
		if how == SuspendHow::None {
			return Err(VmmError::InvalidArgument("cannot suspend with reason None".into()));
		}
		if let Err(current) = self.suspend.compare_exchange(
			SuspendHow::None as u8,
			how as u8,
			Ordering::AcqRel,
			Ordering::Acquire,
		) {
			debug!(
				"VM already suspended ({:?}), ignoring {how:?}",
				SuspendHow::from_u8(current)
			);
			return Err(VmmError::AlreadySuspended);
		}
		info!("VM suspended: {how:?}");
		for vcpu in self.active_cpus().iter() {
			self.notify_event(vcpu, false);
		}
		Ok(())
	}

	/// Returns every device to its reset state. Only legal once every active
	/// vCPU has parked in the suspended set.
	pub fn reinit(&self) -> Result<()> {
		{
			let sets = self.sets.locked();
			if sets.suspended != sets.active {
				return Err(VmmError::NotSuspended);
			}
		}
		for (id, slot) in self.vcpus.iter().enumerate() {
			slot.reset();
			self.lapics[id].reset(self);
		}
		self.ioapic.reset();
		self.hpet.reset(self);
		self.atpic.reset();
		self.atpit.reset(self);
		self.pmtmr.reset();
		self.rtc.reset(self);
		*self.sets.locked() = CpuSets::default();
		self.suspend.store(SuspendHow::None as u8, Ordering::Release);
		info!("VM reinitialised");
		Ok(())
	}

	/// Pauses or resumes the guest. While paused, guest memory is read-only
	/// and every vCPU parks before its next entry.
	pub fn pause(&self, pause: bool) -> Result<()> {
		let mut paused = self.paused.locked();
		if *paused == pause {
			debug!("pause({pause}) is a no-op");
			return Ok(());
		}
		let perm = if pause {
			MemPerm::ReadExec
		} else {
			MemPerm::ReadWriteExec
		};
		for seg in self.mem.iter().filter(|s| s.kind() == SegmentKind::Ram) {
			self.backend.protect(seg.gpa(), seg.len(), perm)?;
		}
		self.mem.set_protected(pause);
		self.hpet.pause(self, pause);
		*paused = pause;
		if pause {
			info!("VM paused");
			drop(paused);
			for vcpu in self.active_cpus().iter() {
				self.notify_event(vcpu, false);
			}
		} else {
			info!("VM resumed");
			self.pause_cv.notify_all();
		}
		Ok(())
	}

	pub fn is_paused(&self) -> bool {
		*self.paused.locked()
	}

	/// Parks the calling vCPU thread while the VM is paused.
	pub(crate) fn pause_gate(&self, vcpu: usize) {
		let mut paused = self.paused.locked();
		if *paused {
			debug!("vCPU {vcpu} parked for pause");
		}
		while *paused && !self.destroyed.load(Ordering::Acquire) {
			paused = crate::error::wait(&self.pause_cv, paused);
		}
	}

	/// Tears down timers and releases every parked thread.
	pub fn destroy(&self) {
		if self.destroyed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.callouts.shutdown();
		self.pause_cv.notify_all();
		for vcpu in 0..self.vcpus.len() {
			self.notify_event(vcpu, false);
		}
		info!("VM destroyed");
	}

	pub fn is_destroyed(&self) -> bool {
		self.destroyed.load(Ordering::Acquire)
	}
}

impl Drop for Vm {
	fn drop(&mut self) {
		self.destroyed.store(true, Ordering::Release);
		self.callouts.shutdown();
	}
}
