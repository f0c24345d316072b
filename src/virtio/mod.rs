//! Legacy (0.9.5) virtio over PCI: the register block in BAR 0, MSI-X in
//! BAR 1 and the interrupt plumbing shared by every device model.

pub mod net;
pub mod queue;

use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use thiserror::Error;
use virtio_bindings::bindings::{virtio_config, virtio_ring};

use self::queue::Virtqueue;
use crate::{
	emulate::size2mask,
	error::{LockExt, Result},
	pci::{BarType, PciDevice, PciFunction},
	vm::Vm,
};

pub const VIRTIO_VENDOR_ID: u16 = 0x1af4;
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

pub const VIRTIO_F_NOTIFY_ON_EMPTY: u32 = 1 << virtio_config::VIRTIO_F_NOTIFY_ON_EMPTY;
pub const VIRTIO_RING_F_INDIRECT_DESC: u32 = 1 << virtio_ring::VIRTIO_RING_F_INDIRECT_DESC;

/// Legacy register offsets in the I/O BAR.
pub mod regs {
	pub const HOST_FEATURES: u64 = 0x00;
	pub const GUEST_FEATURES: u64 = 0x04;
	pub const QUEUE_PFN: u64 = 0x08;
	pub const QUEUE_NUM: u64 = 0x0c;
	pub const QUEUE_SEL: u64 = 0x0e;
	pub const QUEUE_NOTIFY: u64 = 0x10;
	pub const STATUS: u64 = 0x12;
	pub const ISR: u64 = 0x13;
	pub const CONFIG_VECTOR: u64 = 0x14;
	pub const QUEUE_VECTOR: u64 = 0x16;
	/// Device config without MSI-X.
	pub const CFG0: u64 = 0x14;
	/// Device config with MSI-X enabled.
	pub const CFG1: u64 = 0x18;
}

pub const ISR_QUEUES: u8 = 0x1;
pub const ISR_CONF_CHANGED: u8 = 0x2;

#[derive(Error, Debug)]
pub enum VirtioError {
	#[error("queue {queue}: ring at {gpa:#x} is not backed by guest memory")]
	RingOutsideMemory { queue: u16, gpa: u64 },
	#[error("queue {queue}: malformed descriptor chain: {what}")]
	BadChain { queue: u16, what: String },
	#[error("{0}: queue {1} does not exist")]
	NoSuchQueue(&'static str, u16),
	#[error("invalid device option: {0}")]
	InvalidOption(String),
}

/// Device status. See section 2.1 of the virtio specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus(u8);

bitflags! {
	impl DeviceStatus: u8 {
		/// The guest has found the device.
		const ACKNOWLEDGE = 1;
		/// The guest knows how to drive the device.
		const DRIVER = 2;
		const DRIVER_OK = 4;
		const FEATURES_OK = 8;
		const DEVICE_NEEDS_RESET = 64;
		const FAILED = 128;
	}
}

/// Hooks of a concrete device behind the legacy transport.
pub trait VirtioDevice: Send + Sync {
	fn name(&self) -> &'static str;

	/// Feature bits offered to the guest.
	fn host_features(&self) -> u32;

	/// Length of the device config block.
	fn cfg_size(&self) -> u64;

	fn cfg_read(&self, offset: u64, size: u8) -> u32;

	fn cfg_write(&self, offset: u64, size: u8, value: u32);

	/// The guest kicked `queue`.
	fn notify(&self, vm: &Vm, transport: &Transport, queue: u16) -> Result<()>;

	/// Called with the negotiated subset after every features write.
	fn negotiated(&self, _features: u32) {}

	/// Quiesces the device after the guest wrote status 0. The transport
	/// resets its own state afterwards.
	fn reset(&self) {}
}

#[derive(Debug)]
struct Regs {
	status: DeviceStatus,
	negotiated: u32,
	curq: u16,
	isr: u8,
	msix_cfg_vector: u16,
}

impl Default for Regs {
	fn default() -> Self {
		Self {
			status: DeviceStatus::empty(),
			negotiated: 0,
			curq: 0,
			isr: 0,
			msix_cfg_vector: VIRTIO_MSI_NO_VECTOR,
		}
	}
}

/// Queue and register state of one virtio function.
#[derive(Debug)]
pub struct Transport {
	name: &'static str,
	pi: Arc<PciFunction>,
	regs: Mutex<Regs>,
	queues: Box<[Mutex<Virtqueue>]>,
}

impl Transport {
	/// Requests INTx, adds the MSI capability and, unless `msix` is off,
	/// MSI-X with one vector per queue plus one for config changes.
	pub fn new(
		vm: &Vm,
		pi: Arc<PciFunction>,
		name: &'static str,
		qsizes: &[u16],
		cfg_size: u64,
	) -> Result<Self> {
		let nvq = qsizes.len() as u16;
		if vm.config().virtio_msix {
			pi.add_msixcap(vm, nvq + 1, 1)?;
		}
		pi.add_msicap(1)?;
		pi.lintr_request(vm);
		pi.alloc_bar(vm, 0, BarType::Io, regs::CFG1 + cfg_size)?;
		Ok(Self {
			name,
			pi,
			regs: Mutex::new(Regs::default()),
			queues: qsizes
				.iter()
				.enumerate()
				.map(|(i, &size)| Mutex::new(Virtqueue::new(i as u16, size)))
				.collect(),
		})
	}

	pub fn pci(&self) -> &Arc<PciFunction> {
		&self.pi
	}

	pub fn queue(&self, idx: u16) -> Result<MutexGuard<'_, Virtqueue>> {
		self.queues
			.get(idx as usize)
			.map(|q| q.locked())
			.ok_or_else(|| VirtioError::NoSuchQueue(self.name, idx).into())
	}

	pub fn status(&self) -> DeviceStatus {
		self.regs.locked().status
	}

	pub fn negotiated(&self) -> u32 {
		self.regs.locked().negotiated
	}

	fn cfg_base(&self) -> u64 {
		if self.pi.msix_enabled() {
			regs::CFG1
		} else {
			regs::CFG0
		}
	}

	/// A register read in BAR 0.
	pub fn read(&self, vm: &Vm, dev: &dyn VirtioDevice, offset: u64, size: u8) -> Result<u64> {
		let cfg = self.cfg_base();
		if offset >= cfg {
			let off = offset - cfg;
			if off + size as u64 > dev.cfg_size() {
				warn!("{}: config read {off:#x}+{size} out of range", self.name);
				return Ok(size2mask(size));
			}
			return Ok(dev.cfg_read(off, size) as u64);
		}
		let Some(width) = reg_width(offset) else {
			warn!("{}: read of unknown register {offset:#x}", self.name);
			return Ok(size2mask(size));
		};
		if width != size {
			warn!("{}: {size} byte read of register {offset:#x}", self.name);
			return Ok(size2mask(size));
		}

		let mut regs = self.regs.locked();
		let curq = self.queues.get(regs.curq as usize);
		let value = match offset {
			regs::HOST_FEATURES => dev.host_features() as u64,
			regs::GUEST_FEATURES => regs.negotiated as u64,
			regs::QUEUE_PFN => curq.map_or(0, |q| q.locked().pfn() as u64),
			regs::QUEUE_NUM => curq.map_or(0, |q| q.locked().size() as u64),
			regs::QUEUE_SEL => regs.curq as u64,
			regs::QUEUE_NOTIFY => 0,
			regs::STATUS => regs.status.bits() as u64,
			regs::ISR => {
				let isr = regs.isr;
				regs.isr = 0;
				if isr != 0 {
					self.pi.lintr_deassert(vm)?;
				}
				isr as u64
			}
			regs::CONFIG_VECTOR => regs.msix_cfg_vector as u64,
			_ => curq.map_or(VIRTIO_MSI_NO_VECTOR, |q| q.locked().msix_idx) as u64,
		};
		Ok(value)
	}

	/// A register write in BAR 0.
	pub fn write(
		&self,
		vm: &Vm,
		dev: &dyn VirtioDevice,
		offset: u64,
		size: u8,
		value: u64,
	) -> Result<()> {
		let cfg = self.cfg_base();
		if offset >= cfg {
			let off = offset - cfg;
			if off + size as u64 > dev.cfg_size() {
				warn!("{}: config write {off:#x}+{size} out of range", self.name);
			} else {
				dev.cfg_write(off, size, value as u32);
			}
			return Ok(());
		}
		let Some(width) = reg_width(offset) else {
			warn!("{}: write of unknown register {offset:#x}", self.name);
			return Ok(());
		};
		if width != size {
			warn!("{}: {size} byte write of register {offset:#x}", self.name);
			return Ok(());
		}

		match offset {
			regs::GUEST_FEATURES => {
				let features = value as u32 & dev.host_features();
				self.regs.locked().negotiated = features;
				for queue in self.queues.iter() {
					queue.locked().set_features(
						features & VIRTIO_RING_F_INDIRECT_DESC != 0,
						features & VIRTIO_F_NOTIFY_ON_EMPTY != 0,
					);
				}
				dev.negotiated(features);
			}
			regs::QUEUE_PFN => {
				let (curq, features) = {
					let regs = self.regs.locked();
					(regs.curq, regs.negotiated)
				};
				let mut queue = self.queue(curq)?;
				queue.set_pfn(vm.mem(), value as u32)?;
				queue.set_features(
					features & VIRTIO_RING_F_INDIRECT_DESC != 0,
					features & VIRTIO_F_NOTIFY_ON_EMPTY != 0,
				);
			}
			// Out-of-range selections read back as absent queues.
			regs::QUEUE_SEL => self.regs.locked().curq = value as u16,
			regs::QUEUE_NOTIFY => {
				let idx = value as u16;
				if idx as usize >= self.queues.len() {
					warn!("{}: notify of missing queue {idx}", self.name);
					return Ok(());
				}
				dev.notify(vm, self, idx)?;
			}
			regs::STATUS => {
				let status = DeviceStatus::from_bits_retain(value as u8);
				debug!("{}: status {status:?}", self.name);
				if status.is_empty() {
					dev.reset();
					self.reset(vm)?;
				} else {
					self.regs.locked().status = status;
				}
			}
			regs::CONFIG_VECTOR => self.regs.locked().msix_cfg_vector = value as u16,
			regs::QUEUE_VECTOR => {
				let curq = self.regs.locked().curq;
				self.queue(curq)?.msix_idx = value as u16;
			}
			_ => warn!("{}: write to read-only register {offset:#x}", self.name),
		}
		Ok(())
	}

	/// Back to the power-on state, with the line deasserted.
	pub fn reset(&self, vm: &Vm) -> Result<()> {
		debug!("{}: device reset", self.name);
		for queue in self.queues.iter() {
			queue.locked().reset();
		}
		let mut regs = self.regs.locked();
		*regs = Regs::default();
		self.pi.lintr_deassert(vm)
	}

	/// Interrupts the guest for `queue`, through MSI-X when enabled.
	pub fn interrupt(&self, vm: &Vm, queue: u16) -> Result<()> {
		if self.pi.msix_enabled() {
			let vector = self.queue(queue)?.msix_idx;
			if vector == VIRTIO_MSI_NO_VECTOR {
				return Ok(());
			}
			return self.pi.generate_msix(vm, vector as usize);
		}
		let mut regs = self.regs.locked();
		regs.isr |= ISR_QUEUES;
		if self.pi.msi_enabled() {
			return self.pi.generate_msi(vm, 0);
		}
		self.pi.lintr_assert(vm)
	}

	/// Signals a device config change.
	pub fn config_changed(&self, vm: &Vm) -> Result<()> {
		if self.pi.msix_enabled() {
			let vector = self.regs.locked().msix_cfg_vector;
			if vector == VIRTIO_MSI_NO_VECTOR {
				return Ok(());
			}
			return self.pi.generate_msix(vm, vector as usize);
		}
		let mut regs = self.regs.locked();
		regs.isr |= ISR_CONF_CHANGED;
		if self.pi.msi_enabled() {
			return self.pi.generate_msi(vm, 0);
		}
		self.pi.lintr_assert(vm)
	}

	/// Releases the chains of `queue` processed since the last call and
	/// interrupts the guest if it asked for it.
	pub fn endchains(&self, vm: &Vm, queue: u16, used_all_avail: bool) -> Result<()> {
		let intr = self.queue(queue)?.endchains(vm.mem(), used_all_avail)?;
		if intr {
			self.interrupt(vm, queue)?;
		}
		Ok(())
	}
}

fn reg_width(offset: u64) -> Option<u8> {
	match offset {
		regs::HOST_FEATURES | regs::GUEST_FEATURES | regs::QUEUE_PFN => Some(4),
		regs::QUEUE_NUM
		| regs::QUEUE_SEL
		| regs::QUEUE_NOTIFY
		| regs::CONFIG_VECTOR
		| regs::QUEUE_VECTOR => Some(2),
		regs::STATUS | regs::ISR => Some(1),
		_ => None,
	}
}

/// A virtio device model on the PCI bus.
pub struct VirtioPci<D: VirtioDevice> {
	transport: Arc<Transport>,
	dev: Arc<D>,
}

impl<D: VirtioDevice> VirtioPci<D> {
	pub fn new(transport: Arc<Transport>, dev: Arc<D>) -> Self {
		Self { transport, dev }
	}

	pub fn device(&self) -> &Arc<D> {
		&self.dev
	}

	pub fn transport(&self) -> &Arc<Transport> {
		&self.transport
	}
}

impl<D: VirtioDevice> PciDevice for VirtioPci<D> {
	fn name(&self) -> &'static str {
		self.dev.name()
	}

	fn bar_read(
		&self,
		vm: &Vm,
		_vcpu: usize,
		_pi: &PciFunction,
		bar: usize,
		offset: u64,
		size: u8,
	) -> Result<u64> {
		if bar != 0 {
			return Ok(size2mask(size));
		}
		self.transport.read(vm, self.dev.as_ref(), offset, size)
	}

	fn bar_write(
		&self,
		vm: &Vm,
		_vcpu: usize,
		_pi: &PciFunction,
		bar: usize,
		offset: u64,
		size: u8,
		value: u64,
	) -> Result<()> {
		if bar != 0 {
			return Ok(());
		}
		self.transport
			.write(vm, self.dev.as_ref(), offset, size, value)
	}
}
