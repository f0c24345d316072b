//! Split virtqueues in guest memory, legacy layout: descriptor table,
//! available ring and a page-aligned used ring behind one page frame number.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{VIRTIO_MSI_NO_VECTOR, VirtioError};
use crate::{
	consts::PAGE_SIZE,
	error::{Result, VmmError},
	mem::GuestMemory,
};

pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
pub const VRING_DESC_F_INDIRECT: u16 = 4;
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
const VRING_ALIGN: u64 = PAGE_SIZE as u64;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VringDescriptor {
	pub addr: u64,
	pub len: u32,
	pub flags: u16,
	pub next: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VringUsedElement {
	pub id: u32,
	pub len: u32,
}

/// One guest buffer of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
	pub addr: u64,
	pub len: u32,
	/// The device writes into it.
	pub writable: bool,
}

/// A descriptor chain taken off the available ring.
#[derive(Debug, Default)]
pub struct Chain {
	pub queue: u16,
	pub head: u16,
	pub bufs: Vec<Buffer>,
}

impl Chain {
	pub fn readable(&self) -> impl Iterator<Item = &Buffer> {
		self.bufs.iter().filter(|b| !b.writable)
	}

	pub fn writable(&self) -> impl Iterator<Item = &Buffer> {
		self.bufs.iter().filter(|b| b.writable)
	}

	/// Bytes in the readable part, saturating at `u32::MAX`.
	pub fn readable_len(&self) -> u32 {
		let total: u64 = self.readable().map(|b| b.len as u64).sum();
		total.min(u32::MAX as u64) as u32
	}

	/// Gathers the readable part, skipping the first `skip` bytes. Chains
	/// holding more than `max` bytes past the skip are refused before
	/// anything is copied.
	pub fn gather(&self, mem: &GuestMemory, skip: usize, max: usize) -> Result<Vec<u8>> {
		let mut total = 0usize;
		let mut left = skip;
		for buf in self.readable() {
			let len = buf.len as usize;
			mem.host_ptr(buf.addr, len)?;
			let take = len.saturating_sub(left);
			left = left.saturating_sub(len);
			total = total
				.checked_add(take)
				.filter(|total| *total <= max)
				.ok_or_else(|| VirtioError::BadChain {
					queue: self.queue,
					what: format!("chain at {} exceeds {max} bytes", self.head),
				})?;
		}

		let mut out = vec![0; total];
		let mut at = 0;
		let mut left = skip;
		for buf in self.readable() {
			let len = buf.len as usize;
			if left >= len {
				left -= len;
				continue;
			}
			let n = len - left;
			mem.read(buf.addr + left as u64, &mut out[at..at + n])?;
			at += n;
			left = 0;
		}
		Ok(out)
	}

	/// Copies `data` into the writable part and returns the bytes written.
	pub fn scatter(&self, mem: &GuestMemory, data: &[u8]) -> Result<usize> {
		let mut done = 0;
		for buf in self.writable() {
			if done == data.len() {
				break;
			}
			let n = (buf.len as usize).min(data.len() - done);
			mem.write(buf.addr, &data[done..done + n])?;
			done += n;
		}
		Ok(done)
	}
}

#[derive(Debug)]
pub struct Virtqueue {
	index: u16,
	size: u16,
	pfn: u32,
	desc: u64,
	avail: u64,
	used: u64,
	last_avail: u16,
	/// Next used index. Only ever written to the guest, never read back.
	used_idx: u16,
	/// Used index at the last interrupt decision.
	save_used: u16,
	indirect: bool,
	notify_on_empty: bool,
	pub msix_idx: u16,
}

impl Virtqueue {
	pub fn new(index: u16, size: u16) -> Self {
		Self {
			index,
			size,
			pfn: 0,
			desc: 0,
			avail: 0,
			used: 0,
			last_avail: 0,
			used_idx: 0,
			save_used: 0,
			indirect: false,
			notify_on_empty: false,
			msix_idx: VIRTIO_MSI_NO_VECTOR,
		}
	}

	pub fn size(&self) -> u16 {
		self.size
	}

	pub fn pfn(&self) -> u32 {
		self.pfn
	}

	pub fn ready(&self) -> bool {
		self.pfn != 0
	}

	pub fn reset(&mut self) {
		*self = Self::new(self.index, self.size);
	}

	pub(super) fn set_features(&mut self, indirect: bool, notify_on_empty: bool) {
		self.indirect = indirect;
		self.notify_on_empty = notify_on_empty;
	}

	/// Bytes covered by the three rings of a `size` entry queue.
	pub const fn ring_size(size: u16) -> u64 {
		let avail_end = 16 * size as u64 + 2 * (3 + size as u64);
		avail_end.next_multiple_of(VRING_ALIGN) + 6 + 8 * size as u64
	}

	/// Places the rings at page frame `pfn`. Zero takes the queue down.
	pub fn set_pfn(&mut self, mem: &GuestMemory, pfn: u32) -> Result<()> {
		if pfn == 0 {
			self.reset();
			return Ok(());
		}
		let base = (pfn as u64) << 12;
		let len = Self::ring_size(self.size);
		if mem.host_ptr(base, len as usize).is_err() {
			return Err(VirtioError::RingOutsideMemory { queue: self.index, gpa: base }.into());
		}
		self.pfn = pfn;
		self.desc = base;
		self.avail = base + 16 * self.size as u64;
		self.used = (self.avail + 2 * (3 + self.size as u64)).next_multiple_of(VRING_ALIGN);
		self.last_avail = 0;
		self.used_idx = 0;
		self.save_used = 0;
		debug!(
			"queue {}: {} entries, desc {:#x} avail {:#x} used {:#x}",
			self.index, self.size, self.desc, self.avail, self.used
		);
		Ok(())
	}

	fn avail_idx(&self, mem: &GuestMemory) -> Result<u16> {
		mem.load_u16_acquire(self.avail + 2)
	}

	pub fn used_idx(&self) -> u16 {
		self.used_idx
	}

	pub fn has_descs(&self, mem: &GuestMemory) -> Result<bool> {
		Ok(self.ready() && self.avail_idx(mem)? != self.last_avail)
	}

	/// Takes the next chain off the available ring, following indirect
	/// tables when they were negotiated.
	pub fn getchain(&mut self, mem: &GuestMemory) -> Result<Option<Chain>> {
		if !self.ready() {
			return Ok(None);
		}
		let idx = self.last_avail;
		let ndesc = self.avail_idx(mem)?.wrapping_sub(idx);
		if ndesc == 0 {
			return Ok(None);
		}
		if ndesc > self.size {
			return Err(self.bad(format!("{ndesc} available entries")));
		}
		let head = mem.read_u16(self.avail + 4 + 2 * (idx % self.size) as u64)?;
		self.last_avail = idx.wrapping_add(1);
		if head >= self.size {
			return Err(self.bad(format!("head {head} out of range")));
		}

		let mut chain = Chain {
			queue: self.index,
			head,
			bufs: Vec::new(),
		};
		let mut next = head;
		loop {
			if chain.bufs.len() >= self.size as usize {
				return Err(self.bad("descriptor loop".into()));
			}
			let desc: VringDescriptor = mem.read_obj(self.desc + 16 * next as u64)?;
			if desc.flags & VRING_DESC_F_INDIRECT != 0 {
				self.indirect_chain(mem, &desc, &mut chain)?;
			} else {
				chain.bufs.push(Buffer {
					addr: desc.addr,
					len: desc.len,
					writable: desc.flags & VRING_DESC_F_WRITE != 0,
				});
			}
			if desc.flags & VRING_DESC_F_NEXT == 0 {
				return Ok(Some(chain));
			}
			next = desc.next;
			if next >= self.size {
				return Err(self.bad(format!("next {next} out of range")));
			}
		}
	}

	fn indirect_chain(
		&self,
		mem: &GuestMemory,
		desc: &VringDescriptor,
		chain: &mut Chain,
	) -> Result<()> {
		if !self.indirect {
			return Err(self.bad("indirect descriptor without negotiation".into()));
		}
		let count = desc.len as usize / 16;
		if desc.len % 16 != 0 || count == 0 {
			return Err(self.bad(format!("indirect table of {} bytes", desc.len)));
		}
		let mut next = 0;
		for _ in 0..count {
			let d: VringDescriptor = mem.read_obj(desc.addr + 16 * next as u64)?;
			if d.flags & VRING_DESC_F_INDIRECT != 0 {
				return Err(self.bad("nested indirect descriptor".into()));
			}
			chain.bufs.push(Buffer {
				addr: d.addr,
				len: d.len,
				writable: d.flags & VRING_DESC_F_WRITE != 0,
			});
			if d.flags & VRING_DESC_F_NEXT == 0 {
				return Ok(());
			}
			next = d.next as usize;
			if next >= count {
				return Err(self.bad(format!("indirect next {next} out of range")));
			}
		}
		Err(self.bad("indirect descriptor loop".into()))
	}

	fn bad(&self, what: String) -> VmmError {
		VirtioError::BadChain {
			queue: self.index,
			what,
		}
		.into()
	}

	/// Puts the chains taken last back on the available ring.
	pub fn retchain(&mut self, count: u16) {
		self.last_avail = self.last_avail.wrapping_sub(count);
	}

	/// Publishes a finished chain. The element is visible before the index.
	pub fn relchain(&mut self, mem: &GuestMemory, head: u16, len: u32) -> Result<()> {
		let uidx = self.used_idx;
		let elem = VringUsedElement {
			id: head as u32,
			len,
		};
		mem.write_obj(self.used + 4 + 8 * (uidx % self.size) as u64, &elem)?;
		self.used_idx = uidx.wrapping_add(1);
		mem.store_u16_release(self.used + 2, self.used_idx)
	}

	/// Decides whether the guest gets an interrupt for the chains released
	/// since the last decision. `used_all_avail` marks a drained ring.
	pub fn endchains(&mut self, mem: &GuestMemory, used_all_avail: bool) -> Result<bool> {
		if !self.ready() {
			return Ok(false);
		}
		if used_all_avail && self.notify_on_empty {
			return Ok(true);
		}
		let old = self.save_used;
		let new = self.used_idx;
		self.save_used = new;
		let flags = mem.read_u16(self.avail)?;
		Ok(new != old && flags & VRING_AVAIL_F_NO_INTERRUPT == 0)
	}

	/// Asks the guest to stop or resume notifying the device.
	pub fn set_notify(&self, mem: &GuestMemory, enable: bool) -> Result<()> {
		if !self.ready() {
			return Ok(());
		}
		let flags = mem.read_u16(self.used)?;
		let flags = if enable {
			flags & !VRING_USED_F_NO_NOTIFY
		} else {
			flags | VRING_USED_F_NO_NOTIFY
		};
		mem.write_u16(self.used, flags)
	}
}
