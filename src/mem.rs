//! Guest physical memory.
//!
//! Segments are anonymous host mappings installed once and never moved, so a
//! lookup only has to scan a handful of immutable descriptors and never takes a
//! lock.

use std::{
	ffi::c_void,
	mem::size_of,
	num::NonZeroUsize,
	ptr::{self, NonNull},
	sync::{
		Mutex, OnceLock,
		atomic::{AtomicBool, AtomicU16, Ordering},
	},
};

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::{
	consts::{HIGHMEM_BASE, MAX_MEM_SEGMENTS, PAGE_SIZE},
	error::{LockExt, Result, VmmError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
	Ram,
	/// Boot ROM, executed in place below 4 GiB.
	Rom,
}

#[derive(Debug)]
pub struct MemSegment {
	gpa: u64,
	len: usize,
	host: NonNull<u8>,
	kind: SegmentKind,
}

// The mapping is owned by the segment and only accessed through raw copies.
unsafe impl Send for MemSegment {}
unsafe impl Sync for MemSegment {}

impl MemSegment {
	fn allocate(gpa: u64, len: usize, kind: SegmentKind) -> Result<Self> {
		let length = NonZeroUsize::new(len).ok_or(VmmError::InvalidSegment { gpa, len })?;
		let host = unsafe {
			mmap_anonymous(
				None,
				length,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_PRIVATE,
			)
		}
		.map_err(VmmError::OutOfMemory)?;
		Ok(Self {
			gpa,
			len,
			host: host.cast(),
			kind,
		})
	}

	pub fn gpa(&self) -> u64 {
		self.gpa
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn kind(&self) -> SegmentKind {
		self.kind
	}

	pub fn host_start(&self) -> *mut u8 {
		self.host.as_ptr()
	}

	pub fn contains(&self, gpa: u64) -> bool {
		gpa >= self.gpa && gpa - self.gpa < self.len as u64
	}

	fn overlaps(&self, gpa: u64, len: usize) -> bool {
		gpa < self.gpa + self.len as u64 && self.gpa < gpa + len as u64
	}

	/// # Safety
	///
	/// The guest and other vCPUs may write this memory concurrently. The
	/// slice must not outlive the segment.
	#[expect(clippy::mut_from_ref)]
	pub unsafe fn as_slice_mut(&self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.host.as_ptr(), self.len) }
	}
}

impl Drop for MemSegment {
	fn drop(&mut self) {
		if let Err(e) = unsafe { munmap(self.host.cast::<c_void>(), self.len) } {
			warn!("unable to unmap guest segment at {:#x}: {e}", self.gpa);
		}
	}
}

pub struct GuestMemory {
	segments: [OnceLock<MemSegment>; MAX_MEM_SEGMENTS],
	install: Mutex<usize>,
	protected: AtomicBool,
}

impl Default for GuestMemory {
	fn default() -> Self {
		Self::new()
	}
}

impl GuestMemory {
	pub fn new() -> Self {
		Self {
			segments: Default::default(),
			install: Mutex::new(0),
			protected: AtomicBool::new(false),
		}
	}

	/// Allocates and installs a new zeroed segment.
	pub fn add(&self, gpa: u64, len: usize, kind: SegmentKind) -> Result<&MemSegment> {
		if len == 0 || gpa as usize % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
			return Err(VmmError::InvalidSegment { gpa, len });
		}
		if gpa.checked_add(len as u64).is_none() {
			return Err(VmmError::InvalidSegment { gpa, len });
		}

		let mut count = self.install.locked();
		if *count >= MAX_MEM_SEGMENTS {
			return Err(VmmError::TooManySegments);
		}
		if self.iter().any(|seg| seg.overlaps(gpa, len)) {
			return Err(VmmError::SegmentOverlap { gpa, len });
		}

		let segment = MemSegment::allocate(gpa, len, kind)?;
		debug!(
			"Installing {kind:?} segment {gpa:#x}..{:#x} at host {:p}",
			gpa + len as u64,
			segment.host_start()
		);
		let slot = &self.segments[*count];
		if slot.set(segment).is_err() {
			return Err(VmmError::TooManySegments);
		}
		*count += 1;
		slot.get().ok_or(VmmError::TooManySegments)
	}

	pub fn iter(&self) -> impl Iterator<Item = &MemSegment> {
		self.segments.iter().map_while(|s| s.get())
	}

	pub fn segment(&self, gpa: u64) -> Option<&MemSegment> {
		self.iter().find(|seg| seg.contains(gpa))
	}

	pub fn is_ram(&self, gpa: u64) -> bool {
		self.segment(gpa).is_some()
	}

	/// Bytes of RAM below the 4 GiB boundary.
	pub fn lowmem_size(&self) -> u64 {
		self.iter()
			.filter(|s| s.kind == SegmentKind::Ram && s.gpa < HIGHMEM_BASE)
			.map(|s| s.len as u64)
			.sum()
	}

	/// Bytes of RAM above the 4 GiB boundary.
	pub fn highmem_size(&self) -> u64 {
		self.iter()
			.filter(|s| s.kind == SegmentKind::Ram && s.gpa >= HIGHMEM_BASE)
			.map(|s| s.len as u64)
			.sum()
	}

	/// Resolves `[gpa, gpa + len)` to a host pointer. The range must sit in a
	/// single segment.
	pub fn host_ptr(&self, gpa: u64, len: usize) -> Result<*mut u8> {
		let seg = self
			.segment(gpa)
			.ok_or(VmmError::Unmapped { gpa, len })?;
		let offset = (gpa - seg.gpa) as usize;
		if len > seg.len - offset {
			return Err(VmmError::Unmapped { gpa, len });
		}
		Ok(unsafe { seg.host.as_ptr().add(offset) })
	}

	pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
		let src = self.host_ptr(gpa, buf.len())?;
		unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
		Ok(())
	}

	pub fn write(&self, gpa: u64, data: &[u8]) -> Result<()> {
		let dst = self.host_ptr(gpa, data.len())?;
		unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
		Ok(())
	}

	pub fn fill(&self, gpa: u64, len: usize, byte: u8) -> Result<()> {
		let dst = self.host_ptr(gpa, len)?;
		unsafe { ptr::write_bytes(dst, byte, len) };
		Ok(())
	}

	pub fn read_obj<T: FromBytes>(&self, gpa: u64) -> Result<T> {
		let src = self.host_ptr(gpa, size_of::<T>())?;
		let bytes = unsafe { std::slice::from_raw_parts(src, size_of::<T>()) };
		T::read_from_bytes(bytes).map_err(|_| VmmError::Unmapped {
			gpa,
			len: size_of::<T>(),
		})
	}

	pub fn write_obj<T: IntoBytes + Immutable>(&self, gpa: u64, obj: &T) -> Result<()> {
		self.write(gpa, obj.as_bytes())
	}

	pub fn read_u8(&self, gpa: u64) -> Result<u8> {
		self.read_obj(gpa)
	}

	pub fn read_u16(&self, gpa: u64) -> Result<u16> {
		self.read_obj::<[u8; 2]>(gpa).map(u16::from_le_bytes)
	}

	pub fn read_u32(&self, gpa: u64) -> Result<u32> {
		self.read_obj::<[u8; 4]>(gpa).map(u32::from_le_bytes)
	}

	pub fn read_u64(&self, gpa: u64) -> Result<u64> {
		self.read_obj::<[u8; 8]>(gpa).map(u64::from_le_bytes)
	}

	pub fn write_u8(&self, gpa: u64, val: u8) -> Result<()> {
		self.write(gpa, &[val])
	}

	pub fn write_u16(&self, gpa: u64, val: u16) -> Result<()> {
		self.write(gpa, &val.to_le_bytes())
	}

	pub fn write_u32(&self, gpa: u64, val: u32) -> Result<()> {
		self.write(gpa, &val.to_le_bytes())
	}

	pub fn write_u64(&self, gpa: u64, val: u64) -> Result<()> {
		self.write(gpa, &val.to_le_bytes())
	}

	fn atomic_u16(&self, gpa: u64) -> Result<&AtomicU16> {
		if gpa % 2 != 0 {
			return Err(VmmError::GuestBug(format!(
				"misaligned ring index at {gpa:#x}"
			)));
		}
		let p = self.host_ptr(gpa, 2)?;
		Ok(unsafe { AtomicU16::from_ptr(p.cast()) })
	}

	/// Consumer-side load of a ring index published by the guest.
	pub fn load_u16_acquire(&self, gpa: u64) -> Result<u16> {
		Ok(self.atomic_u16(gpa)?.load(Ordering::Acquire))
	}

	/// Producer-side store that publishes all prior ring writes.
	pub fn store_u16_release(&self, gpa: u64, val: u16) -> Result<()> {
		self.atomic_u16(gpa)?.store(val, Ordering::Release);
		Ok(())
	}

	pub(crate) fn set_protected(&self, protected: bool) {
		self.protected.store(protected, Ordering::Release);
	}

	/// Whether the guest currently sees its memory read-only.
	pub fn is_protected(&self) -> bool {
		self.protected.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::consts::MIB;

	#[test]
	fn add_and_lookup() {
		let mem = GuestMemory::new();
		mem.add(0, 2 * MIB as usize, SegmentKind::Ram).unwrap();
		mem.add(HIGHMEM_BASE, MIB as usize, SegmentKind::Ram).unwrap();

		assert!(mem.is_ram(0x1000));
		assert!(mem.is_ram(HIGHMEM_BASE + 0x10));
		assert!(!mem.is_ram(2 * MIB));
		assert_eq!(mem.lowmem_size(), 2 * MIB);
		assert_eq!(mem.highmem_size(), MIB);

		mem.write_u32(0x2000, 0xdead_beef).unwrap();
		assert_eq!(mem.read_u32(0x2000).unwrap(), 0xdead_beef);
		assert_eq!(mem.read_u16(0x2002).unwrap(), 0xdead);
	}

	#[test]
	fn rejects_bad_segments() {
		let mem = GuestMemory::new();
		assert!(matches!(
			mem.add(0x800, 0x1000, SegmentKind::Ram),
			Err(VmmError::InvalidSegment { .. })
		));
		mem.add(0, 0x4000, SegmentKind::Ram).unwrap();
		assert!(matches!(
			mem.add(0x2000, 0x4000, SegmentKind::Ram),
			Err(VmmError::SegmentOverlap { .. })
		));
		for i in 1..MAX_MEM_SEGMENTS {
			mem.add(i as u64 * 0x10000, 0x1000, SegmentKind::Ram)
				.unwrap();
		}
		assert!(matches!(
			mem.add(0x100_0000, 0x1000, SegmentKind::Ram),
			Err(VmmError::TooManySegments)
		));
	}

	#[test]
	fn straddling_access_fails() {
		let mem = GuestMemory::new();
		mem.add(0, 0x1000, SegmentKind::Ram).unwrap();
		assert!(mem.read_u32(0xffe).is_err());
		assert!(mem.write(0x1000, &[1]).is_err());
	}

	#[test]
	fn ring_index_ordering_helpers() {
		let mem = GuestMemory::new();
		mem.add(0, 0x1000, SegmentKind::Ram).unwrap();
		mem.store_u16_release(0x10, 7).unwrap();
		assert_eq!(mem.load_u16_acquire(0x10).unwrap(), 7);
		assert!(mem.load_u16_acquire(0x11).is_err());
	}
}
