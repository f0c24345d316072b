use std::fmt;

use crate::consts::VM_MAXCPU;

/// Set of vCPU ids, one bit per vCPU.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(u32);

const _: () = assert!(VM_MAXCPU <= u32::BITS as usize);

impl CpuSet {
	pub const fn empty() -> Self {
		Self(0)
	}

	/// Ids `0..n`.
	pub fn first(n: usize) -> Self {
		if n >= VM_MAXCPU {
			Self(u32::MAX)
		} else {
			Self((1u32 << n) - 1)
		}
	}

	pub fn single(id: usize) -> Self {
		let mut set = Self::empty();
		set.insert(id);
		set
	}

	pub fn insert(&mut self, id: usize) {
		debug_assert!(id < VM_MAXCPU);
		self.0 |= 1 << id;
	}

	pub fn remove(&mut self, id: usize) {
		self.0 &= !(1 << id);
	}

	pub fn contains(&self, id: usize) -> bool {
		id < VM_MAXCPU && self.0 & (1 << id) != 0
	}

	pub fn is_empty(&self) -> bool {
		self.0 == 0
	}

	pub fn len(&self) -> usize {
		self.0.count_ones() as usize
	}

	pub fn intersection(self, other: Self) -> Self {
		Self(self.0 & other.0)
	}

	pub fn union(self, other: Self) -> Self {
		Self(self.0 | other.0)
	}

	pub fn difference(self, other: Self) -> Self {
		Self(self.0 & !other.0)
	}

	pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
		(0..VM_MAXCPU).filter(|id| self.contains(*id))
	}

	pub fn bits(&self) -> u32 {
		self.0
	}
}

impl FromIterator<usize> for CpuSet {
	fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
		let mut set = Self::empty();
		for id in iter {
			set.insert(id);
		}
		set
	}
}

impl fmt::Debug for CpuSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.iter()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn basic_ops() {
		let mut set = CpuSet::empty();
		assert!(set.is_empty());
		set.insert(0);
		set.insert(31);
		assert!(set.contains(31));
		assert!(!set.contains(32));
		assert_eq!(set.len(), 2);
		set.remove(0);
		assert_eq!(set.iter().collect::<Vec<_>>(), vec![31]);
		assert_eq!(CpuSet::first(3), [0, 1, 2].into_iter().collect());
		assert_eq!(CpuSet::first(32).len(), 32);
		assert_eq!(
			CpuSet::first(4).difference(CpuSet::single(2)).bits(),
			0b1011
		);
	}
}
