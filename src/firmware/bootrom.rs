//! Boot ROM images such as UEFI firmware volumes, mapped read-only so that
//! they end at 4 GiB. The BSP starts at the reset vector.

use std::path::Path;

use super::{BootState, LoaderError, read_file};
use crate::{
	consts::{MIB, PAGE_SIZE},
	error::Result,
	vm::Vm,
};

const MAX_SIZE: u64 = 16 * MIB;

pub fn load(vm: &Vm, path: &Path) -> Result<BootState> {
	let image = read_file(path)?;
	load_image(vm, &image)
}

pub(crate) fn load_image(vm: &Vm, image: &[u8]) -> Result<BootState> {
	let len = image.len() as u64;
	if len == 0 || len > MAX_SIZE || len % PAGE_SIZE as u64 != 0 {
		return Err(LoaderError::BootromSize(len).into());
	}
	let gpa = vm.setup_bootrom(image)?;
	info!("boot ROM mapped at {gpa:#x}+{len:#x}");
	Ok(BootState::default())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{consts::HIGHMEM_BASE, pci::tests::vm};

	#[test]
	fn placed_below_4g() {
		let vm = vm();
		let mut image = vec![0u8; 2 * PAGE_SIZE];
		image[2 * PAGE_SIZE - 16] = 0xea;
		let state = load_image(&vm, &image).unwrap();
		assert_eq!(state, BootState::default());
		assert_eq!(vm.bootrom(), Some((HIGHMEM_BASE - 0x2000, 0x2000)));
		assert_eq!(vm.mem().read_u8(0xffff_fff0).unwrap(), 0xea);
	}

	#[test]
	fn size_limits() {
		let vm = vm();
		for len in [0, 100, PAGE_SIZE + 1] {
			let err = load_image(&vm, &vec![0; len]).unwrap_err();
			assert!(matches!(
				err,
				crate::error::VmmError::Loader(LoaderError::BootromSize(_))
			));
		}
	}
}
