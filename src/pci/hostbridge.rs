use std::sync::Arc;

use zerocopy::{Immutable, IntoBytes, KnownLayout};

use super::{PCIC_BRIDGE, PCIS_BRIDGE_HOST, PciDevice, PciFunction};
use crate::error::Result;

const PCIY_EXPRESS: u8 = 0x10;
const PCIEM_CAP_VERSION: u16 = 0x0002;
const PCIEM_TYPE_ROOT_PORT: u16 = 0x0040;
/// x1 link at 2.5 GT/s, port 1.
const LINK_CAPABILITIES: u32 = 0x411;
const LINK_STATUS: u16 = 0x11;

/// Vendor and device id presented by the host bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
	NetApp,
	Amd,
}

impl Flavor {
	const fn ids(self) -> (u16, u16) {
		match self {
			Flavor::NetApp => (0x1275, 0x1275),
			Flavor::Amd => (0x1022, 0x7432),
		}
	}
}

/// PCI Express capability as a root port reports it.
#[repr(C)]
#[derive(Debug, Default, IntoBytes, Immutable, KnownLayout)]
struct PcieCap {
	capid: u8,
	nextptr: u8,
	pcie_capabilities: u16,
	dev_capabilities: u32,
	dev_control: u16,
	dev_status: u16,
	link_capabilities: u32,
	link_control: u16,
	link_status: u16,
	slot_capabilities: u32,
	slot_control: u16,
	slot_status: u16,
	root_control: u16,
	root_capabilities: u16,
	root_status: u32,
	dev_capabilities2: u32,
	dev_control2: u16,
	dev_status2: u16,
	link_capabilities2: u32,
	link_control2: u16,
	link_status2: u16,
	slot_capabilities2: u32,
	slot_control2: u16,
	slot_status2: u16,
}

/// Host bridge in slot 0. Everything it has is plain config space.
#[derive(Debug)]
pub struct HostBridge {
	flavor: Flavor,
}

impl PciDevice for HostBridge {
	fn name(&self) -> &'static str {
		match self.flavor {
			Flavor::NetApp => "hostbridge",
			Flavor::Amd => "amd_hostbridge",
		}
	}
}

pub fn init(pi: &PciFunction, flavor: Flavor) -> Result<Arc<dyn PciDevice>> {
	let (vendor, device) = flavor.ids();
	pi.set_identity(vendor, device, PCIC_BRIDGE, PCIS_BRIDGE_HOST);
	let cap = PcieCap {
		capid: PCIY_EXPRESS,
		pcie_capabilities: PCIEM_CAP_VERSION | PCIEM_TYPE_ROOT_PORT,
		link_capabilities: LINK_CAPABILITIES,
		link_status: LINK_STATUS,
		..Default::default()
	};
	pi.add_capability(cap.as_bytes())?;
	Ok(Arc::new(HostBridge { flavor }))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pci::{
		PCIR_CAP_PTR, PCIR_CLASS, PCIR_DEVICE, PCIR_STATUS, PCIR_VENDOR, PCIM_STATUS_CAPPRESENT,
		SlotSpec,
		lpc::LpcConfig,
		tests::{cfg_read, cfg_write, vm},
	};

	#[test]
	fn netapp_identity() {
		let vm = vm();
		let spec: SlotSpec = "0,hostbridge".parse().unwrap();
		crate::pci::init(&vm, &[spec], &LpcConfig::default()).unwrap();
		assert_eq!(cfg_read(&vm, 0, PCIR_VENDOR, 2), 0x1275);
		assert_eq!(cfg_read(&vm, 0, PCIR_DEVICE, 2), 0x1275);
		assert_eq!(cfg_read(&vm, 0, PCIR_CLASS, 1), PCIC_BRIDGE as u32);
		assert_ne!(cfg_read(&vm, 0, PCIR_STATUS, 2) & PCIM_STATUS_CAPPRESENT as u32, 0);

		let cap = cfg_read(&vm, 0, PCIR_CAP_PTR, 1) as u8;
		assert_eq!(cfg_read(&vm, 0, cap, 1), PCIY_EXPRESS as u32);
		assert_eq!(cfg_read(&vm, 0, cap + 2, 2), 0x42);
		assert_eq!(cfg_read(&vm, 0, cap + 12, 4), LINK_CAPABILITIES);
		assert_eq!(cfg_read(&vm, 0, cap + 18, 2), LINK_STATUS as u32);
		// No BARs to size.
		cfg_write(&vm, 0, 0x10, 4, 0xffff_ffff);
		assert_eq!(cfg_read(&vm, 0, 0x10, 4), 0);
	}

	#[test]
	fn amd_identity() {
		let pi = PciFunction::new("hb", 0, 0);
		let dev = init(&pi, Flavor::Amd).unwrap();
		assert_eq!(dev.name(), "amd_hostbridge");
		assert_eq!(pi.cfg16(PCIR_VENDOR), 0x1022);
		assert_eq!(pi.cfg16(PCIR_DEVICE), 0x7432);
	}
}
