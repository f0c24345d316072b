//! PCI-ISA bridge. It owns the COM ports and exposes the PIRQ routing
//! registers of the PIIX family to the guest.

use std::{path::PathBuf, sync::Arc};

use super::{PCIC_BRIDGE, PCIS_BRIDGE_ISA, PciDevice, PciError, PciFunction, irq};
use crate::{
	devices::uart::{self, Com, Destination, Uart},
	error::Result,
	vm::Vm,
};

const LPC_VENDOR: u16 = 0x8086;
const LPC_DEVICE: u16 = 0x7000;
/// PIRQA#-PIRQD# routing registers.
const PIRQ_ROUTE_LOW: u8 = 0x60;
/// PIRQE#-PIRQH# routing registers.
const PIRQ_ROUTE_HIGH: u8 = 0x68;

/// Backends of the UARTs behind the bridge, from `-l`.
#[derive(Debug, Clone, Default)]
pub struct LpcConfig {
	pub com1: Option<Destination>,
	pub com2: Option<Destination>,
}

impl LpcConfig {
	/// Accepts `com1,stdio`, `com2,/dev/ttys004` and `comN,null`.
	pub fn parse_option(&mut self, opt: &str) -> Result<()> {
		let (dev, backend) = opt
			.split_once(',')
			.ok_or_else(|| PciError::InvalidConfig(format!("invalid LPC option {opt:?}")))?;
		let dest = match backend {
			"stdio" => Destination::StdIo,
			"null" => Destination::None,
			"" => return Err(PciError::InvalidConfig(format!("{dev} needs a backend")).into()),
			path => Destination::File(PathBuf::from(path)),
		};
		let slot = match dev.to_ascii_lowercase().as_str() {
			"com1" => &mut self.com1,
			"com2" => &mut self.com2,
			_ => return Err(PciError::InvalidConfig(format!("unknown LPC device {dev:?}")).into()),
		};
		*slot = Some(dest);
		Ok(())
	}
}

fn pirq_pin(coff: u8) -> Option<u8> {
	match coff {
		PIRQ_ROUTE_LOW..=0x63 => Some(coff - PIRQ_ROUTE_LOW + 1),
		PIRQ_ROUTE_HIGH..=0x6b => Some(coff - PIRQ_ROUTE_HIGH + 5),
		_ => None,
	}
}

#[derive(Debug)]
pub struct Lpc {
	uarts: Vec<Arc<Uart>>,
}

impl Lpc {
	pub fn uart(&self, com: Com) -> Option<&Arc<Uart>> {
		self.uarts.iter().find(|u| u.com() == com)
	}
}

impl PciDevice for Lpc {
	fn name(&self) -> &'static str {
		"lpc"
	}

	fn cfg_write(&self, vm: &Vm, pi: &PciFunction, offset: u8, bytes: u8, val: u32) -> Result<bool> {
		let Some(pin) = pirq_pin(offset) else {
			return Ok(false);
		};
		if bytes != 1 {
			return Ok(false);
		}
		vm.pci().irq().pirq_write(vm, pin, val as u8)?;
		pi.set_cfg8(offset, vm.pci().irq().pirq_read(pin));
		Ok(true)
	}
}

pub fn init(vm: &Vm, pi: &PciFunction, config: &LpcConfig) -> Result<Arc<dyn PciDevice>> {
	if vm.pci().device_named("lpc").is_some() {
		return Err(PciError::DuplicateLpc.into());
	}
	let mut uarts = Vec::new();
	for (com, dest) in [(Com::Com1, &config.com1), (Com::Com2, &config.com2)] {
		// The IRQ stays off limits for PCI even without a backend.
		vm.pci().irq().reserve(com.irq())?;
		if let Some(dest) = dest {
			uarts.push(uart::attach(vm, com, dest)?);
		}
	}
	pi.set_identity(LPC_VENDOR, LPC_DEVICE, PCIC_BRIDGE, PCIS_BRIDGE_ISA);
	Ok(Arc::new(Lpc { uarts }))
}

/// Publishes the PIRQ routing chosen while the bus was populated.
pub fn pirq_routed(vm: &Vm) {
	let Some(pi) = vm.pci().device_named("lpc") else {
		return;
	};
	for pin in 1..=irq::NPIRQS as u8 {
		let coff = if pin <= 4 {
			PIRQ_ROUTE_LOW + pin - 1
		} else {
			PIRQ_ROUTE_HIGH + pin - 5
		};
		pi.set_cfg8(coff, vm.pci().irq().pirq_read(pin));
	}
}
