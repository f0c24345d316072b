//! Layer 2 tap device. On macOS this is the `tuntaposx` character device
//! `/dev/tapN`, on Linux a tap interface opened through `/dev/net/tun`.

use std::{io, sync::Arc};

use super::{NetworkInterface, NetworkInterfaceRX, NetworkInterfaceTX};

#[cfg(target_os = "linux")]
type Device = tun_tap::Iface;
#[cfg(not(target_os = "linux"))]
type Device = std::fs::File;

pub struct Tap {
	name: String,
	dev: Arc<Device>,
}

impl Tap {
	#[cfg(target_os = "linux")]
	pub fn open(name: &str) -> io::Result<Self> {
		let dev = tun_tap::Iface::without_packet_info(name, tun_tap::Mode::Tap)?;
		info!("opened tap interface {}", dev.name());
		Ok(Self {
			name: dev.name().to_string(),
			dev: Arc::new(dev),
		})
	}

	#[cfg(not(target_os = "linux"))]
	pub fn open(name: &str) -> io::Result<Self> {
		let path = std::path::Path::new("/dev").join(name);
		let dev = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.open(&path)
			.inspect_err(|err| error!("cannot open {}: {err}", path.display()))?;
		info!("opened {}", path.display());
		Ok(Self {
			name: name.to_string(),
			dev: Arc::new(dev),
		})
	}
}

impl NetworkInterface for Tap {
	fn name(&self) -> String {
		self.name.clone()
	}

	/// The guest picks its own address on a tap.
	fn mac_address(&self) -> Option<[u8; 6]> {
		None
	}

	fn split(
		self: Box<Self>,
	) -> io::Result<(Box<dyn NetworkInterfaceRX>, Box<dyn NetworkInterfaceTX>)> {
		Ok((
			Box::new(TapRX(self.dev.clone())),
			Box::new(TapTX(self.dev)),
		))
	}
}

struct TapRX(Arc<Device>);

struct TapTX(Arc<Device>);

#[cfg(target_os = "linux")]
impl NetworkInterfaceRX for TapRX {
	fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.0.recv(buf)
	}
}

#[cfg(target_os = "linux")]
impl NetworkInterfaceTX for TapTX {
	fn send(&mut self, frame: &[u8]) -> io::Result<()> {
		self.0.send(frame).map(drop)
	}
}

#[cfg(not(target_os = "linux"))]
impl NetworkInterfaceRX for TapRX {
	fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		use std::io::Read;
		(&*self.0).read(buf)
	}
}

#[cfg(not(target_os = "linux"))]
impl NetworkInterfaceTX for TapTX {
	fn send(&mut self, frame: &[u8]) -> io::Result<()> {
		use std::io::Write;
		// One write is one frame on a tap device.
		(&*self.0).write(frame).map(drop)
	}
}

