//! Host side of virtio-net: a tap device or a VMN3T framed stream.

use std::{
	hash::{DefaultHasher, Hash, Hasher},
	io,
	str::FromStr,
};

use mac_address::MacAddress;
use uuid::Uuid;

use crate::virtio::VirtioError;

pub mod tap;
pub mod vmnet;

/// Largest Ethernet frame without the virtio header.
pub const MAX_FRAME: usize = 65_550;
pub const MIN_FRAME: usize = 60;
/// OUI used for generated guest MAC addresses.
pub const MAC_PREFIX: [u8; 3] = [0x00, 0xa0, 0x98];

pub trait NetworkInterface: Send {
	fn name(&self) -> String;

	/// The address the host side assigned to the guest, if any.
	fn mac_address(&self) -> Option<[u8; 6]>;

	fn mtu(&self) -> u16 {
		1500
	}

	/// Splits off independent receive and transmit halves.
	fn split(self: Box<Self>) -> io::Result<(Box<dyn NetworkInterfaceRX>, Box<dyn NetworkInterfaceTX>)>;
}

pub trait NetworkInterfaceTX: Send {
	/// Sends one complete Ethernet frame.
	fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

pub trait NetworkInterfaceRX: Send {
	/// Blocks until a frame arrives and returns its length. Zero means the
	/// host side went away.
	fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Where a virtio-net device sends its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
	/// `/dev/tapN` on macOS, a tap interface by name on Linux.
	Tap(String),
	/// VMN3T over a Unix stream socket.
	Unix(std::path::PathBuf),
	/// VMN3T over AF_VSOCK.
	Vsock { cid: u32, port: u32 },
}

/// `virtio-net` options, e.g. `tap=tap0,mac=02:00:00:00:00:01`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetOptions {
	pub backend: Option<Backend>,
	pub mac: Option<[u8; 6]>,
	pub uuid: Option<Uuid>,
}

impl NetOptions {
	/// Parses the config string of `driver`. The bare `virtio-tap,tap0` form
	/// names the tap device.
	pub fn parse(driver: &str, config: Option<&str>) -> Result<Self, VirtioError> {
		let mut opts = Self::default();
		for item in config.unwrap_or_default().split(',').filter(|s| !s.is_empty()) {
			let (key, value) = match item.split_once('=') {
				Some(kv) => kv,
				None if driver == "virtio-tap" => ("tap", item),
				None => return Err(VirtioError::InvalidOption(item.to_string())),
			};
			match key {
				"tap" => opts.backend = Some(Backend::Tap(value.to_string())),
				"path" => opts.backend = Some(Backend::Unix(value.into())),
				"vsock" => {
					let (cid, port) = value
						.split_once(':')
						.and_then(|(c, p)| Some((c.parse().ok()?, p.parse().ok()?)))
						.ok_or_else(|| VirtioError::InvalidOption(item.to_string()))?;
					opts.backend = Some(Backend::Vsock { cid, port });
				}
				"mac" => {
					let mac = MacAddress::from_str(value)
						.map_err(|_| VirtioError::InvalidOption(item.to_string()))?;
					opts.mac = Some(mac.bytes());
				}
				"uuid" => {
					let uuid = Uuid::parse_str(value)
						.map_err(|_| VirtioError::InvalidOption(item.to_string()))?;
					opts.uuid = Some(uuid);
				}
				_ => return Err(VirtioError::InvalidOption(item.to_string())),
			}
		}
		match driver {
			"virtio-tap" if !matches!(opts.backend, Some(Backend::Tap(_))) => Err(
				VirtioError::InvalidOption("virtio-tap needs a tap device".into()),
			),
			"virtio-vpnkit" if matches!(opts.backend, None | Some(Backend::Tap(_))) => Err(
				VirtioError::InvalidOption("virtio-vpnkit needs path= or vsock=".into()),
			),
			_ => Ok(opts),
		}
	}

	pub fn open(&self, uuid: Uuid) -> io::Result<Option<Box<dyn NetworkInterface>>> {
		Ok(match &self.backend {
			None => None,
			Some(Backend::Tap(name)) => Some(Box::new(tap::Tap::open(name)?)),
			Some(Backend::Unix(path)) => Some(Box::new(vmnet::Vmnet::connect_unix(path, uuid)?)),
			Some(Backend::Vsock { cid, port }) => {
				Some(Box::new(vmnet::Vmnet::connect_vsock(*cid, *port, uuid)?))
			}
		})
	}
}

/// A stable MAC address for the function at `slot:func` of
/// the VM identified by `uuid`.
pub fn generate_mac(uuid: &Uuid, slot: u8, func: u8) -> [u8; 6] {
	let mut hasher = DefaultHasher::new();
	(uuid, slot, func).hash(&mut hasher);
	let digest = hasher.finish().to_le_bytes();
	[
		MAC_PREFIX[0],
		MAC_PREFIX[1],
		MAC_PREFIX[2],
		digest[0],
		digest[1],
		digest[2],
	]
}
