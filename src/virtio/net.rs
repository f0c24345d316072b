//! Legacy virtio-net. Queue 0 receives, queue 1 transmits. Frames move
//! between the rings and the host backend on two worker threads.

use std::{
	io,
	sync::{Arc, Condvar, Mutex, Weak},
	thread,
	time::Duration,
};

use uuid::Uuid;
use virtio_bindings::bindings::virtio_net::{
	VIRTIO_NET_F_MAC, VIRTIO_NET_F_MRG_RXBUF, VIRTIO_NET_F_STATUS, VIRTIO_NET_S_LINK_UP,
};

use super::{Transport, VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_VENDOR_ID, VirtioDevice, VirtioPci};
use crate::{
	error::{LockExt, Result, VmmError, wait, wait_timeout},
	net::{
		MAX_FRAME, MIN_FRAME, NetOptions, NetworkInterface, NetworkInterfaceRX,
		NetworkInterfaceTX, generate_mac,
	},
	pci::{
		PCIC_NETWORK, PCIR_SUBDEV, PCIR_SUBVEND, PCIS_NETWORK_ETHERNET, PciDevice, PciFunction,
	},
	vm::Vm,
};

pub const VIRTIO_DEV_NET: u16 = 0x1000;
/// Subsystem id of a network card.
pub const VIRTIO_TYPE_NET: u16 = 1;

pub const RXQ: u16 = 0;
pub const TXQ: u16 = 1;
const RINGSZ: u16 = 1024;

/// `virtio_net_hdr` plus `num_buffers`.
pub const HDR_LEN_MRG: usize = 12;
pub const HDR_LEN: usize = 10;
const NUM_BUFFERS_OFFSET: usize = 10;

/// `mac[6]` followed by `status: u16`.
const CONFIG_SIZE: usize = 8;
const STATUS_OFFSET: usize = 6;

const HOST_FEATURES: u32 = (1 << VIRTIO_NET_F_MAC)
	| (1 << VIRTIO_NET_F_MRG_RXBUF)
	| (1 << VIRTIO_NET_F_STATUS)
	| VIRTIO_F_NOTIFY_ON_EMPTY;

#[derive(Debug)]
struct NetState {
	rx_ready: bool,
	rx_merge: bool,
	hdrlen: usize,
	resetting: bool,
	rx_busy: bool,
	tx_busy: bool,
	tx_kick: bool,
}

impl Default for NetState {
	fn default() -> Self {
		Self {
			rx_ready: false,
			rx_merge: true,
			hdrlen: HDR_LEN_MRG,
			resetting: false,
			rx_busy: false,
			tx_busy: false,
			tx_kick: false,
		}
	}
}

#[derive(Debug)]
pub struct VirtioNet {
	label: String,
	config: Mutex<[u8; CONFIG_SIZE]>,
	state: Mutex<NetState>,
	cv: Condvar,
}

impl VirtioNet {
	fn new(label: String, mac: [u8; 6], link_up: bool) -> Self {
		let mut config = [0u8; CONFIG_SIZE];
		config[..6].copy_from_slice(&mac);
		let status = if link_up { VIRTIO_NET_S_LINK_UP as u16 } else { 0 };
		config[STATUS_OFFSET..].copy_from_slice(&status.to_le_bytes());
		Self {
			label,
			config: Mutex::new(config),
			state: Mutex::new(NetState::default()),
			cv: Condvar::new(),
		}
	}

	pub fn mac(&self) -> [u8; 6] {
		let config = self.config.locked();
		let mut mac = [0u8; 6];
		mac.copy_from_slice(&config[..6]);
		mac
	}

	pub fn link_up(&self) -> bool {
		let config = self.config.locked();
		u16::from_le_bytes([config[STATUS_OFFSET], config[STATUS_OFFSET + 1]])
			& VIRTIO_NET_S_LINK_UP as u16
			!= 0
	}

	/// Receive path for one frame from the backend.
	fn deliver(&self, vm: &Vm, transport: &Transport, frame: &[u8]) -> Result<()> {
		let (hdrlen, merge) = {
			let mut st = self.state.locked();
			if !st.rx_ready || st.resetting {
				trace!("{}: rx not ready, dropping frame", self.label);
				return Ok(());
			}
			st.rx_busy = true;
			(st.hdrlen, st.rx_merge)
		};
		let res = self.fill_rx(vm, transport, frame, hdrlen, merge);
		self.state.locked().rx_busy = false;
		self.cv.notify_all();
		res
	}

	fn fill_rx(
		&self,
		vm: &Vm,
		transport: &Transport,
		frame: &[u8],
		hdrlen: usize,
		merge: bool,
	) -> Result<()> {
		let mem = vm.mem();
		let mut packet = vec![0u8; hdrlen + frame.len()];
		packet[hdrlen..].copy_from_slice(frame);

		let mut queue = transport.queue(RXQ)?;
		let mut chains = Vec::new();
		let mut done = 0;
		while done < packet.len() {
			let Some(chain) = queue.getchain(mem)? else {
				break;
			};
			let n = chain.scatter(mem, &packet[done..])?;
			done += n;
			chains.push((chain, n));
			if !merge || n == 0 {
				break;
			}
		}

		if chains.is_empty() || (merge && done < packet.len()) {
			// Out of guest buffers. Put back what was taken and drop.
			queue.retchain(chains.len() as u16);
			drop(queue);
			debug!("{}: no rx buffers, dropped {} bytes", self.label, frame.len());
			return transport.endchains(vm, RXQ, true);
		}
		if done < packet.len() {
			warn!(
				"{}: rx buffer too small, truncated {} byte frame",
				self.label,
				frame.len()
			);
		}

		if merge {
			let count = chains.len() as u16;
			packet[NUM_BUFFERS_OFFSET..HDR_LEN_MRG].copy_from_slice(&count.to_le_bytes());
			chains[0].0.scatter(mem, &packet[..hdrlen])?;
		}
		for (chain, len) in &chains {
			queue.relchain(mem, chain.head, *len as u32)?;
		}
		drop(queue);
		transport.endchains(vm, RXQ, false)
	}

	fn rx_loop(&self, vm: Weak<Vm>, transport: &Transport, mut rx: Box<dyn NetworkInterfaceRX>) {
		let mut frame = vec![0u8; MAX_FRAME];
		loop {
			let len = match rx.recv(&mut frame) {
				Ok(0) => {
					info!("{}: backend closed", self.label);
					break;
				}
				Ok(len) => len,
				Err(err)
					if matches!(
						err.kind(),
						io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
					) =>
				{
					continue;
				}
				Err(err) => {
					warn!("{}: receive failed: {err}", self.label);
					break;
				}
			};
			let Some(vm) = vm.upgrade() else { break };
			if vm.is_destroyed() {
				break;
			}
			if let Err(err) = self.deliver(&vm, transport, &frame[..len]) {
				warn!("{}: rx: {err}", self.label);
			}
		}
	}

	/// Transmits everything on the TX ring. Notifications stay off until
	/// the ring is seen empty with them back on.
	fn drain_tx(
		&self,
		vm: &Vm,
		transport: &Transport,
		mut tx: Option<&mut Box<dyn NetworkInterfaceTX>>,
		hdrlen: usize,
	) -> Result<()> {
		let mem = vm.mem();
		loop {
			loop {
				let chain = transport.queue(TXQ)?.getchain(mem)?;
				let Some(chain) = chain else { break };
				match chain.gather(mem, hdrlen, MAX_FRAME) {
					Ok(mut frame) => {
						if frame.len() < MIN_FRAME {
							frame.resize(MIN_FRAME, 0);
						}
						if let Some(tx) = tx.as_mut() {
							if let Err(err) = tx.send(&frame) {
								warn!("{}: send failed: {err}", self.label);
							}
						}
					}
					Err(err) => warn!("{}: dropping frame: {err}", self.label),
				}
				let total = chain.readable_len();
				transport.queue(TXQ)?.relchain(mem, chain.head, total)?;
			}
			let queue = transport.queue(TXQ)?;
			queue.set_notify(mem, true)?;
			if !queue.has_descs(mem)? {
				break;
			}
			queue.set_notify(mem, false)?;
		}
		transport.endchains(vm, TXQ, true)
	}

	fn tx_loop(
		&self,
		vm: Weak<Vm>,
		transport: &Transport,
		mut tx: Option<Box<dyn NetworkInterfaceTX>>,
	) {
		loop {
			let hdrlen = {
				let mut st = self.state.locked();
				while !st.tx_kick || st.resetting {
					if vm.upgrade().is_none_or(|vm| vm.is_destroyed()) {
						return;
					}
					st = wait_timeout(&self.cv, st, Duration::from_secs(1));
				}
				st.tx_kick = false;
				st.tx_busy = true;
				st.hdrlen
			};
			let res = match vm.upgrade() {
				Some(vm) => self.drain_tx(&vm, transport, tx.as_mut(), hdrlen),
				None => Ok(()),
			};
			if let Err(err) = res {
				warn!("{}: tx: {err}", self.label);
			}
			self.state.locked().tx_busy = false;
			self.cv.notify_all();
		}
	}
}

impl VirtioDevice for VirtioNet {
	fn name(&self) -> &'static str {
		"virtio-net"
	}

	fn host_features(&self) -> u32 {
		HOST_FEATURES
	}

	fn cfg_size(&self) -> u64 {
		CONFIG_SIZE as u64
	}

	fn cfg_read(&self, offset: u64, size: u8) -> u32 {
		let config = self.config.locked();
		let mut bytes = [0u8; 4];
		let off = offset as usize;
		let len = size as usize;
		bytes[..len].copy_from_slice(&config[off..off + len]);
		u32::from_le_bytes(bytes)
	}

	fn cfg_write(&self, offset: u64, size: u8, value: u32) {
		let off = offset as usize;
		let len = size as usize;
		// Only the MAC is writable.
		if off + len > STATUS_OFFSET {
			warn!("{}: write to read-only config {offset:#x}", self.label);
			return;
		}
		self.config.locked()[off..off + len].copy_from_slice(&value.to_le_bytes()[..len]);
	}

	fn notify(&self, vm: &Vm, transport: &Transport, queue: u16) -> Result<()> {
		match queue {
			RXQ => {
				let mut st = self.state.locked();
				if !st.rx_ready {
					st.rx_ready = true;
					drop(st);
					debug!("{}: rx ready", self.label);
					transport.queue(RXQ)?.set_notify(vm.mem(), false)?;
				}
			}
			TXQ => {
				transport.queue(TXQ)?.set_notify(vm.mem(), false)?;
				self.state.locked().tx_kick = true;
				self.cv.notify_all();
			}
			_ => warn!("{}: notify of queue {queue}", self.label),
		}
		Ok(())
	}

	fn negotiated(&self, features: u32) {
		let mut st = self.state.locked();
		st.rx_merge = features & (1 << VIRTIO_NET_F_MRG_RXBUF) != 0;
		st.hdrlen = if st.rx_merge { HDR_LEN_MRG } else { HDR_LEN };
	}

	fn reset(&self) {
		let mut st = self.state.locked();
		st.resetting = true;
		while st.rx_busy || st.tx_busy {
			st = wait(&self.cv, st);
		}
		*st = NetState::default();
		drop(st);
		self.cv.notify_all();
	}
}

/// Creates a virtio-net function from its `-s` options.
pub fn init(
	vm: &Vm,
	pi: &Arc<PciFunction>,
	driver: &str,
	config: Option<&str>,
) -> Result<Arc<dyn PciDevice>> {
	let opts = NetOptions::parse(driver, config)?;
	let uuid = opts
		.uuid
		.or(vm.config().uuid)
		.unwrap_or_else(Uuid::new_v4);
	let backend = opts.open(uuid).map_err(|err| {
		error!("{}: cannot open backend: {err}", pi.name());
		VmmError::Io(err)
	})?;
	attach(vm, pi, &opts, backend)
}

/// Wires a device to an already opened backend. Without one, transmitted
/// frames are dropped and the link reads as down.
pub(crate) fn attach(
	vm: &Vm,
	pi: &Arc<PciFunction>,
	opts: &NetOptions,
	backend: Option<Box<dyn NetworkInterface>>,
) -> Result<Arc<dyn PciDevice>> {
	let mac = opts
		.mac
		.or_else(|| backend.as_ref().and_then(|b| b.mac_address()))
		.unwrap_or_else(|| {
			generate_mac(&vm.config().uuid.unwrap_or_default(), pi.slot(), pi.func())
		});
	let label = format!("virtio-net@{}:{}", pi.slot(), pi.func());
	let backend_name = backend.as_ref().map(|b| b.name());

	let transport = Arc::new(Transport::new(
		vm,
		pi.clone(),
		"virtio-net",
		&[RINGSZ, RINGSZ],
		CONFIG_SIZE as u64,
	)?);
	pi.set_identity(
		VIRTIO_VENDOR_ID,
		VIRTIO_DEV_NET,
		PCIC_NETWORK,
		PCIS_NETWORK_ETHERNET,
	);
	pi.set_cfg16(PCIR_SUBVEND, VIRTIO_VENDOR_ID);
	pi.set_cfg16(PCIR_SUBDEV, VIRTIO_TYPE_NET);

	let net = Arc::new(VirtioNet::new(label.clone(), mac, backend.is_some()));
	let (rx, tx) = match backend {
		Some(backend) => {
			let (rx, tx) = backend.split()?;
			(Some(rx), Some(tx))
		}
		None => (None, None),
	};

	if let Some(rx) = rx {
		let (net, transport, vm) = (net.clone(), transport.clone(), vm.weak());
		thread::Builder::new()
			.name(format!("vtnet-rx-{}:{}", pi.slot(), pi.func()))
			.spawn(move || net.rx_loop(vm, &transport, rx))?;
	}
	{
		let (net, transport, vm) = (net.clone(), transport.clone(), vm.weak());
		thread::Builder::new()
			.name(format!("vtnet-tx-{}:{}", pi.slot(), pi.func()))
			.spawn(move || net.tx_loop(vm, &transport, tx))?;
	}

	info!(
		"{label}: mac {}, backend {}",
		mac_address::MacAddress::new(mac),
		backend_name.as_deref().unwrap_or("none")
	);
	Ok(Arc::new(VirtioPci::new(transport, net)))
}
