//! Client side of the VMN3T protocol spoken by userspace network providers
//! such as vpnkit. Every frame on the stream is preceded by its length as a
//! little-endian `u16`.

use std::{
	fs::File,
	io::{self, Read, Write},
	os::unix::net::UnixStream,
	path::Path,
};

use uuid::Uuid;
use zerocopy::{
	FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
	byteorder::little_endian::{U16, U32},
};

use super::{NetworkInterface, NetworkInterfaceRX, NetworkInterfaceTX};

pub const MAGIC: [u8; 5] = *b"VMN3T";
pub const PROTOCOL_VERSION: u32 = 22;
/// Oldest server version that understands the ethernet command.
pub const MIN_VERSION: u32 = 22;

const COMMAND_ETHERNET: u8 = 1;
const RESPONSE_VIF: u8 = 1;
const RESPONSE_DISCONNECT: u8 = 2;

/// Greeting exchanged by both ends.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InitMessage {
	pub hello: [u8; 5],
	_pad: [u8; 3],
	pub version: U32,
	pub commit: [u8; 40],
}

impl InitMessage {
	pub fn new(version: u32) -> Self {
		let mut msg = Self::new_zeroed();
		msg.hello = MAGIC;
		msg.version = U32::new(version);
		msg
	}
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EthernetCommand {
	pub command: u8,
	/// Textual UUID, NUL padded.
	pub uuid: [u8; 40],
}

/// What the server assigned to this interface.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VifInfo {
	pub mtu: U16,
	pub max_packet_size: U16,
	pub mac: [u8; 6],
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Runs the client half of the handshake on a fresh connection.
pub fn handshake<S: Read + Write>(stream: &mut S, uuid: Uuid) -> io::Result<VifInfo> {
	stream.write_all(InitMessage::new(PROTOCOL_VERSION).as_bytes())?;

	let mut server = InitMessage::new_zeroed();
	stream.read_exact(server.as_mut_bytes())?;
	if server.hello != MAGIC {
		return Err(protocol_error("server did not send the VMN3T greeting"));
	}
	let version = server.version.get();
	if version < MIN_VERSION {
		return Err(protocol_error(format!(
			"server speaks version {version}, need at least {MIN_VERSION}"
		)));
	}
	let commit = String::from_utf8_lossy(&server.commit);
	debug!(
		"VMN3T server version {version}, commit {}",
		commit.trim_end_matches('\0')
	);

	let mut cmd = EthernetCommand::new_zeroed();
	cmd.command = COMMAND_ETHERNET;
	let text = uuid.hyphenated().to_string();
	cmd.uuid[..text.len()].copy_from_slice(text.as_bytes());
	stream.write_all(cmd.as_bytes())?;

	let mut response = [0u8; 1];
	stream.read_exact(&mut response)?;
	match response[0] {
		RESPONSE_VIF => {
			let mut vif = VifInfo::new_zeroed();
			stream.read_exact(vif.as_mut_bytes())?;
			Ok(vif)
		}
		RESPONSE_DISCONNECT => {
			let mut len = [0u8; 1];
			stream.read_exact(&mut len)?;
			let mut msg = vec![0u8; len[0] as usize];
			stream.read_exact(&mut msg)?;
			Err(io::Error::new(
				io::ErrorKind::ConnectionRefused,
				format!("server disconnected: {}", String::from_utf8_lossy(&msg)),
			))
		}
		other => Err(protocol_error(format!("unknown response type {other}"))),
	}
}

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write>(w: &mut W, frame: &[u8]) -> io::Result<()> {
	let len = u16::try_from(frame.len())
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too long"))?;
	let mut buf = Vec::with_capacity(frame.len() + 2);
	buf.extend_from_slice(&len.to_le_bytes());
	buf.extend_from_slice(frame);
	w.write_all(&buf)
}

/// Reads the next frame that fits into `buf`. Longer frames are skipped.
/// Returns 0 at end of stream.
pub fn read_frame<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
	loop {
		let mut hdr = [0u8; 2];
		match r.read_exact(&mut hdr) {
			Ok(()) => {}
			Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
			Err(err) => return Err(err),
		}
		let len = u16::from_le_bytes(hdr) as usize;
		if len <= buf.len() {
			r.read_exact(&mut buf[..len])?;
			return Ok(len);
		}
		warn!("dropping {len} byte frame");
		io::copy(&mut r.by_ref().take(len as u64), &mut io::sink())?;
	}
}

pub struct Vmnet {
	name: String,
	vif: VifInfo,
	reader: Box<dyn Read + Send>,
	writer: Box<dyn Write + Send>,
}

impl std::fmt::Debug for Vmnet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Vmnet")
			.field("name", &self.name)
			.field("vif", &self.vif)
			.finish_non_exhaustive()
	}
}

impl Vmnet {
	pub fn connect_unix(path: &Path, uuid: Uuid) -> io::Result<Self> {
		let stream = UnixStream::connect(path)
			.inspect_err(|err| error!("cannot connect to {}: {err}", path.display()))?;
		Self::over_unix(stream, path.display().to_string(), uuid)
	}

	pub(crate) fn over_unix(mut stream: UnixStream, name: String, uuid: Uuid) -> io::Result<Self> {
		let vif = handshake(&mut stream, uuid)?;
		let reader = stream.try_clone()?;
		Ok(Self::new(name, vif, Box::new(reader), Box::new(stream)))
	}

	#[cfg(target_os = "linux")]
	pub fn connect_vsock(cid: u32, port: u32, uuid: Uuid) -> io::Result<Self> {
		use nix::sys::socket::{AddressFamily, SockFlag, SockType, VsockAddr, connect, socket};
		use std::os::fd::AsRawFd;

		let fd = socket(
			AddressFamily::Vsock,
			SockType::Stream,
			SockFlag::SOCK_CLOEXEC,
			None,
		)?;
		connect(fd.as_raw_fd(), &VsockAddr::new(cid, port))?;
		let mut stream = File::from(fd);
		let vif = handshake(&mut stream, uuid)?;
		let reader = stream.try_clone()?;
		Ok(Self::new(
			format!("vsock:{cid}:{port}"),
			vif,
			Box::new(reader),
			Box::new(stream),
		))
	}

	#[cfg(not(target_os = "linux"))]
	pub fn connect_vsock(_cid: u32, _port: u32, _uuid: Uuid) -> io::Result<Self> {
		Err(io::Error::new(
			io::ErrorKind::Unsupported,
			"AF_VSOCK is not available on this host",
		))
	}

	fn new(
		name: String,
		vif: VifInfo,
		reader: Box<dyn Read + Send>,
		writer: Box<dyn Write + Send>,
	) -> Self {
		info!(
			"{name}: mtu {} max packet {} mac {}",
			vif.mtu.get(),
			vif.max_packet_size.get(),
			mac_address::MacAddress::new(vif.mac)
		);
		Self {
			name,
			vif,
			reader,
			writer,
		}
	}

	pub fn vif(&self) -> &VifInfo {
		&self.vif
	}
}

impl NetworkInterface for Vmnet {
	fn name(&self) -> String {
		self.name.clone()
	}

	fn mac_address(&self) -> Option<[u8; 6]> {
		Some(self.vif.mac)
	}

	fn mtu(&self) -> u16 {
		self.vif.mtu.get()
	}

	fn split(
		self: Box<Self>,
	) -> io::Result<(Box<dyn NetworkInterfaceRX>, Box<dyn NetworkInterfaceTX>)> {
		Ok((
			Box::new(VmnetRX(self.reader)),
			Box::new(VmnetTX(self.writer)),
		))
	}
}

struct VmnetRX(Box<dyn Read + Send>);

impl NetworkInterfaceRX for VmnetRX {
	fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		read_frame(&mut self.0, buf)
	}
}

struct VmnetTX(Box<dyn Write + Send>);

impl NetworkInterfaceTX for VmnetTX {
	fn send(&mut self, frame: &[u8]) -> io::Result<()> {
		write_frame(&mut self.0, frame)
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::{io::Cursor, thread};

	use super::*;

	pub(crate) const SERVER_MAC: [u8; 6] = [0x02, 0x50, 0x00, 0x00, 0x00, 0x01];

	/// Server half of the handshake. Returns the UUID the client sent.
	pub(crate) fn serve_handshake<S: Read + Write>(stream: &mut S) -> String {
		let mut client = InitMessage::new_zeroed();
		stream.read_exact(client.as_mut_bytes()).unwrap();
		assert_eq!(client.hello, MAGIC);
		assert_eq!(client.version.get(), PROTOCOL_VERSION);
		stream
			.write_all(InitMessage::new(PROTOCOL_VERSION).as_bytes())
			.unwrap();

		let mut cmd = EthernetCommand::new_zeroed();
		stream.read_exact(cmd.as_mut_bytes()).unwrap();
		assert_eq!(cmd.command, COMMAND_ETHERNET);
		let vif = VifInfo {
			mtu: U16::new(1500),
			max_packet_size: U16::new(1518),
			mac: SERVER_MAC,
		};
		stream.write_all(&[RESPONSE_VIF]).unwrap();
		stream.write_all(vif.as_bytes()).unwrap();
		String::from_utf8_lossy(&cmd.uuid)
			.trim_end_matches('\0')
			.to_string()
	}

	#[test]
	fn wire_sizes() {
		assert_eq!(size_of::<InitMessage>(), 52);
		assert_eq!(size_of::<EthernetCommand>(), 41);
		assert_eq!(size_of::<VifInfo>(), 10);
		let init = InitMessage::new(PROTOCOL_VERSION);
		assert_eq!(&init.as_bytes()[..9], b"VMN3T\0\0\0\x16");
	}

	#[test]
	fn handshake_and_frames() {
		let (client, mut server) = UnixStream::pair().unwrap();
		let uuid = Uuid::new_v4();
		let peer = thread::spawn(move || {
			let sent = serve_handshake(&mut server);
			let mut buf = [0u8; 128];
			let len = read_frame(&mut server, &mut buf).unwrap();
			write_frame(&mut server, &buf[..len]).unwrap();
			sent
		});

		let net = Box::new(Vmnet::over_unix(client, "test".into(), uuid).unwrap());
		assert_eq!(net.mac_address(), Some(SERVER_MAC));
		assert_eq!(net.mtu(), 1500);
		let (mut rx, mut tx) = net.split().unwrap();
		tx.send(b"ping").unwrap();
		let mut buf = [0u8; 64];
		assert_eq!(rx.recv(&mut buf).unwrap(), 4);
		assert_eq!(&buf[..4], b"ping");
		assert_eq!(peer.join().unwrap(), uuid.hyphenated().to_string());
	}

	#[test]
	fn server_disconnect() {
		let (mut client, mut server) = UnixStream::pair().unwrap();
		let peer = thread::spawn(move || {
			let mut msg = InitMessage::new_zeroed();
			server.read_exact(msg.as_mut_bytes()).unwrap();
			server.write_all(InitMessage::new(PROTOCOL_VERSION).as_bytes()).unwrap();
			let mut cmd = EthernetCommand::new_zeroed();
			server.read_exact(cmd.as_mut_bytes()).unwrap();
			server.write_all(&[RESPONSE_DISCONNECT, 4]).unwrap();
			server.write_all(b"busy").unwrap();
		});
		let err = handshake(&mut client, Uuid::new_v4()).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
		assert!(err.to_string().contains("busy"));
		peer.join().unwrap();
	}

	#[test]
	fn old_server_is_refused() {
		let (mut client, mut server) = UnixStream::pair().unwrap();
		let peer = thread::spawn(move || {
			let mut msg = InitMessage::new_zeroed();
			server.read_exact(msg.as_mut_bytes()).unwrap();
			server.write_all(InitMessage::new(MIN_VERSION - 1).as_bytes()).unwrap();
		});
		let err = handshake(&mut client, Uuid::new_v4()).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidData);
		peer.join().unwrap();
	}

	#[test]
	fn oversized_frames_are_skipped() {
		let mut wire = Vec::new();
		write_frame(&mut wire, &[0xaa; 100]).unwrap();
		write_frame(&mut wire, &[0xbb; 8]).unwrap();
		let mut r = Cursor::new(wire);
		let mut buf = [0u8; 16];
		assert_eq!(read_frame(&mut r, &mut buf).unwrap(), 8);
		assert_eq!(buf[..8], [0xbb; 8]);
		assert_eq!(read_frame(&mut r, &mut buf).unwrap(), 0);
	}
}
