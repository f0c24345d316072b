//! 16550-compatible UART on the LPC bus.
//!
//! Transmitted bytes go to the configured [`Destination`]. A reader thread
//! feeds the receive FIFO from stdin or the backing tty and only reads
//! while the FIFO has room, so input is never dropped on the floor.

use std::{
	collections::VecDeque,
	fs::{File, OpenOptions},
	io::{self, Read, Write},
	os::fd::AsFd,
	path::PathBuf,
	sync::{Arc, Condvar, Mutex, Weak},
	thread,
};

use nix::sys::termios::{self, SetArg, Termios};

use super::{IrqOp, isa_irq};
use crate::{
	error::{LockExt, Result, VmmError, wait},
	inout::{self, PortFlags},
	vm::Vm,
};

const REG_DATA: u16 = 0;
const REG_DLL: u16 = 0;
const REG_IER: u16 = 1;
const REG_DLH: u16 = 1;
const REG_IIR: u16 = 2;
const REG_FCR: u16 = 2;
const REG_LCR: u16 = 3;
const REG_MCR: u16 = 4;
const REG_LSR: u16 = 5;
const REG_MSR: u16 = 6;
const REG_SCR: u16 = 7;

const DEFAULT_RCLK: u32 = 1_843_200;
const DEFAULT_BAUD: u32 = 9600;
const FIFOSZ: usize = 16;

const IER_ERXRDY: u8 = 0x01;
const IER_ETXRDY: u8 = 0x02;
const IER_ERLS: u8 = 0x04;
const IER_EMSC: u8 = 0x08;

const IIR_NOPEND: u8 = 0x01;
const IIR_TXRDY: u8 = 0x02;
const IIR_MLSC: u8 = 0x00;
const IIR_RLS: u8 = 0x06;
const IIR_RXTOUT: u8 = 0x0c;
const IIR_FIFO_MASK: u8 = 0xc0;

const FCR_ENABLE: u8 = 0x01;
const FCR_RCV_RST: u8 = 0x02;
const FCR_DMA: u8 = 0x08;
const FCR_RX_MASK: u8 = 0xc0;

const LCR_DLAB: u8 = 0x80;

const MCR_DTR: u8 = 0x01;
const MCR_RTS: u8 = 0x02;
const MCR_OUT1: u8 = 0x04;
const MCR_OUT2: u8 = 0x08;
const MCR_LOOPBACK: u8 = 0x10;

const LSR_RXRDY: u8 = 0x01;
const LSR_OE: u8 = 0x02;
const LSR_THRE: u8 = 0x20;
const LSR_TEMT: u8 = 0x40;

const MSR_DCTS: u8 = 0x01;
const MSR_DDSR: u8 = 0x02;
const MSR_TERI: u8 = 0x04;
const MSR_DDCD: u8 = 0x08;
const MSR_DELTA_MASK: u8 = 0x0f;
const MSR_CTS: u8 = 0x10;
const MSR_DSR: u8 = 0x20;
const MSR_RI: u8 = 0x40;
const MSR_DCD: u8 = 0x80;

/// Legacy COM ports with their I/O base and ISA IRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Com {
	Com1,
	Com2,
}

impl Com {
	pub const fn base(self) -> u16 {
		match self {
			Com::Com1 => 0x3f8,
			Com::Com2 => 0x2f8,
		}
	}

	pub const fn irq(self) -> u8 {
		match self {
			Com::Com1 => 4,
			Com::Com2 => 3,
		}
	}

	pub const fn name(self) -> &'static str {
		match self {
			Com::Com1 => "com1",
			Com::Com2 => "com2",
		}
	}
}

/// Where a UART is connected on the host side.
#[derive(Debug, Clone, Default)]
pub enum Destination {
	/// The terminal xhv runs in.
	#[default]
	StdIo,
	/// A tty device node or plain file.
	File(PathBuf),
	/// Collect output in memory. Input comes from [`Uart::push_input`].
	Buffer(Arc<Mutex<Vec<u8>>>),
	/// Discard output, never receive.
	None,
}

enum Sink {
	StdIo,
	File(Mutex<File>),
	Buffer(Arc<Mutex<Vec<u8>>>),
	None,
}

impl Sink {
	fn output(&self, byte: u8) -> io::Result<()> {
		match self {
			Sink::StdIo => {
				let mut out = io::stdout().lock();
				out.write_all(&[byte])?;
				out.flush()
			}
			Sink::File(f) => f.locked().write_all(&[byte]),
			Sink::Buffer(b) => {
				b.locked().push(byte);
				Ok(())
			}
			Sink::None => Ok(()),
		}
	}
}

static SAVED_TERMIOS: Mutex<Option<Termios>> = Mutex::new(None);

/// Puts stdin into raw mode for the guest console.
pub(crate) fn stdin_raw_mode() -> Result<()> {
	let stdin = io::stdin();
	let fd = stdin.as_fd();
	let orig = match termios::tcgetattr(fd) {
		Ok(orig) => orig,
		// Not a terminal.
		Err(nix::errno::Errno::ENOTTY) => return Ok(()),
		Err(err) => return Err(err.into()),
	};
	let mut raw = orig.clone();
	termios::cfmakeraw(&mut raw);
	termios::tcsetattr(fd, SetArg::TCSANOW, &raw)?;
	SAVED_TERMIOS.locked().get_or_insert(orig);
	Ok(())
}

/// Undoes [`stdin_raw_mode`]. Called on every exit path of the binary.
pub fn restore_terminal() {
	if let Some(orig) = SAVED_TERMIOS.locked().take()
		&& let Err(err) = termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &orig)
	{
		warn!("cannot restore the terminal: {err}");
	}
}

#[derive(Debug)]
struct RxFifo {
	buf: VecDeque<u8>,
	size: usize,
}

impl RxFifo {
	fn new(size: usize) -> Self {
		Self {
			buf: VecDeque::with_capacity(FIFOSZ),
			size,
		}
	}

	fn reset(&mut self, size: usize) {
		self.buf.clear();
		self.size = size;
	}

	fn put(&mut self, byte: u8) -> bool {
		if self.buf.len() >= self.size {
			return false;
		}
		self.buf.push_back(byte);
		true
	}

	fn has_room(&self) -> bool {
		self.buf.len() < self.size
	}
}

#[derive(Debug)]
struct UartState {
	dll: u8,
	dlh: u8,
	ier: u8,
	fcr: u8,
	lcr: u8,
	mcr: u8,
	lsr: u8,
	msr: u8,
	scr: u8,
	thre_int_pending: bool,
	rxfifo: RxFifo,
}

fn modem_status(mcr: u8) -> u8 {
	if mcr & MCR_LOOPBACK != 0 {
		let mut msr = 0;
		if mcr & MCR_RTS != 0 {
			msr |= MSR_CTS;
		}
		if mcr & MCR_DTR != 0 {
			msr |= MSR_DSR;
		}
		if mcr & MCR_OUT1 != 0 {
			msr |= MSR_RI;
		}
		if mcr & MCR_OUT2 != 0 {
			msr |= MSR_DCD;
		}
		msr
	} else {
		// Carrier and DSR stay up so a guest tty open never blocks.
		MSR_DCD | MSR_DSR
	}
}

impl UartState {
	fn new() -> Self {
		let divisor = DEFAULT_RCLK / DEFAULT_BAUD / 16;
		Self {
			dll: divisor as u8,
			dlh: (divisor >> 8) as u8,
			ier: 0,
			fcr: 0,
			lcr: 0,
			mcr: 0,
			lsr: 0,
			msr: modem_status(0),
			scr: 0,
			thre_int_pending: false,
			rxfifo: RxFifo::new(1),
		}
	}

	fn intr_reason(&self) -> u8 {
		if self.lsr & LSR_OE != 0 && self.ier & IER_ERLS != 0 {
			IIR_RLS
		} else if !self.rxfifo.buf.is_empty() && self.ier & IER_ERXRDY != 0 {
			IIR_RXTOUT
		} else if self.thre_int_pending && self.ier & IER_ETXRDY != 0 {
			IIR_TXRDY
		} else if self.msr & MSR_DELTA_MASK != 0 && self.ier & IER_EMSC != 0 {
			IIR_MLSC
		} else {
			IIR_NOPEND
		}
	}
}

pub struct Uart {
	com: Com,
	sink: Sink,
	state: Mutex<UartState>,
	/// Signalled when the receive FIFO drains.
	room: Condvar,
}

impl std::fmt::Debug for Uart {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Uart")
			.field("com", &self.com)
			.field("state", &self.state)
			.finish_non_exhaustive()
	}
}

impl Uart {
	fn new(com: Com, sink: Sink) -> Self {
		Self {
			com,
			sink,
			state: Mutex::new(UartState::new()),
			room: Condvar::new(),
		}
	}

	pub fn com(&self) -> Com {
		self.com
	}

	/// The 16550 interrupt output is edge triggered on the LPC bus.
	fn toggle_intr(&self, vm: &Vm, state: &UartState) {
		if state.intr_reason() == IIR_NOPEND {
			return;
		}
		let irq = self.com.irq();
		if let Err(err) = isa_irq(vm, irq, Some(irq), IrqOp::Pulse) {
			warn!("{}: IRQ {irq} delivery failed: {err}", self.com.name());
		}
	}

	/// Feeds received bytes into the FIFO. Returns how many fit.
	pub fn push_input(&self, vm: &Vm, bytes: &[u8]) -> usize {
		let mut state = self.state.locked();
		let mut n = 0;
		for &byte in bytes {
			if !state.rxfifo.put(byte) {
				break;
			}
			n += 1;
		}
		if n > 0 {
			self.toggle_intr(vm, &state);
		}
		n
	}

	fn read(&self, vm: &Vm, offset: u16) -> u8 {
		let mut state = self.state.locked();
		let reg = if state.lcr & LCR_DLAB != 0 && offset == REG_DLL {
			state.dll
		} else if state.lcr & LCR_DLAB != 0 && offset == REG_DLH {
			state.dlh
		} else {
			match offset {
				REG_DATA => {
					let byte = state.rxfifo.buf.pop_front().unwrap_or(0);
					self.room.notify_one();
					byte
				}
				REG_IER => state.ier,
				REG_IIR => {
					let reason = state.intr_reason();
					// Reading IIR acknowledges a THR-empty interrupt.
					if reason == IIR_TXRDY {
						state.thre_int_pending = false;
					}
					let fifo = if state.fcr & FCR_ENABLE != 0 {
						IIR_FIFO_MASK
					} else {
						0
					};
					fifo | reason
				}
				REG_LCR => state.lcr,
				REG_MCR => state.mcr,
				REG_LSR => {
					// The transmitter is always ready.
					state.lsr |= LSR_TEMT | LSR_THRE;
					if state.rxfifo.buf.is_empty() {
						state.lsr &= !LSR_RXRDY;
					} else {
						state.lsr |= LSR_RXRDY;
					}
					let lsr = state.lsr;
					state.lsr &= !LSR_OE;
					lsr
				}
				REG_MSR => {
					let msr = state.msr;
					state.msr &= !MSR_DELTA_MASK;
					msr
				}
				REG_SCR => state.scr,
				_ => 0xff,
			}
		};
		self.toggle_intr(vm, &state);
		reg
	}

	fn write(&self, vm: &Vm, offset: u16, value: u8) {
		let mut out = None;
		{
			let mut state = self.state.locked();
			if state.lcr & LCR_DLAB != 0 && offset == REG_DLL {
				state.dll = value;
			} else if state.lcr & LCR_DLAB != 0 && offset == REG_DLH {
				state.dlh = value;
			} else {
				self.write_reg(&mut state, offset, value, &mut out);
			}
			self.toggle_intr(vm, &state);
		}
		if let Some(byte) = out
			&& let Err(err) = self.sink.output(byte)
		{
			warn!("{}: output failed: {err}", self.com.name());
		}
	}

	fn write_reg(&self, state: &mut UartState, offset: u16, value: u8, out: &mut Option<u8>) {
		match offset {
			REG_DATA => {
				if state.mcr & MCR_LOOPBACK != 0 {
					if !state.rxfifo.put(value) {
						state.lsr |= LSR_OE;
					}
				} else {
					*out = Some(value);
				}
				state.thre_int_pending = true;
			}
			REG_IER => {
				// Enabling the THR-empty interrupt raises it right away.
				if state.ier & IER_ETXRDY == 0 && value & IER_ETXRDY != 0 {
					state.thre_int_pending = true;
				}
				state.ier = value & 0x0f;
			}
			REG_FCR => {
				// Switching between FIFO and 16450 mode flushes the FIFO.
				if (state.fcr ^ value) & FCR_ENABLE != 0 {
					let size = if value & FCR_ENABLE != 0 { FIFOSZ } else { 1 };
					state.rxfifo.reset(size);
					self.room.notify_one();
				}
				if value & FCR_ENABLE == 0 {
					state.fcr = 0;
				} else {
					if value & FCR_RCV_RST != 0 {
						state.rxfifo.reset(FIFOSZ);
						self.room.notify_one();
					}
					state.fcr = value & (FCR_ENABLE | FCR_DMA | FCR_RX_MASK);
				}
			}
			REG_LCR => state.lcr = value,
			REG_MCR => {
				state.mcr = value & 0x1f;
				let msr = modem_status(state.mcr);
				let changed = msr ^ state.msr;
				if changed & MSR_CTS != 0 {
					state.msr |= MSR_DCTS;
				}
				if changed & MSR_DSR != 0 {
					state.msr |= MSR_DDSR;
				}
				if changed & MSR_DCD != 0 {
					state.msr |= MSR_DDCD;
				}
				if state.msr & MSR_RI != 0 && msr & MSR_RI == 0 {
					state.msr |= MSR_TERI;
				}
				state.msr = (state.msr & MSR_DELTA_MASK) | msr;
			}
			REG_SCR => state.scr = value,
			// LSR and MSR are read-only.
			_ => {}
		}
	}

	/// Blocks the reader thread until the FIFO can take another byte.
	fn wait_for_room(&self) {
		let mut state = self.state.locked();
		while !state.rxfifo.has_room() {
			state = wait(&self.room, state);
		}
	}

	fn spawn_reader(self: &Arc<Self>, vm: Weak<Vm>, mut input: Box<dyn Read + Send>) -> Result<()> {
		let uart = self.clone();
		thread::Builder::new()
			.name(format!("uart-{}", self.com.name()))
			.spawn(move || {
				let mut byte = [0u8; 1];
				loop {
					uart.wait_for_room();
					match input.read(&mut byte) {
						Ok(0) => {
							debug!("{}: input closed", uart.com.name());
							break;
						}
						Ok(_) => {
							let Some(vm) = vm.upgrade() else { break };
							if vm.is_destroyed() {
								break;
							}
							uart.push_input(&vm, &byte);
						}
						Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
						Err(err) => {
							warn!("{}: input failed: {err}", uart.com.name());
							break;
						}
					}
				}
			})?;
		Ok(())
	}
}

/// Creates the UART for `com` and claims its eight ports.
pub fn attach(vm: &Vm, com: Com, dest: &Destination) -> Result<Arc<Uart>> {
	let (sink, input): (Sink, Option<Box<dyn Read + Send>>) = match dest {
		Destination::StdIo => {
			stdin_raw_mode()?;
			(Sink::StdIo, Some(Box::new(io::stdin())))
		}
		Destination::File(path) => {
			let file = OpenOptions::new()
				.read(true)
				.write(true)
				.open(path)
				.map_err(|err| {
					error!("cannot open {} for {}: {err}", path.display(), com.name());
					VmmError::Io(err)
				})?;
			let reader = file.try_clone()?;
			(Sink::File(Mutex::new(file)), Some(Box::new(reader)))
		}
		Destination::Buffer(buf) => (Sink::Buffer(buf.clone()), None),
		Destination::None => (Sink::None, None),
	};
	let uart = Arc::new(Uart::new(com, sink));
	let handle = uart.clone();
	vm.inout().register(
		com.name(),
		com.base(),
		8,
		PortFlags::INOUT,
		inout::handler(move |vm, _, is_in, port, bytes, eax| {
			if bytes != 1 {
				return Err(VmmError::UnhandledPort { port, bytes, is_in });
			}
			let offset = port - com.base();
			if is_in {
				*eax = handle.read(vm, offset) as u32;
			} else {
				handle.write(vm, offset, *eax as u8);
			}
			Ok(())
		}),
	)?;
	if let Some(input) = input {
		uart.spawn_reader(vm.weak(), input)?;
	}
	info!("{} at {:#x}, IRQ {}", com.name(), com.base(), com.irq());
	Ok(uart)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{vm::VmConfig, vmx::mock::MockBackend};

	fn setup() -> (Arc<Vm>, Arc<Uart>, Arc<Mutex<Vec<u8>>>) {
		let vm = Vm::create(Arc::new(MockBackend::new()), VmConfig::default()).unwrap();
		vm.activate_cpu(0).unwrap();
		let buf = Arc::new(Mutex::new(Vec::new()));
		let uart = attach(&vm, Com::Com1, &Destination::Buffer(buf.clone())).unwrap();
		(vm, uart, buf)
	}

	fn outb(vm: &Vm, port: u16, val: u8) {
		let mut eax = val as u32;
		vm.inout().dispatch(vm, 0, false, port, 1, &mut eax).unwrap();
	}

	fn inb(vm: &Vm, port: u16) -> u8 {
		let mut eax = 0;
		vm.inout().dispatch(vm, 0, true, port, 1, &mut eax).unwrap();
		eax as u8
	}

	#[test]
	fn transmit_reaches_destination() {
		let (vm, _uart, buf) = setup();
		for &b in b"ok\n" {
			outb(&vm, 0x3f8, b);
		}
		assert_eq!(buf.lock().unwrap().as_slice(), b"ok\n");
		assert_eq!(inb(&vm, 0x3fd) & (LSR_THRE | LSR_TEMT), LSR_THRE | LSR_TEMT);
	}

	#[test]
	fn divisor_latch() {
		let (vm, ..) = setup();
		outb(&vm, 0x3fb, LCR_DLAB | 0x03);
		assert_eq!(inb(&vm, 0x3f8), 12);
		outb(&vm, 0x3f8, 1);
		outb(&vm, 0x3fb, 0x03);
		outb(&vm, 0x3f9, 0x0f);
		assert_eq!(inb(&vm, 0x3f9), 0x0f);
		outb(&vm, 0x3fb, LCR_DLAB | 0x03);
		assert_eq!(inb(&vm, 0x3f8), 1);
	}

	#[test]
	fn receive_fifo_and_iir() {
		let (vm, uart, _) = setup();
		outb(&vm, 0x3fa, FCR_ENABLE);
		outb(&vm, 0x3f9, IER_ERXRDY);
		assert_eq!(uart.push_input(&vm, &[b'x'; 20]), FIFOSZ);
		assert_eq!(inb(&vm, 0x3fa), IIR_FIFO_MASK | IIR_RXTOUT);
		assert_ne!(inb(&vm, 0x3fd) & LSR_RXRDY, 0);
		for _ in 0..FIFOSZ {
			assert_eq!(inb(&vm, 0x3f8), b'x');
		}
		assert_eq!(inb(&vm, 0x3fd) & LSR_RXRDY, 0);
		assert_eq!(inb(&vm, 0x3fa), IIR_FIFO_MASK | IIR_NOPEND);
	}

	#[test]
	fn thre_interrupt_is_acknowledged_by_iir() {
		let (vm, ..) = setup();
		outb(&vm, 0x3f9, IER_ETXRDY);
		assert_eq!(inb(&vm, 0x3fa), IIR_TXRDY);
		assert_eq!(inb(&vm, 0x3fa), IIR_NOPEND);
	}

	#[test]
	fn loopback_overrun() {
		let (vm, _uart, buf) = setup();
		outb(&vm, 0x3fc, MCR_LOOPBACK | MCR_RTS);
		assert_ne!(inb(&vm, 0x3fe) & MSR_CTS, 0);
		outb(&vm, 0x3f8, b'a');
		outb(&vm, 0x3f8, b'b');
		assert!(buf.lock().unwrap().is_empty());
		assert_ne!(inb(&vm, 0x3fd) & LSR_OE, 0);
		assert_eq!(inb(&vm, 0x3fd) & LSR_OE, 0);
		assert_eq!(inb(&vm, 0x3f8), b'a');
	}
}
