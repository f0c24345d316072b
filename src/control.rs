//! Host-side control of a running VM: process signals become control
//! messages, and the pidfile advertises the process while the VM runs.

use std::{
	fs::{self, OpenOptions},
	io::{self, Write},
	os::unix::fs::OpenOptionsExt,
	path::{Path, PathBuf},
	process,
	thread::{self, JoinHandle},
};

use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, signal};

/// A request from outside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
	Pause,
	Resume,
	/// Power the guest off. A second request tears the VM down.
	Shutdown,
}

impl ControlMsg {
	pub fn from_signal(sig: Signal) -> Option<Self> {
		match sig {
			Signal::SIGUSR1 => Some(Self::Pause),
			Signal::SIGUSR2 => Some(Self::Resume),
			Signal::SIGINT | Signal::SIGQUIT | Signal::SIGTERM => Some(Self::Shutdown),
			_ => None,
		}
	}
}

const CONTROL_SIGNALS: [Signal; 5] = [
	Signal::SIGUSR1,
	Signal::SIGUSR2,
	Signal::SIGINT,
	Signal::SIGQUIT,
	Signal::SIGTERM,
];

fn control_sigset() -> SigSet {
	let mut set = SigSet::empty();
	for sig in CONTROL_SIGNALS {
		set.add(sig);
	}
	set
}

/// Blocks the control signals in the calling thread and ignores SIGPIPE.
/// Threads spawned afterwards inherit the mask, so call this before any
/// other thread exists.
pub fn block_signals() -> nix::Result<()> {
	// SAFETY: installs SIG_IGN, no handler code runs.
	unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;
	pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&control_sigset()), None)
}

/// Starts the thread that waits for control signals and hands them to
/// `forward`. The thread exits once `forward` returns false.
pub fn spawn_signal_thread<F>(mut forward: F) -> io::Result<JoinHandle<()>>
where
	F: FnMut(ControlMsg) -> bool + Send + 'static,
{
	let set = control_sigset();
	// The new thread inherits the mask, so no signal slips in before it waits.
	pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None).map_err(io::Error::from)?;
	thread::Builder::new()
		.name("signals".into())
		.spawn(move || {
			loop {
				let sig = match set.wait() {
					Ok(sig) => sig,
					Err(err) => {
						error!("sigwait failed: {err}");
						return;
					}
				};
				let Some(msg) = ControlMsg::from_signal(sig) else {
					continue;
				};
				info!("{} received: {msg:?}", sig.as_str());
				if !forward(msg) {
					debug!("control receiver gone, signal thread exits");
					return;
				}
			}
		})
}

/// Holds the process id in a file until dropped.
#[derive(Debug)]
pub struct Pidfile {
	path: PathBuf,
}

impl Pidfile {
	/// Creates `path`, failing if it already exists.
	pub fn create(path: &Path) -> io::Result<Self> {
		let mut file = OpenOptions::new()
			.write(true)
			.create_new(true)
			.mode(0o644)
			.open(path)?;
		let pidfile = Self {
			path: path.to_path_buf(),
		};
		writeln!(file, "{}", process::id())?;
		debug!("pidfile {} written", path.display());
		Ok(pidfile)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for Pidfile {
	fn drop(&mut self) {
		if let Err(err) = fs::remove_file(&self.path) {
			warn!("could not remove pidfile {}: {err}", self.path.display());
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{os::unix::thread::JoinHandleExt, sync::mpsc, time::Duration};

	use nix::sys::pthread::pthread_kill;

	use super::*;

	#[test]
	fn signal_mapping() {
		assert_eq!(ControlMsg::from_signal(Signal::SIGUSR1), Some(ControlMsg::Pause));
		assert_eq!(ControlMsg::from_signal(Signal::SIGUSR2), Some(ControlMsg::Resume));
		for sig in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
			assert_eq!(ControlMsg::from_signal(sig), Some(ControlMsg::Shutdown));
		}
		assert_eq!(ControlMsg::from_signal(Signal::SIGHUP), None);
	}

	#[test]
	fn signals_are_forwarded() {
		let (tx, rx) = mpsc::channel();
		let handle = spawn_signal_thread(move |msg| tx.send(msg).is_ok()).unwrap();
		pthread_kill(handle.as_pthread_t(), Signal::SIGUSR1).unwrap();
		assert_eq!(
			rx.recv_timeout(Duration::from_secs(5)),
			Ok(ControlMsg::Pause)
		);
		pthread_kill(handle.as_pthread_t(), Signal::SIGUSR2).unwrap();
		assert_eq!(
			rx.recv_timeout(Duration::from_secs(5)),
			Ok(ControlMsg::Resume)
		);
		drop(rx);
		pthread_kill(handle.as_pthread_t(), Signal::SIGTERM).unwrap();
		handle.join().unwrap();
	}

	#[test]
	fn pidfile_lifecycle() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("xhv.pid");
		let pidfile = Pidfile::create(&path).unwrap();
		assert_eq!(
			fs::read_to_string(&path).unwrap(),
			format!("{}\n", process::id())
		);

		let err = Pidfile::create(&path).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
		// The failed attempt must not remove the live file.
		assert!(path.exists());

		drop(pidfile);
		assert!(!path.exists());
	}
}
