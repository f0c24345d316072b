mod common;

use std::{
	sync::Arc,
	thread,
	time::{Duration, Instant},
};

use common::*;
use xhvlib::{
	control::ControlMsg,
	runner::{EXIT_POWEROFF, VmRunner},
	vm::SuspendHow,
	vmx::{backend::MemPerm, mock::MockBackend},
};

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while !cond() {
		assert!(Instant::now() < deadline, "timed out waiting for {what}");
		thread::sleep(Duration::from_millis(2));
	}
}

#[test]
fn pause_resume_shutdown() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let script = (0..5000).map(|_| busy(Duration::from_millis(2))).collect();
	let backend = Arc::new(MockBackend::new().script(0, script));
	let runner = VmRunner::new(backend.clone(), &params(bootrom(dir.path()))).unwrap();
	let vm = runner.vm().clone();
	let controller = runner.controller();
	let vm_thread = thread::spawn(move || runner.run());

	let record = backend.record(0);
	wait_for("the guest to run", || record.entries().len() > 10);
	assert_eq!(backend.perm(0), Some(MemPerm::ReadWriteExec));

	assert!(controller.send(ControlMsg::Pause));
	wait_for("the pause", || vm.is_paused());
	assert_eq!(backend.perm(0), Some(MemPerm::ReadExec));
	// At most the entry in flight completes.
	thread::sleep(Duration::from_millis(20));
	let frozen = record.entries().len();
	thread::sleep(Duration::from_millis(100));
	assert_eq!(record.entries().len(), frozen);

	assert!(controller.send(ControlMsg::Resume));
	wait_for("the guest to continue", || record.entries().len() > frozen + 10);
	assert_eq!(backend.perm(0), Some(MemPerm::ReadWriteExec));

	assert!(controller.send(ControlMsg::Shutdown));
	let result = vm_thread.join().unwrap();
	assert_eq!(result.how, SuspendHow::Poweroff);
	assert_eq!(result.code, EXIT_POWEROFF);
	assert!(result.error.is_none());

	// Execution picked up exactly where it stopped.
	let entries = record.entries();
	assert_eq!(entries[0].rip, 0xfff0);
	assert!(entries.windows(2).all(|w| w[1].rip == w[0].rip + 2));
}

#[test]
fn shutdown_while_paused() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let script = (0..5000).map(|_| busy(Duration::from_millis(2))).collect();
	let backend = Arc::new(MockBackend::new().script(0, script));
	let runner = VmRunner::new(backend.clone(), &params(bootrom(dir.path()))).unwrap();
	let vm = runner.vm().clone();
	let controller = runner.controller();
	let vm_thread = thread::spawn(move || runner.run());

	let record = backend.record(0);
	wait_for("the guest to run", || !record.entries().is_empty());
	assert!(controller.send(ControlMsg::Pause));
	wait_for("the pause", || vm.is_paused());

	assert!(controller.send(ControlMsg::Shutdown));
	let result = vm_thread.join().unwrap();
	assert_eq!(result.how, SuspendHow::Poweroff);
	assert_eq!(result.code, EXIT_POWEROFF);
}
