//! VM-wide barrier: every targeted vCPU leaves the guest, runs a callback
//! exactly once, and only then do all of them resume.

use std::{
	sync::{Arc, Condvar, Mutex},
	time::Duration,
};

use super::Vm;
use crate::{
	cpuset::CpuSet,
	error::{LockExt, wait_timeout},
};

pub type RendezvousFn = Arc<dyn Fn(&Vm, usize) + Send + Sync>;

#[derive(Default)]
pub(crate) struct RendezvousState {
	req: CpuSet,
	done: CpuSet,
	func: Option<RendezvousFn>,
}

#[derive(Default)]
pub(crate) struct Rendezvous {
	state: Mutex<RendezvousState>,
	cv: Condvar,
}

impl Rendezvous {
	pub fn pending(&self) -> bool {
		self.state.locked().func.is_some()
	}

	/// Whether `vcpu` still owes the current rendezvous a callback.
	pub fn pending_for(&self, vcpu: usize) -> bool {
		let state = self.state.locked();
		state.func.is_some() && state.req.contains(vcpu) && !state.done.contains(vcpu)
	}
}

impl Vm {
	pub fn rendezvous_pending(&self) -> bool {
		self.rendezvous.pending()
	}

	/// Takes part in the rendezvous in progress. `vcpu` is `None` for a host
	/// thread that only waits for completion.
	pub(crate) fn handle_rendezvous(&self, vcpu: Option<usize>) {
		let mut state = self.rendezvous.state.locked();
		while let Some(func) = state.func.clone() {
			let active = self.active_cpus();
			state.req = state.req.intersection(active);

			if let Some(id) = vcpu {
				if state.req.contains(id) && !state.done.contains(id) {
					trace!("vCPU {id}: calling rendezvous func");
					drop(state);
					func(self, id);
					state = self.rendezvous.state.locked();
					state.done.insert(id);
				}
			}
			if state.req == state.done {
				trace!("rendezvous completed");
				state.func = None;
				self.rendezvous.cv.notify_all();
				break;
			}
			state = wait_timeout(&self.rendezvous.cv, state, Duration::from_secs(1));
			if self.is_destroyed() {
				break;
			}
		}
	}

	/// Runs `func` on every vCPU in `dest` and returns once all of them
	/// have. The caller takes part if it is one of the targets.
	pub fn smp_rendezvous(&self, vcpu: Option<usize>, dest: CpuSet, func: RendezvousFn) {
		loop {
			let mut state = self.rendezvous.state.locked();
			if state.func.is_some() {
				drop(state);
				debug!("rendezvous already in progress");
				self.handle_rendezvous(vcpu);
				continue;
			}
			state.req = dest;
			state.done = CpuSet::empty();
			state.func = Some(func);
			break;
		}

		for id in dest.iter() {
			self.notify_event(id, false);
		}
		self.handle_rendezvous(vcpu);
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicUsize, Ordering},
		thread,
	};

	use super::*;
	use crate::vm::VmConfig;
	use crate::vmx::mock::MockBackend;

	#[test]
	fn every_target_runs_once() {
		let vm = Vm::create(
			Arc::new(MockBackend::new()),
			VmConfig {
				ncpus: 3,
				..Default::default()
			},
		)
		.unwrap();
		for id in 0..3 {
			vm.activate_cpu(id).unwrap();
		}
		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		let func: RendezvousFn = Arc::new(move |_, _| {
			c.fetch_add(1, Ordering::SeqCst);
		});

		let workers: Vec<_> = (1..3)
			.map(|id| {
				let vm = vm.clone();
				thread::spawn(move || {
					while !vm.rendezvous.pending_for(id) {
						thread::sleep(Duration::from_millis(1));
					}
					vm.handle_rendezvous(Some(id));
				})
			})
			.collect();
		vm.smp_rendezvous(Some(0), CpuSet::first(3), func);
		for w in workers {
			w.join().unwrap();
		}
		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(!vm.rendezvous_pending());
	}

	#[test]
	fn inactive_targets_are_dropped() {
		let vm = Vm::create(
			Arc::new(MockBackend::new()),
			VmConfig {
				ncpus: 2,
				..Default::default()
			},
		)
		.unwrap();
		vm.activate_cpu(0).unwrap();
		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		vm.smp_rendezvous(
			Some(0),
			CpuSet::first(2),
			Arc::new(move |_, id| {
				assert_eq!(id, 0);
				c.fetch_add(1, Ordering::SeqCst);
			}),
		);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
