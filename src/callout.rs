//! Timer callouts for the emulated clocks.
//!
//! All callouts fire on one dedicated thread. Deadlines live in a min-heap; a
//! reset or stop bumps the callout's generation so heap entries and in-flight
//! fires that belong to an older arming are recognised as stale and dropped.

use std::{
	cmp::Reverse,
	collections::BinaryHeap,
	fmt,
	sync::{Arc, Condvar, Mutex},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crate::error::{LockExt, wait, wait_timeout};

pub type CalloutFn = Arc<dyn Fn(Ticket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalloutId(usize);

/// Identifies one arming of a callout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
	pub id: CalloutId,
	pub generation: u64,
}

struct Entry {
	handler: CalloutFn,
	generation: u64,
	deadline: Option<Instant>,
}

#[derive(Default)]
struct State {
	entries: Vec<Option<Entry>>,
	heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
	shutdown: bool,
}

struct Shared {
	state: Mutex<State>,
	cv: Condvar,
}

pub struct Callouts {
	shared: Arc<Shared>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Callouts {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.shared.state.locked();
		f.debug_struct("Callouts")
			.field("registered", &state.entries.iter().flatten().count())
			.field("queued", &state.heap.len())
			.finish()
	}
}

impl Callouts {
	pub fn start() -> std::io::Result<Self> {
		let shared = Arc::new(Shared {
			state: Mutex::new(State::default()),
			cv: Condvar::new(),
		});
		let worker = shared.clone();
		let thread = thread::Builder::new()
			.name("callout".into())
			.spawn(move || worker.run())?;
		Ok(Self {
			shared,
			thread: Mutex::new(Some(thread)),
		})
	}

	pub fn register(&self, handler: CalloutFn) -> CalloutId {
		let mut state = self.shared.state.locked();
		let entry = Entry {
			handler,
			generation: 0,
			deadline: None,
		};
		match state.entries.iter().position(Option::is_none) {
			Some(idx) => {
				state.entries[idx] = Some(entry);
				CalloutId(idx)
			}
			None => {
				state.entries.push(Some(entry));
				CalloutId(state.entries.len() - 1)
			}
		}
	}

	pub fn unregister(&self, id: CalloutId) {
		let mut state = self.shared.state.locked();
		if let Some(slot) = state.entries.get_mut(id.0) {
			*slot = None;
		}
	}

	/// Arms (or re-arms) `id` to fire at `deadline`.
	pub fn reset(&self, id: CalloutId, deadline: Instant) -> Option<Ticket> {
		let mut state = self.shared.state.locked();
		let entry = state.entries.get_mut(id.0)?.as_mut()?;
		entry.generation += 1;
		entry.deadline = Some(deadline);
		let generation = entry.generation;
		state.heap.push(Reverse((deadline, id.0, generation)));
		drop(state);
		self.shared.cv.notify_one();
		Some(Ticket { id, generation })
	}

	pub fn reset_after(&self, id: CalloutId, delay: Duration) -> Option<Ticket> {
		self.reset(id, Instant::now() + delay)
	}

	/// Cancels a pending fire. Returns whether one was pending.
	pub fn stop(&self, id: CalloutId) -> bool {
		let mut state = self.shared.state.locked();
		match state.entries.get_mut(id.0).and_then(Option::as_mut) {
			Some(entry) => {
				entry.generation += 1;
				entry.deadline.take().is_some()
			}
			None => false,
		}
	}

	pub fn pending(&self, id: CalloutId) -> bool {
		let state = self.shared.state.locked();
		state
			.entries
			.get(id.0)
			.and_then(Option::as_ref)
			.is_some_and(|e| e.deadline.is_some())
	}

	/// Whether `ticket` still names the latest arming of its callout.
	pub fn is_current(&self, ticket: Ticket) -> bool {
		let state = self.shared.state.locked();
		state
			.entries
			.get(ticket.id.0)
			.and_then(Option::as_ref)
			.is_some_and(|e| e.generation == ticket.generation)
	}

	pub fn shutdown(&self) {
		self.shared.state.locked().shutdown = true;
		self.shared.cv.notify_all();
		if let Some(thread) = self.thread.locked().take() {
			if thread.thread().id() == thread::current().id() {
				return;
			}
			if thread.join().is_err() {
				error!("callout thread panicked");
			}
		}
	}
}

impl Drop for Callouts {
	fn drop(&mut self) {
		self.shutdown();
	}
}

impl Shared {
	fn run(&self) {
		let mut state = self.state.locked();
		loop {
			if state.shutdown {
				break;
			}
			let Some(&Reverse((deadline, idx, generation))) = state.heap.peek() else {
				state = wait(&self.cv, state);
				continue;
			};
			let now = Instant::now();
			if deadline > now {
				state = wait_timeout(&self.cv, state, deadline - now);
				continue;
			}
			state.heap.pop();

			let handler = match state.entries.get_mut(idx).and_then(Option::as_mut) {
				Some(entry) if entry.generation == generation => {
					entry.deadline = None;
					entry.handler.clone()
				}
				_ => continue,
			};
			drop(state);
			handler(Ticket {
				id: CalloutId(idx),
				generation,
			});
			state = self.state.locked();
		}
		trace!("callout thread exiting");
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		mpsc,
	};

	use super::*;

	#[test]
	fn fires_in_deadline_order() {
		let callouts = Callouts::start().unwrap();
		let (tx, rx) = mpsc::channel();
		let ids: Vec<_> = (0..3)
			.map(|n| {
				let tx = tx.clone();
				callouts.register(Arc::new(move |_| tx.send(n).unwrap()))
			})
			.collect();
		let base = Instant::now();
		callouts.reset(ids[0], base + Duration::from_millis(60));
		callouts.reset(ids[1], base + Duration::from_millis(20));
		callouts.reset(ids[2], base + Duration::from_millis(40));
		let order: Vec<_> = (0..3)
			.map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
			.collect();
		assert_eq!(order, vec![1, 2, 0]);
	}

	#[test]
	fn stop_and_reset_discard_stale_fires() {
		let callouts = Callouts::start().unwrap();
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		let id = callouts.register(Arc::new(move |_| {
			c.fetch_add(1, Ordering::SeqCst);
		}));

		callouts.reset_after(id, Duration::from_millis(30));
		assert!(callouts.pending(id));
		assert!(callouts.stop(id));
		assert!(!callouts.pending(id));

		let first = callouts.reset_after(id, Duration::from_millis(10)).unwrap();
		let second = callouts.reset_after(id, Duration::from_millis(40)).unwrap();
		assert!(!callouts.is_current(first));
		assert!(callouts.is_current(second));

		thread::sleep(Duration::from_millis(200));
		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert!(!callouts.pending(id));
	}
}
