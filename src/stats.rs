//! Exit counters kept by every vCPU and the table printed with `--stats`.

use std::{
	fmt,
	time::{Duration, Instant},
};

macro_rules! exit_classes {
	($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
		/// Classes of VM exits, counted per vCPU.
		#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
		pub enum VmExit {
			$($(#[$doc])* $name,)+
		}

		impl VmExit {
			pub const ALL: &'static [VmExit] = &[$(VmExit::$name,)+];
		}
	};
}

exit_classes! {
	Total,
	ExtInt,
	Hlt,
	Cpuid,
	Inout,
	InoutStr,
	CrAccess,
	Rdmsr,
	Wrmsr,
	Xsetbv,
	Mtrap,
	Pause,
	Monitor,
	Mwait,
	IntrWindow,
	NmiWindow,
	Exception,
	Nmi,
	TaskSwitch,
	EptFault,
	InstEmul,
	Rendezvous,
	Suspended,
	ReqIdle,
	Unknown,
	/// Returned to the host for handling.
	Userspace,
}

const CLASSES: usize = VmExit::ALL.len();

#[derive(Debug, Clone)]
pub struct CpuStats {
	id: usize,
	counts: [u64; CLASSES],
	started: Option<Instant>,
	runtime: Option<Duration>,
}

impl CpuStats {
	pub(crate) fn new(id: usize) -> Self {
		Self {
			id,
			counts: [0; CLASSES],
			started: None,
			runtime: None,
		}
	}

	pub fn id(&self) -> usize {
		self.id
	}

	#[inline]
	pub(crate) fn increment_val(&mut self, class: VmExit) {
		self.counts[class as usize] += 1;
	}

	pub fn get(&self, class: VmExit) -> u64 {
		self.counts[class as usize]
	}

	pub(crate) fn start_time_measurement(&mut self) {
		self.started = Some(Instant::now());
	}

	/// Stops the clock started by [`Self::start_time_measurement`].
	pub(crate) fn stop_time_measurement(&mut self) {
		self.runtime = self.started.map(|t| t.elapsed());
	}

	pub fn runtime(&self) -> Option<Duration> {
		self.runtime
	}
}

/// Counters of all vCPUs of a finished VM, ordered by vCPU id.
#[derive(Debug, Clone, Default)]
pub struct VmStats {
	cpus: Vec<CpuStats>,
}

impl VmStats {
	pub fn new(cpu_stats: &[CpuStats]) -> Self {
		let mut cpus = cpu_stats.to_vec();
		cpus.sort_by_key(|cpu| cpu.id);
		Self { cpus }
	}

	pub fn cpus(&self) -> &[CpuStats] {
		&self.cpus
	}

	pub fn total(&self, class: VmExit) -> u64 {
		self.cpus.iter().map(|cpu| cpu.get(class)).sum()
	}
}

impl fmt::Display for VmStats {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "VM exits:                       total  ")?;
		for cpu in &self.cpus {
			write!(f, " {:>6} ", format!("cpu{}", cpu.id))?;
		}
		writeln!(f)?;
		// Classes nobody hit are left out.
		for &class in VmExit::ALL.iter().filter(|c| self.total(**c) > 0) {
			write!(f, "  {:<28} {:>6}  ", format!("{class:?}:"), self.total(class))?;
			for cpu in &self.cpus {
				write!(f, " {:>6} ", cpu.get(class))?;
			}
			writeln!(f)?;
		}
		writeln!(f, "CPU runtimes:")?;
		for cpu in &self.cpus {
			if let Some(rt) = cpu.runtime {
				writeln!(f, "  cpu {}: {rt:?}", cpu.id)?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use regex::Regex;

	use super::*;

	#[test]
	fn classes_are_dense() {
		for (i, class) in VmExit::ALL.iter().enumerate() {
			assert_eq!(*class as usize, i);
		}
	}

	#[test]
	fn table() {
		let mut s1 = CpuStats::new(1);
		s1.start_time_measurement();
		s1.increment_val(VmExit::Inout);
		s1.increment_val(VmExit::Inout);
		s1.increment_val(VmExit::Hlt);
		s1.increment_val(VmExit::Cpuid);
		s1.stop_time_measurement();

		let mut s2 = CpuStats::new(2);
		s2.increment_val(VmExit::Inout);
		s2.increment_val(VmExit::InstEmul);
		s2.increment_val(VmExit::Hlt);

		let vm_stats = VmStats::new(&[s2, s1]);
		assert_eq!(vm_stats.cpus()[0].id(), 1);
		assert_eq!(vm_stats.total(VmExit::Inout), 3);
		assert_eq!(vm_stats.total(VmExit::InstEmul), 1);
		assert_eq!(vm_stats.total(VmExit::Rdmsr), 0);
		assert!(vm_stats.cpus()[0].runtime().is_some());
		assert!(vm_stats.cpus()[1].runtime().is_none());

		let table = vm_stats.to_string();
		// Name, total, then one column per vCPU.
		let inout = Regex::new(r"(?m)^\s+Inout:\s+3\s+2\s+1\s*$").unwrap();
		assert!(inout.is_match(&table), "{table}");
		assert!(!table.contains("Rdmsr"));
		assert!(table.contains("cpu 1:") && !table.contains("cpu 2:"));
	}
}
