//! A scripted in-memory CPU.
//!
//! Every `run` pops the next [`MockExit`] from the vCPU's script and makes it
//! look as if the hardware had just produced that exit. An exhausted script
//! halts with interrupts disabled, which makes the VM halt once every vCPU
//! has run dry.

use std::{
	collections::{HashMap, VecDeque},
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
	thread,
	time::Duration,
};

use super::{
	backend::{Backend, CapKind, Kick, MemPerm, Reg, VirtualCpu},
	caps::VmxCaps,
	vmcs::*,
};
use crate::{
	consts::PSL_RESERVED_ONE,
	error::{LockExt, Result},
};

/// One scripted VM exit.
#[derive(Debug, Clone)]
pub struct MockExit {
	reason: u32,
	qualification: u64,
	inst_len: u64,
	fields: Vec<(u32, u64)>,
	regs: Vec<(Reg, u64)>,
	delay: Option<Duration>,
}

impl MockExit {
	pub fn new(reason: u32) -> Self {
		Self {
			reason,
			qualification: 0,
			inst_len: 0,
			fields: Vec::new(),
			regs: Vec::new(),
			delay: None,
		}
	}

	pub fn qual(mut self, qualification: u64) -> Self {
		self.qualification = qualification;
		self
	}

	pub fn inst_len(mut self, len: u64) -> Self {
		self.inst_len = len;
		self
	}

	/// Sets a VMCS field as the exit is delivered.
	pub fn field(mut self, field: u32, value: u64) -> Self {
		self.fields.push((field, value));
		self
	}

	/// Sets a register as the exit is delivered.
	pub fn reg(mut self, reg: Reg, value: u64) -> Self {
		self.regs.push((reg, value));
		self
	}

	/// Time spent "in the guest" before the exit.
	pub fn after(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}
}

/// What a mock vCPU looked like at one VM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockEntry {
	pub rip: u64,
	pub intr_info: u64,
	pub errcode: u64,
	pub rflags: u64,
}

/// Observations of a mock vCPU, shared with the test.
#[derive(Debug, Default)]
pub struct MockRecord {
	entries: Mutex<Vec<MockEntry>>,
	kicks: AtomicUsize,
	final_regs: Mutex<HashMap<Reg, u64>>,
	final_vmcs: Mutex<HashMap<u32, u64>>,
}

impl MockRecord {
	pub fn entries(&self) -> Vec<MockEntry> {
		self.entries.locked().clone()
	}

	/// Events injected at entry, in order.
	pub fn injected(&self) -> Vec<u64> {
		self.entries
			.locked()
			.iter()
			.filter(|e| e.intr_info & VMCS_INTR_VALID != 0)
			.map(|e| e.intr_info)
			.collect()
	}

	pub fn kicks(&self) -> usize {
		self.kicks.load(Ordering::SeqCst)
	}

	/// Register state as of the last entry.
	pub fn reg(&self, reg: Reg) -> Option<u64> {
		self.final_regs.locked().get(&reg).copied()
	}

	pub fn vmcs(&self, field: u32) -> Option<u64> {
		self.final_vmcs.locked().get(&field).copied()
	}
}

struct MockKick(Arc<MockRecord>);

impl Kick for MockKick {
	fn kick(&self) {
		self.0.kicks.fetch_add(1, Ordering::SeqCst);
	}
}

#[derive(Default)]
pub struct MockBackend {
	scripts: Mutex<HashMap<usize, VecDeque<MockExit>>>,
	records: Mutex<HashMap<usize, Arc<MockRecord>>>,
	mappings: Mutex<Vec<(u64, usize, MemPerm)>>,
}

impl MockBackend {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn script(self, vcpu: usize, exits: Vec<MockExit>) -> Self {
		self.scripts.locked().insert(vcpu, exits.into());
		self
	}

	pub fn record(&self, vcpu: usize) -> Arc<MockRecord> {
		self.records.locked().entry(vcpu).or_default().clone()
	}

	/// Current guest permission of the range starting at `gpa`.
	pub fn perm(&self, gpa: u64) -> Option<MemPerm> {
		self.mappings
			.locked()
			.iter()
			.rev()
			.find(|(start, len, _)| (*start..*start + *len as u64).contains(&gpa))
			.map(|(_, _, perm)| *perm)
	}
}

impl Backend for MockBackend {
	fn read_cap(&self, cap: CapKind) -> Result<u64> {
		Ok(VmxCaps::permissive_caps(cap))
	}

	fn map(&self, _host: *mut u8, gpa: u64, len: usize, perm: MemPerm) -> Result<()> {
		self.mappings.locked().push((gpa, len, perm));
		Ok(())
	}

	fn protect(&self, gpa: u64, len: usize, perm: MemPerm) -> Result<()> {
		self.mappings.locked().push((gpa, len, perm));
		Ok(())
	}

	fn create_vcpu(&self, id: usize) -> Result<Box<dyn VirtualCpu>> {
		let script = self.scripts.locked().remove(&id).unwrap_or_default();
		let mut regs = HashMap::new();
		regs.insert(Reg::Rflags, PSL_RESERVED_ONE);
		Ok(Box::new(MockCpu {
			vmcs: HashMap::new(),
			regs,
			script,
			record: self.record(id),
		}))
	}
}

struct MockCpu {
	vmcs: HashMap<u32, u64>,
	regs: HashMap<Reg, u64>,
	script: VecDeque<MockExit>,
	record: Arc<MockRecord>,
}

impl MockCpu {
	fn deliver(&mut self, exit: MockExit) {
		// The hardware clears entry info on every exit.
		self.vmcs.insert(VMCS_RO_IDT_VECTOR_INFO, 0);
		self.vmcs.insert(VMCS_RO_VMEXIT_IRQ_INFO, 0);
		self.vmcs.insert(VMCS_RO_EXIT_REASON, exit.reason as u64);
		self.vmcs.insert(VMCS_RO_EXIT_QUALIFIC, exit.qualification);
		self.vmcs.insert(VMCS_RO_VMEXIT_INSTR_LEN, exit.inst_len);
		for (field, value) in exit.fields {
			self.vmcs.insert(field, value);
		}
		for (reg, value) in exit.regs {
			self.regs.insert(reg, value);
		}
	}
}

impl VirtualCpu for MockCpu {
	fn read_vmcs(&self, field: u32) -> Result<u64> {
		Ok(self.vmcs.get(&field).copied().unwrap_or(0))
	}

	fn write_vmcs(&mut self, field: u32, value: u64) -> Result<()> {
		self.vmcs.insert(field, value);
		Ok(())
	}

	fn read_reg(&self, reg: Reg) -> Result<u64> {
		Ok(self.regs.get(&reg).copied().unwrap_or(0))
	}

	fn write_reg(&mut self, reg: Reg, value: u64) -> Result<()> {
		self.regs.insert(reg, value);
		Ok(())
	}

	fn enable_native_msr(&mut self, _msr: u32, _enable: bool) -> Result<()> {
		Ok(())
	}

	fn run(&mut self) -> Result<()> {
		let intr_info = self.read_vmcs(VMCS_CTRL_VMENTRY_IRQ_INFO)?;
		self.record.entries.locked().push(MockEntry {
			rip: self.read_reg(Reg::Rip)?,
			intr_info,
			errcode: self.read_vmcs(VMCS_CTRL_VMENTRY_EXC_ERROR)?,
			rflags: self.read_reg(Reg::Rflags)?,
		});
		*self.record.final_regs.locked() = self.regs.clone();
		*self.record.final_vmcs.locked() = self.vmcs.clone();
		if intr_info & VMCS_INTR_VALID != 0 {
			self.vmcs
				.insert(VMCS_CTRL_VMENTRY_IRQ_INFO, intr_info & !VMCS_INTR_VALID);
		}

		let exit = self.script.pop_front().unwrap_or_else(|| {
			MockExit::new(reason::HLT)
				.inst_len(1)
				.reg(Reg::Rflags, PSL_RESERVED_ONE)
		});
		if let Some(delay) = exit.delay {
			thread::sleep(delay);
		}
		self.deliver(exit);
		Ok(())
	}

	fn kicker(&self) -> Arc<dyn Kick> {
		Arc::new(MockKick(self.record.clone()))
	}
}
