//! The exit record handed from the vCPU run loop to whoever handles it.

use crate::{
	emulate::{GuestPaging, Prot, Seg, SegDesc},
	vm::SuspendHow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InoutExit {
	pub bytes: u8,
	pub is_in: bool,
	pub string: bool,
	pub rep: bool,
	pub port: u16,
	pub eax: u32,
}

/// Collateral of `INS`/`OUTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InoutStrExit {
	pub inout: InoutExit,
	pub paging: GuestPaging,
	pub rflags: u64,
	pub cr0: u64,
	/// RDI for `INS`, RSI for `OUTS`.
	pub index: u64,
	pub count: u64,
	pub addrsize: u8,
	pub seg: Seg,
	pub seg_desc: SegDesc,
}

/// A guest access to memory that is not RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstEmul {
	pub gpa: u64,
	/// Linear address, or `VIE_INVALID_GLA` if the hardware did not report one.
	pub gla: u64,
	pub cs_base: u64,
	pub cs_d: bool,
	pub paging: GuestPaging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchReason {
	Call,
	Iret,
	Jmp,
	IdtGate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSwitch {
	pub reason: TaskSwitchReason,
	pub tsssel: u16,
	/// The switch was caused by an external event.
	pub ext: bool,
	pub errcode: Option<u32>,
	pub paging: GuestPaging,
}

/// Raw VMX exit information for exits nobody handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmxExitInfo {
	pub status: u32,
	pub exit_reason: u32,
	pub exit_qualification: u64,
	pub inst_type: u32,
	pub inst_error: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitKind {
	Inout(InoutExit),
	InoutStr(InoutStrExit),
	Vmx(VmxExitInfo),
	/// Placeholder until the exit has been classified.
	#[default]
	Bogus,
	Rdmsr {
		msr: u32,
	},
	Wrmsr {
		msr: u32,
		value: u64,
	},
	Hlt {
		rflags: u64,
	},
	Mtrap,
	Pause,
	Paging {
		gpa: u64,
		fault_type: Prot,
	},
	InstEmul(InstEmul),
	SpinupAp {
		vcpu: usize,
		rip: u64,
	},
	Rendezvous,
	/// The VM is paused; park before the next entry.
	ReqIdle,
	IoapicEoi {
		vector: u8,
	},
	Suspended {
		how: SuspendHow,
	},
	TaskSwitch(TaskSwitch),
	Monitor,
	Mwait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmExit {
	pub rip: u64,
	pub inst_length: u64,
	pub kind: ExitKind,
}
