//! VMCS field encodings and bit layouts (Intel SDM Vol. 3, Appendix B).
#![allow(dead_code)]

// 16-bit guest state
pub const VMCS_GUEST_ES: u32 = 0x0800;
pub const VMCS_GUEST_CS: u32 = 0x0802;
pub const VMCS_GUEST_SS: u32 = 0x0804;
pub const VMCS_GUEST_DS: u32 = 0x0806;
pub const VMCS_GUEST_FS: u32 = 0x0808;
pub const VMCS_GUEST_GS: u32 = 0x080a;
pub const VMCS_GUEST_LDTR: u32 = 0x080c;
pub const VMCS_GUEST_TR: u32 = 0x080e;

// 64-bit control and guest fields
pub const VMCS_CTRL_TSC_OFFSET: u32 = 0x2010;
pub const VMCS_CTRL_VIRTUAL_APIC: u32 = 0x2012;
pub const VMCS_CTRL_APIC_ACCESS: u32 = 0x2014;
pub const VMCS_GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
pub const VMCS_GUEST_LINK_POINTER: u32 = 0x2800;
pub const VMCS_GUEST_IA32_DEBUGCTL: u32 = 0x2802;
pub const VMCS_GUEST_IA32_PAT: u32 = 0x2804;
pub const VMCS_GUEST_IA32_EFER: u32 = 0x2806;
pub const VMCS_GUEST_PDPTE0: u32 = 0x280a;
pub const VMCS_GUEST_PDPTE1: u32 = 0x280c;
pub const VMCS_GUEST_PDPTE2: u32 = 0x280e;
pub const VMCS_GUEST_PDPTE3: u32 = 0x2810;

// 32-bit controls
pub const VMCS_CTRL_PIN_BASED: u32 = 0x4000;
pub const VMCS_CTRL_CPU_BASED: u32 = 0x4002;
pub const VMCS_CTRL_EXC_BITMAP: u32 = 0x4004;
pub const VMCS_CTRL_VMEXIT_CONTROLS: u32 = 0x400c;
pub const VMCS_CTRL_VMENTRY_CONTROLS: u32 = 0x4012;
pub const VMCS_CTRL_VMENTRY_IRQ_INFO: u32 = 0x4016;
pub const VMCS_CTRL_VMENTRY_EXC_ERROR: u32 = 0x4018;
pub const VMCS_CTRL_VMENTRY_INSTR_LEN: u32 = 0x401a;
pub const VMCS_CTRL_TPR_THRESHOLD: u32 = 0x401c;
pub const VMCS_CTRL_CPU_BASED2: u32 = 0x401e;

// 32-bit read-only exit information
pub const VMCS_RO_INSTR_ERROR: u32 = 0x4400;
pub const VMCS_RO_EXIT_REASON: u32 = 0x4402;
pub const VMCS_RO_VMEXIT_IRQ_INFO: u32 = 0x4404;
pub const VMCS_RO_VMEXIT_IRQ_ERROR: u32 = 0x4406;
pub const VMCS_RO_IDT_VECTOR_INFO: u32 = 0x4408;
pub const VMCS_RO_IDT_VECTOR_ERROR: u32 = 0x440a;
pub const VMCS_RO_VMEXIT_INSTR_LEN: u32 = 0x440c;
pub const VMCS_RO_VMX_INSTR_INFO: u32 = 0x440e;

// 32-bit guest state
pub const VMCS_GUEST_ES_LIMIT: u32 = 0x4800;
pub const VMCS_GUEST_CS_LIMIT: u32 = 0x4802;
pub const VMCS_GUEST_SS_LIMIT: u32 = 0x4804;
pub const VMCS_GUEST_DS_LIMIT: u32 = 0x4806;
pub const VMCS_GUEST_FS_LIMIT: u32 = 0x4808;
pub const VMCS_GUEST_GS_LIMIT: u32 = 0x480a;
pub const VMCS_GUEST_LDTR_LIMIT: u32 = 0x480c;
pub const VMCS_GUEST_TR_LIMIT: u32 = 0x480e;
pub const VMCS_GUEST_GDTR_LIMIT: u32 = 0x4810;
pub const VMCS_GUEST_IDTR_LIMIT: u32 = 0x4812;
pub const VMCS_GUEST_ES_AR: u32 = 0x4814;
pub const VMCS_GUEST_CS_AR: u32 = 0x4816;
pub const VMCS_GUEST_SS_AR: u32 = 0x4818;
pub const VMCS_GUEST_DS_AR: u32 = 0x481a;
pub const VMCS_GUEST_FS_AR: u32 = 0x481c;
pub const VMCS_GUEST_GS_AR: u32 = 0x481e;
pub const VMCS_GUEST_LDTR_AR: u32 = 0x4820;
pub const VMCS_GUEST_TR_AR: u32 = 0x4822;
pub const VMCS_GUEST_IGNORE_IRQ: u32 = 0x4824;
pub const VMCS_GUEST_ACTIVITY_STATE: u32 = 0x4826;
pub const VMCS_GUEST_SYSENTER_CS: u32 = 0x482a;

// Natural-width controls
pub const VMCS_CTRL_CR0_MASK: u32 = 0x6000;
pub const VMCS_CTRL_CR4_MASK: u32 = 0x6002;
pub const VMCS_CTRL_CR0_SHADOW: u32 = 0x6004;
pub const VMCS_CTRL_CR4_SHADOW: u32 = 0x6006;

// Natural-width read-only
pub const VMCS_RO_EXIT_QUALIFIC: u32 = 0x6400;
pub const VMCS_RO_GUEST_LIN_ADDR: u32 = 0x640a;

// Natural-width guest state
pub const VMCS_GUEST_CR0: u32 = 0x6800;
pub const VMCS_GUEST_CR3: u32 = 0x6802;
pub const VMCS_GUEST_CR4: u32 = 0x6804;
pub const VMCS_GUEST_ES_BASE: u32 = 0x6806;
pub const VMCS_GUEST_CS_BASE: u32 = 0x6808;
pub const VMCS_GUEST_SS_BASE: u32 = 0x680a;
pub const VMCS_GUEST_DS_BASE: u32 = 0x680c;
pub const VMCS_GUEST_FS_BASE: u32 = 0x680e;
pub const VMCS_GUEST_GS_BASE: u32 = 0x6810;
pub const VMCS_GUEST_LDTR_BASE: u32 = 0x6812;
pub const VMCS_GUEST_TR_BASE: u32 = 0x6814;
pub const VMCS_GUEST_GDTR_BASE: u32 = 0x6816;
pub const VMCS_GUEST_IDTR_BASE: u32 = 0x6818;
pub const VMCS_GUEST_DR7: u32 = 0x681a;
pub const VMCS_GUEST_RSP: u32 = 0x681c;
pub const VMCS_GUEST_RIP: u32 = 0x681e;
pub const VMCS_GUEST_RFLAGS: u32 = 0x6820;
pub const VMCS_GUEST_SYSENTER_ESP: u32 = 0x6824;
pub const VMCS_GUEST_SYSENTER_EIP: u32 = 0x6826;

// Pin-based controls
pub const PIN_BASED_INTR: u64 = 1 << 0;
pub const PIN_BASED_NMI: u64 = 1 << 3;
pub const PIN_BASED_VIRTUAL_NMI: u64 = 1 << 5;
pub const PIN_BASED_PREEMPTION_TIMER: u64 = 1 << 6;

// Primary processor-based controls
pub const CPU_BASED_IRQ_WND: u64 = 1 << 2;
pub const CPU_BASED_TSC_OFFSET: u64 = 1 << 3;
pub const CPU_BASED_HLT: u64 = 1 << 7;
pub const CPU_BASED_INVLPG: u64 = 1 << 9;
pub const CPU_BASED_MWAIT: u64 = 1 << 10;
pub const CPU_BASED_RDPMC: u64 = 1 << 11;
pub const CPU_BASED_RDTSC: u64 = 1 << 12;
pub const CPU_BASED_CR3_LOAD: u64 = 1 << 15;
pub const CPU_BASED_CR3_STORE: u64 = 1 << 16;
pub const CPU_BASED_CR8_LOAD: u64 = 1 << 19;
pub const CPU_BASED_CR8_STORE: u64 = 1 << 20;
pub const CPU_BASED_TPR_SHADOW: u64 = 1 << 21;
pub const CPU_BASED_VIRTUAL_NMI_WND: u64 = 1 << 22;
pub const CPU_BASED_MOV_DR: u64 = 1 << 23;
pub const CPU_BASED_UNCOND_IO: u64 = 1 << 24;
pub const CPU_BASED_IO_BITMAPS: u64 = 1 << 25;
pub const CPU_BASED_MTF: u64 = 1 << 27;
pub const CPU_BASED_MSR_BITMAPS: u64 = 1 << 28;
pub const CPU_BASED_MONITOR: u64 = 1 << 29;
pub const CPU_BASED_PAUSE: u64 = 1 << 30;
pub const CPU_BASED_SECONDARY_CTLS: u64 = 1 << 31;

// Secondary processor-based controls
pub const CPU_BASED2_VIRTUAL_APIC: u64 = 1 << 0;
pub const CPU_BASED2_EPT: u64 = 1 << 1;
pub const CPU_BASED2_DESC_TABLE: u64 = 1 << 2;
pub const CPU_BASED2_RDTSCP: u64 = 1 << 3;
pub const CPU_BASED2_VPID: u64 = 1 << 5;
pub const CPU_BASED2_WBINVD: u64 = 1 << 6;
pub const CPU_BASED2_UNRESTRICTED: u64 = 1 << 7;
pub const CPU_BASED2_PAUSE_LOOP: u64 = 1 << 10;
pub const CPU_BASED2_RDRAND: u64 = 1 << 11;
pub const CPU_BASED2_INVPCID: u64 = 1 << 12;
pub const CPU_BASED2_RDSEED: u64 = 1 << 16;

// VM-exit controls
pub const VMEXIT_HOST_IA32E: u64 = 1 << 9;
pub const VMEXIT_LOAD_EFER: u64 = 1 << 21;
pub const VMEXIT_SAVE_PREEMPTION_TIMER: u64 = 1 << 22;

// VM-entry controls
pub const VMENTRY_GUEST_IA32E: u64 = 1 << 9;
pub const VMENTRY_SMM: u64 = 1 << 10;
pub const VMENTRY_DEACTIVATE_DUAL_MONITOR: u64 = 1 << 11;
pub const VMENTRY_LOAD_EFER: u64 = 1 << 15;

// Interruptibility state
pub const INTERRUPTIBILITY_STI_BLOCKING: u64 = 1 << 0;
pub const INTERRUPTIBILITY_MOVSS_BLOCKING: u64 = 1 << 1;
pub const INTERRUPTIBILITY_SMI_BLOCKING: u64 = 1 << 2;
pub const INTERRUPTIBILITY_NMI_BLOCKING: u64 = 1 << 3;
pub const HWINTR_BLOCKING: u64 = INTERRUPTIBILITY_STI_BLOCKING | INTERRUPTIBILITY_MOVSS_BLOCKING;
pub const NMI_BLOCKING: u64 = INTERRUPTIBILITY_NMI_BLOCKING | INTERRUPTIBILITY_MOVSS_BLOCKING;

// VM-entry / exit interruption information
pub const VMCS_INTR_VALID: u64 = 1 << 31;
pub const VMCS_INTR_T_MASK: u64 = 0x700;
pub const VMCS_INTR_T_HWINTR: u64 = 0 << 8;
pub const VMCS_INTR_T_NMI: u64 = 2 << 8;
pub const VMCS_INTR_T_HWEXCEPTION: u64 = 3 << 8;
pub const VMCS_INTR_T_SWINTR: u64 = 4 << 8;
pub const VMCS_INTR_T_PRIV_SWEXCEPTION: u64 = 5 << 8;
pub const VMCS_INTR_T_SWEXCEPTION: u64 = 6 << 8;
pub const VMCS_INTR_DEL_ERRCODE: u64 = 1 << 11;
pub const VMCS_IDT_VEC_ERRCODE_VALID: u64 = 1 << 11;
pub const VMCS_IDT_VEC_VALID: u64 = 1 << 31;
/// "NMI unblocking due to IRET" in exit qualification / intr info.
pub const VMCS_INTR_NMI_UNBLOCKING: u64 = 1 << 12;

// EPT violation qualification
pub const EPT_VIOLATION_DATA_READ: u64 = 1 << 0;
pub const EPT_VIOLATION_DATA_WRITE: u64 = 1 << 1;
pub const EPT_VIOLATION_INST_FETCH: u64 = 1 << 2;
pub const EPT_VIOLATION_GLA_VALID: u64 = 1 << 7;
pub const EPT_VIOLATION_XLAT_VALID: u64 = 1 << 8;

/// Basic exit reasons.
pub mod reason {
	pub const EXC_NMI: u32 = 0;
	pub const IRQ: u32 = 1;
	pub const TRIPLE_FAULT: u32 = 2;
	pub const INIT: u32 = 3;
	pub const SIPI: u32 = 4;
	pub const IRQ_WND: u32 = 7;
	pub const VIRTUAL_NMI_WND: u32 = 8;
	pub const TASK: u32 = 9;
	pub const CPUID: u32 = 10;
	pub const HLT: u32 = 12;
	pub const INVD: u32 = 13;
	pub const INVLPG: u32 = 14;
	pub const RDPMC: u32 = 15;
	pub const RDTSC: u32 = 16;
	pub const VMCALL: u32 = 18;
	pub const VMCLEAR: u32 = 19;
	pub const VMLAUNCH: u32 = 20;
	pub const VMPTRLD: u32 = 21;
	pub const VMPTRST: u32 = 22;
	pub const VMREAD: u32 = 23;
	pub const VMRESUME: u32 = 24;
	pub const VMWRITE: u32 = 25;
	pub const VMXOFF: u32 = 26;
	pub const VMXON: u32 = 27;
	pub const MOV_CR: u32 = 28;
	pub const MOV_DR: u32 = 29;
	pub const IO: u32 = 30;
	pub const RDMSR: u32 = 31;
	pub const WRMSR: u32 = 32;
	pub const VMENTRY_GUEST: u32 = 33;
	pub const VMENTRY_MSR: u32 = 34;
	pub const MWAIT: u32 = 36;
	pub const MTF: u32 = 37;
	pub const MONITOR: u32 = 39;
	pub const PAUSE: u32 = 40;
	pub const VMENTRY_MC: u32 = 41;
	pub const TPR_THRESHOLD: u32 = 43;
	pub const APIC_ACCESS: u32 = 44;
	pub const VIRTUALIZED_EOI: u32 = 45;
	pub const GDTR_IDTR: u32 = 46;
	pub const LDTR_TR: u32 = 47;
	pub const EPT_VIOLATION: u32 = 48;
	pub const EPT_MISCONFIG: u32 = 49;
	pub const INVEPT: u32 = 50;
	pub const RDTSCP: u32 = 51;
	pub const INVVPID: u32 = 53;
	pub const WBINVD: u32 = 54;
	pub const XSETBV: u32 = 55;
	pub const APIC_WRITE: u32 = 56;
	pub const RDRAND: u32 = 57;
	pub const INVPCID: u32 = 58;
	pub const VMFUNC: u32 = 59;
	pub const RDSEED: u32 = 61;

	/// Bit 31 of the exit reason field: the VM entry itself failed.
	pub const ENTRY_FAIL: u32 = 1 << 31;
}

/// Access rights: the segment is unusable.
pub const SEG_AR_UNUSABLE: u64 = 1 << 16;
