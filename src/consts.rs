pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SHIFT: u32 = 12;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;

/// Upper bound on vCPUs per VM.
pub const VM_MAXCPU: usize = 32;
pub const BSP: usize = 0;

/// Guest RAM below this address; everything larger is remapped above 4 GiB.
pub const LOWMEM_LIMIT: u64 = 3 * GIB;
pub const HIGHMEM_BASE: u64 = 4 * GIB;
pub const MAX_MEM_SEGMENTS: usize = 4;

pub const APIC_DEFAULT_BASE: u64 = 0xfee0_0000;
pub const IOAPIC_BASE: u64 = 0xfec0_0000;
pub const IOAPIC_SIZE: u64 = 0x1000;
pub const HPET_BASE: u64 = 0xfed0_0000;
pub const HPET_SIZE: u64 = 0x400;

/// Maximum length of an x86 instruction.
pub const VIE_INST_SIZE: usize = 15;

// Exception vectors
pub const IDT_DE: u8 = 0;
pub const IDT_DB: u8 = 1;
pub const IDT_NMI: u8 = 2;
pub const IDT_BP: u8 = 3;
pub const IDT_OF: u8 = 4;
pub const IDT_BR: u8 = 5;
pub const IDT_UD: u8 = 6;
pub const IDT_NM: u8 = 7;
pub const IDT_DF: u8 = 8;
pub const IDT_TS: u8 = 10;
pub const IDT_NP: u8 = 11;
pub const IDT_SS: u8 = 12;
pub const IDT_GP: u8 = 13;
pub const IDT_PF: u8 = 14;
pub const IDT_MF: u8 = 16;
pub const IDT_AC: u8 = 17;
pub const IDT_MC: u8 = 18;
pub const IDT_XF: u8 = 19;
pub const IDT_VE: u8 = 20;

// RFLAGS
pub const PSL_C: u64 = 1 << 0;
pub const PSL_PF: u64 = 1 << 2;
pub const PSL_AF: u64 = 1 << 4;
pub const PSL_Z: u64 = 1 << 6;
pub const PSL_N: u64 = 1 << 7;
pub const PSL_T: u64 = 1 << 8;
pub const PSL_I: u64 = 1 << 9;
pub const PSL_D: u64 = 1 << 10;
pub const PSL_V: u64 = 1 << 11;
pub const PSL_AC: u64 = 1 << 18;
pub const PSL_RESERVED_ONE: u64 = 1 << 1;

// Control registers
pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_NW: u64 = 1 << 29;
pub const CR0_CD: u64 = 1 << 30;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_VMXE: u64 = 1 << 13;
pub const CR4_OSXSAVE: u64 = 1 << 18;
pub const CR4_SMEP: u64 = 1 << 20;
pub const CR4_PKE: u64 = 1 << 22;

pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

// XCR0 feature bits
pub const XFEATURE_X87: u64 = 1 << 0;
pub const XFEATURE_SSE: u64 = 1 << 1;
pub const XFEATURE_AVX: u64 = 1 << 2;
pub const XFEATURE_BNDREGS: u64 = 1 << 3;
pub const XFEATURE_BNDCSR: u64 = 1 << 4;
pub const XFEATURE_AVX512: u64 = 0xe0;

/// Extracted from `x86::msr`.
pub mod msr {
	pub const TSC: u32 = 0x10;
	pub const IA32_APIC_BASE: u32 = 0x1b;
	pub const MTRR_CAP: u32 = 0xfe;
	pub const IA32_SYSENTER_CS: u32 = 0x174;
	pub const IA32_SYSENTER_ESP: u32 = 0x175;
	pub const IA32_SYSENTER_EIP: u32 = 0x176;
	pub const MCG_CAP: u32 = 0x179;
	pub const MCG_STATUS: u32 = 0x17a;
	pub const IA32_MISC_ENABLE: u32 = 0x1a0;
	pub const TURBO_RATIO_LIMIT: u32 = 0x1ad;
	pub const TURBO_RATIO_LIMIT1: u32 = 0x1ae;
	pub const PLATFORM_INFO: u32 = 0xce;
	pub const MTRR_VAR_BASE: u32 = 0x200;
	pub const MTRR_VAR_LAST: u32 = 0x20f;
	pub const MTRR_64K_BASE: u32 = 0x250;
	pub const MTRR_16K_BASE: u32 = 0x258;
	pub const MTRR_16K_LAST: u32 = 0x259;
	pub const MTRR_4K_BASE: u32 = 0x268;
	pub const MTRR_4K_LAST: u32 = 0x26f;
	pub const IA32_PAT: u32 = 0x277;
	pub const MTRR_DEF_TYPE: u32 = 0x2ff;
	pub const X2APIC_BASE: u32 = 0x800;
	pub const X2APIC_LAST: u32 = 0x8ff;
	pub const IA32_EFER: u32 = 0xc000_0080;
	pub const IA32_STAR: u32 = 0xc000_0081;
	pub const IA32_LSTAR: u32 = 0xc000_0082;
	pub const IA32_CSTAR: u32 = 0xc000_0083;
	pub const IA32_FMASK: u32 = 0xc000_0084;
	pub const IA32_FS_BASE: u32 = 0xc000_0100;
	pub const IA32_GS_BASE: u32 = 0xc000_0101;
	pub const IA32_KERNEL_GSBASE: u32 = 0xc000_0102;
	pub const IA32_TSC_AUX: u32 = 0xc000_0103;
}
