use std::hint::black_box;

use criterion::{Criterion, criterion_group};
use xhvlib::{
	error::Result,
	emulate::{
		CpuMode, Seg, SegDesc, VieCpu, Vie,
		decode::{VIE_INVALID_GLA, decode_instruction},
	},
	vmx::backend::Reg,
};

struct Flat;

impl VieCpu for Flat {
	fn reg(&self, _: Reg) -> Result<u64> {
		Ok(0)
	}

	fn set_reg(&mut self, _: Reg, _: u64) -> Result<()> {
		Ok(())
	}

	fn seg_desc(&self, _: Seg) -> Result<SegDesc> {
		Ok(SegDesc::default())
	}
}

pub fn decode_mmio_accesses(c: &mut Criterion) {
	// Typical LAPIC/IOAPIC/virtio register accesses.
	let instructions: [(&str, &[u8]); 4] = [
		("mov %eax,0xb0(%rbx)", &[0x89, 0x83, 0xb0, 0x00, 0x00, 0x00]),
		("mov 0x10(%rdi),%ecx", &[0x8b, 0x4f, 0x10]),
		("movzwl (%rsi),%eax", &[0x0f, 0xb7, 0x06]),
		("movl $0x1,0x14(%rdx)", &[0xc7, 0x42, 0x14, 0x01, 0x00, 0x00, 0x00]),
	];
	let mut group = c.benchmark_group("emulate::decode_instruction");
	for (name, bytes) in instructions {
		group.bench_function(name, |b| {
			b.iter(|| {
				let mut vie = Vie::new(black_box(bytes));
				decode_instruction(&mut vie, &Flat, VIE_INVALID_GLA, CpuMode::Long, false).unwrap();
				vie
			})
		});
	}
	group.finish();
}

criterion_group!(decode_benchmark_group, decode_mmio_accesses);
