use std::{fs, sync::Arc};

use byte_unit::{Byte, Unit};
use criterion::{Criterion, criterion_group};
use xhvlib::{
	firmware::Firmware,
	params::Params,
	runner::VmRunner,
	vmx::mock::MockBackend,
};

/// Creates, boots and halts a single-vCPU VM on the scripted backend.
pub fn boot_and_halt(c: &mut Criterion) {
	let dir = tempfile::tempdir().unwrap();
	let rom = dir.path().join("rom.bin");
	fs::write(&rom, [0xf4u8; 0x1000]).unwrap();
	let params = Params {
		memory_size: Byte::from_u64_with_unit(64, Unit::MiB)
			.unwrap()
			.as_u64()
			.try_into()
			.unwrap(),
		firmware: Some(Firmware::Bootrom(rom)),
		..Default::default()
	};

	c.bench_function("vm::boot_and_halt(bootrom, 64 MiB)", |b| {
		b.iter(|| {
			let runner = VmRunner::new(Arc::new(MockBackend::new()), &params).unwrap();
			assert_eq!(runner.run().code, 0);
		})
	});
}

criterion_group!(boot_benchmark_group, boot_and_halt);
