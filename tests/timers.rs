mod common;

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use common::*;
use xhvlib::{
	Vm,
	runner::{EXIT_POWEROFF, VmRunner},
	vmx::mock::MockBackend,
};

const HPET_FREQ: u64 = 1 << 24;
const HPET_CONFIG: u64 = 0x10;
const HPET_ENABLE: u64 = 1;
const TIMER0_CONFIG: u64 = 0x100;
const TIMER0_COMPARATOR: u64 = 0x108;
const TIMER_PERIODIC: u64 = 0x8;
const TIMER_INT_ENB: u64 = 0x4;
const TIMER_VAL_SET: u64 = 0x40;

#[test]
fn hpet_periodic_interrupts() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let backend = Arc::new(MockBackend::new().script(0, interrupt_loop(50)));
	let mut params = params(bootrom(dir.path()));
	params.x2apic = true;
	let runner = VmRunner::new(backend.clone(), &params).unwrap();

	let vm = runner.vm().clone();
	route_ioapic_pin(&vm, 2, 0x40);
	let hpet = vm.hpet();
	let route = 2 << 9;
	hpet.mmio_write(
		&vm,
		TIMER0_CONFIG,
		4,
		route | TIMER_PERIODIC | TIMER_INT_ENB | TIMER_VAL_SET,
	)
	.unwrap();
	// 100 Hz
	hpet.mmio_write(&vm, TIMER0_COMPARATOR, 4, HPET_FREQ / 100)
		.unwrap();

	let start = Instant::now();
	hpet.mmio_write(&vm, HPET_CONFIG, 4, HPET_ENABLE).unwrap();
	let result = runner.run();
	let elapsed = start.elapsed();
	assert_eq!(result.code, EXIT_POWEROFF);

	let vectors = injected_vectors(&backend.record(0));
	let ticks = vectors.iter().filter(|v| **v == 0x40).count();
	assert!(ticks >= 50, "only {ticks} timer interrupts");
	assert!(
		(Duration::from_millis(450)..Duration::from_secs(3)).contains(&elapsed),
		"50 ticks at 100 Hz took {elapsed:?}"
	);
}

const RTC_SEC: u8 = 0x00;
const RTC_SEC_ALARM: u8 = 0x01;
const RTC_MIN_ALARM: u8 = 0x03;
const RTC_HOUR_ALARM: u8 = 0x05;
const RTC_STATUSB: u8 = 0x0b;
const RTC_INTR: u8 = 0x0c;
const STATUSB_AINTR: u8 = 0x20;
const STATUSB_BIN: u8 = 0x04;
const STATUSB_24HR: u8 = 0x02;
const ALARM_DONT_CARE: u8 = 0xc0;

fn rtc_write(vm: &Vm, reg: u8, val: u8) {
	let mut eax = reg as u32;
	vm.inout().dispatch(vm, 0, false, 0x70, 1, &mut eax).unwrap();
	let mut eax = val as u32;
	vm.inout().dispatch(vm, 0, false, 0x71, 1, &mut eax).unwrap();
}

fn rtc_read(vm: &Vm, reg: u8) -> u8 {
	let mut eax = reg as u32;
	vm.inout().dispatch(vm, 0, false, 0x70, 1, &mut eax).unwrap();
	vm.inout().dispatch(vm, 0, true, 0x71, 1, &mut eax).unwrap();
	eax as u8
}

#[test]
fn rtc_alarm_fires() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let backend = Arc::new(MockBackend::new().script(0, interrupt_loop(1)));
	let mut params = params(bootrom(dir.path()));
	params.x2apic = true;
	let runner = VmRunner::new(backend.clone(), &params).unwrap();

	let vm = runner.vm().clone();
	route_ioapic_pin(&vm, 8, 0x48);
	rtc_write(&vm, RTC_STATUSB, STATUSB_BIN | STATUSB_24HR);
	rtc_read(&vm, RTC_INTR);

	// Start right after a second boundary.
	let first = rtc_read(&vm, RTC_SEC);
	let deadline = Instant::now() + Duration::from_secs(3);
	let mut sec = first;
	while sec == first && Instant::now() < deadline {
		std::thread::sleep(Duration::from_millis(5));
		sec = rtc_read(&vm, RTC_SEC);
	}
	assert_ne!(sec, first, "RTC is not ticking");

	rtc_write(&vm, RTC_SEC_ALARM, (sec + 2) % 60);
	rtc_write(&vm, RTC_MIN_ALARM, ALARM_DONT_CARE);
	rtc_write(&vm, RTC_HOUR_ALARM, ALARM_DONT_CARE);
	let start = Instant::now();
	rtc_write(&vm, RTC_STATUSB, STATUSB_BIN | STATUSB_24HR | STATUSB_AINTR);

	let result = runner.run();
	let elapsed = start.elapsed();
	assert_eq!(result.code, EXIT_POWEROFF);
	assert_eq!(injected_vectors(&backend.record(0)), [0x48]);
	assert!(
		(Duration::from_millis(900)..Duration::from_secs(5)).contains(&elapsed),
		"alarm two seconds out fired after {elapsed:?}"
	);
}
