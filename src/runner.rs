//! Runs a configured VM to completion: one host thread per vCPU, the exits
//! the VM hands back to its owner, control requests and the exit code.

use std::{
	sync::{
		Arc,
		mpsc::{self, Receiver, Sender},
	},
	thread,
};

use core_affinity::CoreId;

use crate::{
	consts::BSP,
	control::ControlMsg,
	error::{Result, VmmError},
	firmware::{self, BootState},
	params::Params,
	pci,
	stats::{CpuStats, VmStats},
	vm::{SuspendHow, VcpuState, Vm, X2apicState},
	vmx::{ExitKind, VmxExitInfo, VmxVcpu, backend::Backend, backend::Reg},
};

pub const EXIT_POWEROFF: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_RESET: i32 = 2;
pub const EXIT_TRIPLE_FAULT: i32 = 3;
pub const EXIT_INVALID_SUSPEND: i32 = 100;

/// The process exit code for a VM that stopped for `how`.
pub fn exit_code(how: SuspendHow) -> i32 {
	match how {
		SuspendHow::Poweroff | SuspendHow::Halt => EXIT_POWEROFF,
		SuspendHow::Reset => EXIT_RESET,
		SuspendHow::TripleFault => EXIT_TRIPLE_FAULT,
		SuspendHow::None => EXIT_INVALID_SUSPEND,
	}
}

/// The hypervisor of the host, if it has one.
#[cfg(target_os = "macos")]
pub fn host_backend() -> Result<Arc<dyn Backend>> {
	Ok(Arc::new(crate::macos::HvfBackend::new()?))
}

/// The hypervisor of the host, if it has one.
#[cfg(not(target_os = "macos"))]
pub fn host_backend() -> Result<Arc<dyn Backend>> {
	Err(VmmError::Unsupported("hardware virtualization"))
}

enum Event {
	Control(ControlMsg),
	Started(usize),
	Finished {
		vcpu: usize,
		result: Result<SuspendHow>,
		stats: CpuStats,
	},
}

/// How a vCPU thread enters the guest.
#[derive(Debug, Clone, Copy)]
enum Start {
	Boot,
	Sipi(u64),
}

struct Shared {
	vm: Arc<Vm>,
	boot: BootState,
	affinity: Option<Vec<CoreId>>,
	events: Sender<Event>,
}

/// Sends control requests to a running [`VmRunner`].
#[derive(Clone)]
pub struct Controller(Sender<Event>);

impl Controller {
	/// Returns false once the VM has finished.
	pub fn send(&self, msg: ControlMsg) -> bool {
		self.0.send(Event::Control(msg)).is_ok()
	}
}

/// What became of a VM.
#[derive(Debug)]
pub struct VmResult {
	pub code: i32,
	pub how: SuspendHow,
	/// The first vCPU failure, if any.
	pub error: Option<VmmError>,
	pub stats: Option<VmStats>,
}

pub struct VmRunner {
	shared: Arc<Shared>,
	events: Receiver<Event>,
	stats: bool,
}

impl VmRunner {
	/// Builds the VM described by `params`: memory, PCI devices and firmware.
	pub fn new(backend: Arc<dyn Backend>, params: &Params) -> Result<Self> {
		if params.acpi {
			return Err(VmmError::InvalidArgument(
				"ACPI tables are not supported, drop -A".into(),
			));
		}
		if let Some(port) = params.gdb_port {
			return Err(VmmError::InvalidArgument(format!(
				"no debug server available for port {port}"
			)));
		}
		let firmware = params
			.firmware
			.as_ref()
			.ok_or_else(|| VmmError::InvalidArgument("no firmware given (-f)".into()))?;

		let vm = Vm::create(backend, params.vm_config())?;
		vm.setup_memory(params.memory_size.get())?;
		pci::init(&vm, &params.slots, &params.lpc)?;
		let boot = firmware::load(&vm, firmware)?;
		info!(
			"VM with {} vCPU(s) and {} ready",
			vm.ncpus(),
			params.memory_size
		);

		let (events, rx) = mpsc::channel();
		Ok(Self {
			shared: Arc::new(Shared {
				vm,
				boot,
				affinity: params.affinity.clone(),
				events,
			}),
			events: rx,
			stats: params.stats,
		})
	}

	pub fn vm(&self) -> &Arc<Vm> {
		&self.shared.vm
	}

	pub fn boot_state(&self) -> &BootState {
		&self.shared.boot
	}

	pub fn controller(&self) -> Controller {
		Controller(self.shared.events.clone())
	}

	/// Starts the boot processor and blocks until every vCPU thread is done.
	pub fn run(self) -> VmResult {
		let vm = self.shared.vm.clone();
		let mut running = 0usize;
		let mut failure = None;
		let mut cpu_stats = Vec::new();

		match vm.activate_cpu(BSP) {
			Ok(()) => spawn_vcpu(&self.shared, BSP, Start::Boot),
			Err(err) => failure = Some(err),
		}

		// `self.shared` holds a sender, so `recv` only fails if nothing started.
		while failure.is_none() || running > 0 {
			let Ok(event) = self.events.recv() else {
				break;
			};
			match event {
				Event::Started(vcpu) => {
					running += 1;
					debug!("vCPU {vcpu} started, {running} running");
				}
				Event::Finished {
					vcpu,
					result,
					stats,
				} => {
					running = running.saturating_sub(1);
					cpu_stats.push(stats);
					match result {
						Ok(how) => debug!("vCPU {vcpu} stopped: {how:?}"),
						Err(err) => {
							error!("vCPU {vcpu} failed: {err}");
							if failure.is_none() {
								let _ = vm.suspend(SuspendHow::Poweroff);
								vm.destroy();
								failure = Some(err);
							}
						}
					}
					if running == 0 {
						break;
					}
				}
				Event::Control(msg) => self.control(msg),
			}
		}

		let how = vm.suspend_state();
		vm.destroy();
		let code = if failure.is_some() {
			EXIT_ERROR
		} else {
			exit_code(how)
		};
		info!("VM finished: {how:?}, exit code {code}");
		VmResult {
			code,
			how,
			error: failure,
			stats: self.stats.then(|| VmStats::new(&cpu_stats)),
		}
	}

	fn control(&self, msg: ControlMsg) {
		let vm = &self.shared.vm;
		let res = match msg {
			ControlMsg::Pause => vm.pause(true),
			ControlMsg::Resume => vm.pause(false),
			ControlMsg::Shutdown if vm.is_suspended() => {
				warn!("shutdown requested again, tearing the VM down");
				vm.destroy();
				Ok(())
			}
			ControlMsg::Shutdown => vm
				.pause(false)
				.and_then(|()| vm.suspend(SuspendHow::Poweroff)),
		};
		if let Err(err) = res {
			warn!("{msg:?} failed: {err}");
		}
	}
}

fn spawn_vcpu(shared: &Arc<Shared>, id: usize, start: Start) {
	let _ = shared.events.send(Event::Started(id));
	let thread_shared = shared.clone();
	let spawned = thread::Builder::new()
		.name(format!("vcpu:{id}"))
		.spawn(move || {
			let shared = thread_shared;
			if let Some(core) = shared.affinity.as_ref().and_then(|a| a.get(id)) {
				if core_affinity::set_for_current(*core) {
					debug!("vCPU {id} pinned to core {}", core.id);
				} else {
					warn!("could not pin vCPU {id} to core {}", core.id);
				}
			}
			let (result, stats) = vcpu_thread(&shared, id, start);
			let _ = shared.events.send(Event::Finished {
				vcpu: id,
				result,
				stats,
			});
		});
	if let Err(err) = spawned {
		let _ = shared.events.send(Event::Finished {
			vcpu: id,
			result: Err(err.into()),
			stats: CpuStats::new(id),
		});
	}
}

fn vcpu_thread(shared: &Arc<Shared>, id: usize, start: Start) -> (Result<SuspendHow>, CpuStats) {
	let mut vcpu = match VmxVcpu::new(shared.vm.clone(), id) {
		Ok(vcpu) => vcpu,
		Err(err) => return (Err(err), CpuStats::new(id)),
	};
	let result = drive(shared, &mut vcpu, start);
	vcpu.stats.stop_time_measurement();
	if result.is_err() {
		error!("vCPU {id} state:\n{}", vcpu.dump());
	}
	let _ = shared.vm.vcpu_set_state(id, VcpuState::Idle, false);
	(result, vcpu.stats.clone())
}

fn drive(shared: &Arc<Shared>, vcpu: &mut VmxVcpu, start: Start) -> Result<SuspendHow> {
	let vm = shared.vm.clone();
	let id = vcpu.id();
	vm.vcpu_set_state(id, VcpuState::Frozen, true)?;
	if vm.config().x2apic {
		vm.set_x2apic_state(id, X2apicState::Enabled)?;
	}
	match start {
		Start::Boot => vcpu.apply_boot_state(&shared.boot)?,
		Start::Sipi(rip) => vcpu.spinup_ap(rip)?,
	}
	vcpu.stats.start_time_measurement();

	loop {
		let exit = vm.run(vcpu)?;
		match exit.kind {
			ExitKind::Suspended { how } => return Ok(how),
			ExitKind::Rdmsr { msr } => {
				warn!("vCPU {id}: rdmsr from unknown MSR {msr:#x}");
				if vm.config().strictmsr {
					vm.inject_gp(vcpu)?;
				} else {
					vcpu.set_reg(Reg::Rax, 0)?;
					vcpu.set_reg(Reg::Rdx, 0)?;
				}
			}
			ExitKind::Wrmsr { msr, value } => {
				warn!("vCPU {id}: wrmsr {value:#x} to unknown MSR {msr:#x}");
				if vm.config().strictmsr {
					vm.inject_gp(vcpu)?;
				}
			}
			ExitKind::SpinupAp { vcpu: target, rip } => spinup(shared, id, target, rip)?,
			ExitKind::Vmx(info) => return Err(unhandled(id, exit.rip, exit.inst_length, info)),
			ExitKind::TaskSwitch(ts) => {
				error!("vCPU {id}: task switch to {:#x} ({:?})", ts.tsssel, ts.reason);
				return Err(VmmError::Unsupported("hardware task switching"));
			}
			ExitKind::Bogus
			| ExitKind::Hlt { .. }
			| ExitKind::Pause
			| ExitKind::Mtrap
			| ExitKind::ReqIdle => {}
			other => {
				return Err(VmmError::Emulation(format!(
					"exit {other:?} at {:#x} was not completed",
					exit.rip
				)));
			}
		}
	}
}

/// Starts `target` in response to a startup IPI from `from`.
fn spinup(shared: &Arc<Shared>, from: usize, target: usize, rip: u64) -> Result<()> {
	let vm = &shared.vm;
	if target == BSP || target >= vm.ncpus() {
		warn!("vCPU {from}: startup IPI to invalid vCPU {target} ignored");
		return Ok(());
	}
	match vm.activate_cpu(target) {
		Ok(()) => {}
		Err(VmmError::Busy(_)) => {
			debug!("vCPU {from}: vCPU {target} is already running");
			return Ok(());
		}
		Err(err) => return Err(err),
	}
	info!("vCPU {from}: starting vCPU {target} at {rip:#x}");
	spawn_vcpu(shared, target, Start::Sipi(rip));
	Ok(())
}

fn unhandled(id: usize, rip: u64, inst_length: u64, info: VmxExitInfo) -> VmmError {
	error!("vCPU {id}: unhandled VMX exit");
	error!("\trip\t\t{rip:#018x}");
	error!("\tinst_length\t{inst_length}");
	error!("\tstatus\t\t{}", info.status);
	error!("\texit_reason\t{}", info.exit_reason);
	error!("\tqualification\t{:#018x}", info.exit_qualification);
	error!("\tinst_type\t{}", info.inst_type);
	error!("\tinst_error\t{}", info.inst_error);
	VmmError::UnhandledExit {
		reason: info.exit_reason,
		qualification: info.exit_qualification,
	}
}

#[cfg(test)]
mod tests {
	use std::{io::Write, path::Path};

	use super::*;
	use crate::{
		consts::{IDT_GP, MIB},
		firmware::Firmware,
		vmx::mock::{MockBackend, MockExit},
		vmx::vmcs::reason,
	};

	fn bootrom(dir: &Path) -> Firmware {
		let path = dir.join("rom.bin");
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_all(&[0xf4; 0x1000]).unwrap();
		Firmware::Bootrom(path)
	}

	fn params(dir: &Path) -> Params {
		Params {
			memory_size: (16 * MIB).try_into().unwrap(),
			firmware: Some(bootrom(dir)),
			..Default::default()
		}
	}

	#[test]
	fn exit_codes() {
		assert_eq!(exit_code(SuspendHow::Poweroff), 0);
		assert_eq!(exit_code(SuspendHow::Halt), 0);
		assert_eq!(exit_code(SuspendHow::Reset), 2);
		assert_eq!(exit_code(SuspendHow::TripleFault), 3);
		assert_eq!(exit_code(SuspendHow::None), 100);
	}

	#[test]
	fn rejects_unsupported_options() {
		let dir = tempfile::tempdir().unwrap();
		let backend = || Arc::new(MockBackend::new()) as Arc<dyn Backend>;
		let acpi = Params {
			acpi: true,
			..params(dir.path())
		};
		assert!(VmRunner::new(backend(), &acpi).is_err());
		let gdb = Params {
			gdb_port: Some(1234),
			..params(dir.path())
		};
		assert!(VmRunner::new(backend(), &gdb).is_err());
		let none = Params {
			firmware: None,
			..params(dir.path())
		};
		assert!(matches!(
			VmRunner::new(backend(), &none),
			Err(VmmError::InvalidArgument(_))
		));
	}

	#[test]
	fn idle_guest_halts() {
		let dir = tempfile::tempdir().unwrap();
		let backend = Arc::new(MockBackend::new());
		let runner = VmRunner::new(backend.clone(), &params(dir.path())).unwrap();
		let result = runner.run();
		assert_eq!(result.how, SuspendHow::Halt);
		assert_eq!(result.code, EXIT_POWEROFF);
		assert!(result.error.is_none());
		assert!(result.stats.is_none());
		assert!(!backend.record(0).entries().is_empty());
	}

	#[test]
	fn unknown_msr_policy() {
		let dir = tempfile::tempdir().unwrap();

		let strict = Arc::new(MockBackend::new().script(
			0,
			vec![MockExit::new(reason::RDMSR).inst_len(2).reg(Reg::Rcx, 0x1234)],
		));
		let result = VmRunner::new(strict.clone(), &params(dir.path()))
			.unwrap()
			.run();
		assert_eq!(result.code, EXIT_POWEROFF);
		let injected = strict.record(0).injected();
		assert_eq!(injected.first().map(|info| info & 0xff), Some(IDT_GP as u64));

		let lenient = Arc::new(MockBackend::new().script(
			0,
			vec![
				MockExit::new(reason::RDMSR)
					.inst_len(2)
					.reg(Reg::Rcx, 0x1234)
					.reg(Reg::Rax, 0xdead)
					.reg(Reg::Rdx, 0xbeef),
			],
		));
		let params = Params {
			ignore_unknown_msr: true,
			stats: true,
			..params(dir.path())
		};
		let result = VmRunner::new(lenient.clone(), &params).unwrap().run();
		assert_eq!(result.code, EXIT_POWEROFF);
		assert!(lenient.record(0).injected().is_empty());
		assert_eq!(lenient.record(0).reg(Reg::Rax), Some(0));
		assert_eq!(lenient.record(0).reg(Reg::Rdx), Some(0));
		assert!(result.stats.is_some());
	}

	#[test]
	fn unhandled_exit_fails() {
		let dir = tempfile::tempdir().unwrap();
		let backend = Arc::new(
			MockBackend::new().script(0, vec![MockExit::new(reason::RDPMC).qual(0x42)]),
		);
		let result = VmRunner::new(backend, &params(dir.path())).unwrap().run();
		assert_eq!(result.code, EXIT_ERROR);
		assert!(matches!(
			result.error,
			Some(VmmError::UnhandledExit {
				qualification: 0x42,
				..
			})
		));
	}
}
