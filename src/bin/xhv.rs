#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

use std::{num::ParseIntError, ops::RangeInclusive, path::PathBuf, process, str::FromStr};

use clap::{CommandFactory, Parser, error::ErrorKind};
use core_affinity::CoreId;
use thiserror::Error;
use uuid::Uuid;
use xhvlib::{
	control::{self, Pidfile},
	devices::uart,
	firmware::Firmware,
	params::{CpuCount, GuestMemorySize, Params},
	pci::{SlotSpec, lpc::LpcConfig},
	runner::{self, EXIT_ERROR, VmRunner},
};

#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
	/// Log at debug level unless RUST_LOG says otherwise
	#[clap(short, long)]
	verbose: bool,

	/// Display statistics after the execution
	#[clap(long)]
	stats: bool,

	/// Write the process id to this file while the VM runs
	#[clap(short = 'F', long, value_name = "FILE", env = "XHV_PIDFILE")]
	pidfile: Option<PathBuf>,

	/// GDB server port
	#[clap(short = 'g', long, env = "XHV_GDB_PORT")]
	gdb_port: Option<u16>,

	#[clap(flatten, next_help_heading = "MEMORY")]
	memory_args: MemoryArgs,

	#[clap(flatten, next_help_heading = "CPU")]
	cpu_args: CpuArgs,

	#[clap(flatten, next_help_heading = "DEVICES")]
	device_args: DeviceArgs,

	#[clap(flatten, next_help_heading = "FIRMWARE")]
	firmware_args: FirmwareArgs,
}

#[derive(Parser, Debug)]
struct MemoryArgs {
	/// Guest RAM size
	///
	/// Accepts k, m, g, t, p and e suffixes. Values below 1 MiB are megabytes.
	#[clap(short = 'm', long, default_value_t, env = "XHV_MEMORY_SIZE")]
	memory_size: GuestMemorySize,
}

#[derive(Parser, Debug, Clone)]
struct CpuArgs {
	/// Number of guest CPUs
	#[clap(short, long, default_value_t, env = "XHV_CPU_COUNT")]
	cpu_count: CpuCount,

	/// Bind guest vCPUs to host cpus
	///
	/// A list of host CPU numbers onto which the guest vCPUs should be bound.
	/// List items may be single numbers or inclusive ranges.
	/// List items may be separated with commas or spaces.
	///
	/// # Examples
	///
	/// * `--affinity "0 1 2"`
	///
	/// * `--affinity 0-1,2`
	#[clap(long, value_name = "CPUs")]
	affinity: Option<Affinity>,

	/// Exit on HLT
	#[clap(short = 'H', long)]
	hlt_exit: bool,

	/// Exit on PAUSE
	#[clap(short = 'P', long)]
	pause_exit: bool,

	/// Ignore reads and writes of unknown MSRs instead of raising #GP
	#[clap(short = 'w', long)]
	ignore_unknown_msr: bool,

	/// Enable x2APIC mode
	#[clap(short = 'x', long, env = "XHV_X2APIC")]
	x2apic: bool,
}

#[derive(Parser, Debug)]
struct DeviceArgs {
	/// PCI slot configuration: `slot,driver[,config]`
	///
	/// Example: -s 0:0,hostbridge -s 31,lpc -s 2:0,virtio-net
	#[clap(short = 's', long = "slot", value_name = "SLOT")]
	slots: Vec<SlotSpec>,

	/// LPC device configuration: `com1,stdio` or `com2,/dev/ttys004`
	#[clap(short = 'l', long = "lpc", value_name = "DEVICE")]
	lpc: Vec<String>,

	/// Fail on accesses to unregistered I/O ports
	#[clap(short = 'e', long)]
	strictio: bool,

	/// Force virtio devices to a single MSI vector
	#[clap(short = 'W', long)]
	virtio_single_msi: bool,

	/// The RTC keeps UTC instead of local time
	#[clap(short = 'u', long, env = "XHV_RTC_UTC")]
	rtc_utc: bool,
}

#[derive(Parser, Debug)]
struct FirmwareArgs {
	/// Boot method
	///
	/// kexec,kernel[,initrd[,cmdline]]
	/// multiboot,kernel[,mod[;cmdline][:mod...]][,cmdline]
	/// fbsd,userboot,volume[,env]
	/// bootrom,path
	#[clap(short = 'f', long, env = "XHV_FIRMWARE")]
	firmware: Firmware,

	/// Generate ACPI tables
	#[clap(short = 'A', long)]
	acpi: bool,

	/// Do not write an MP table
	#[clap(short = 'Y', long)]
	no_mptable: bool,

	/// UUID reported to the guest
	#[clap(short = 'U', long, env = "XHV_UUID")]
	uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Affinity(Vec<CoreId>);

impl Affinity {
	fn parse_range(s: &str) -> Result<RangeInclusive<usize>, ParseIntError> {
		Ok(match s.split_once('-') {
			Some((start, end)) => start.parse()?..=end.parse()?,
			None => {
				let idx = s.parse()?;
				idx..=idx
			}
		})
	}

	fn parse_ranges(ranges: &str) -> Result<Vec<usize>, ParseIntError> {
		let mut ids = Vec::new();
		for range in ranges.split([' ', ',']).filter(|s| !s.is_empty()) {
			ids.extend(Self::parse_range(range)?);
		}
		Ok(ids)
	}
}

#[derive(Error, Debug)]
enum ParseAffinityError {
	#[error(transparent)]
	Parse(#[from] ParseIntError),

	#[error("Available cores: {available_cores:?}, requested affinities: {requested_affinities:?}")]
	InvalidValue {
		available_cores: Vec<usize>,
		requested_affinities: Vec<usize>,
	},
}

impl FromStr for Affinity {
	type Err = ParseAffinityError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let available_cores = core_affinity::get_core_ids()
			.unwrap_or_default()
			.into_iter()
			.map(|core_id| core_id.id)
			.collect::<Vec<_>>();

		let requested_affinities = Self::parse_ranges(s)?;

		if !requested_affinities
			.iter()
			.all(|affinity| available_cores.contains(affinity))
		{
			return Err(ParseAffinityError::InvalidValue {
				available_cores,
				requested_affinities,
			});
		}

		let core_ids = requested_affinities
			.into_iter()
			.map(|affinity| CoreId { id: affinity })
			.collect();
		Ok(Self(core_ids))
	}
}

impl Args {
	/// Checks what clap cannot express and collects the options.
	fn into_params(self) -> Result<Params, clap::Error> {
		let mut cmd = Args::command();
		let Args {
			verbose: _,
			stats,
			pidfile,
			gdb_port,
			memory_args: MemoryArgs { memory_size },
			cpu_args:
				CpuArgs {
					cpu_count,
					affinity,
					hlt_exit,
					pause_exit,
					ignore_unknown_msr,
					x2apic,
				},
			device_args:
				DeviceArgs {
					slots,
					lpc: lpc_opts,
					strictio,
					virtio_single_msi,
					rtc_utc,
				},
			firmware_args:
				FirmwareArgs {
					firmware,
					acpi,
					no_mptable,
					uuid,
				},
		} = self;

		let affinity = match affinity {
			Some(Affinity(cores)) if cores.len() != cpu_count.get() as usize => {
				let verb = if cores.len() > 1 { "were" } else { "was" };
				return Err(cmd.error(
					ErrorKind::WrongNumberOfValues,
					format!(
						"--affinity requires {cpu_count} values (matching --cpu-count), but {} {verb} provided",
						cores.len()
					),
				));
			}
			Some(Affinity(cores)) => Some(cores),
			None => None,
		};

		let mut lpc = LpcConfig::default();
		for opt in &lpc_opts {
			lpc.parse_option(opt)
				.map_err(|err| cmd.error(ErrorKind::InvalidValue, err))?;
		}

		Ok(Params {
			memory_size,
			cpu_count,
			affinity,
			uuid,
			acpi,
			hlt_exit,
			pause_exit,
			rtc_utc,
			ignore_unknown_msr,
			strictio,
			virtio_single_msi,
			x2apic,
			no_mptable,
			gdb_port,
			slots,
			lpc,
			firmware: Some(firmware),
			pidfile,
			stats,
		})
	}
}

fn run_xhv() -> i32 {
	let args = Args::parse();

	let default_filter = if args.verbose { "debug" } else { "info" };
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
		.init();

	// Before any thread exists, so that every later thread inherits the mask.
	if let Err(err) = control::block_signals() {
		error!("could not block control signals: {err}");
		return EXIT_ERROR;
	}

	let params = match args.into_params() {
		Ok(params) => params,
		Err(err) => err.exit(),
	};

	let _pidfile = match params.pidfile.as_deref().map(Pidfile::create).transpose() {
		Ok(pidfile) => pidfile,
		Err(err) => {
			error!("could not create pidfile: {err}");
			return EXIT_ERROR;
		}
	};

	let runner = match runner::host_backend().and_then(|backend| VmRunner::new(backend, &params)) {
		Ok(runner) => runner,
		Err(err) => {
			error!("could not create the VM: {err}");
			return EXIT_ERROR;
		}
	};

	let controller = runner.controller();
	if let Err(err) = control::spawn_signal_thread(move |msg| controller.send(msg)) {
		warn!("signals will not be handled: {err}");
	}

	let result = runner.run();
	uart::restore_terminal();
	if let Some(err) = &result.error {
		error!("{err}");
	}
	if let Some(stats) = result.stats {
		println!("Run statistics:");
		println!("{stats}");
	}
	result.code
}

fn main() {
	process::exit(run_xhv())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(args: &[&str]) -> Result<Params, clap::Error> {
		Args::try_parse_from(["xhv"].iter().chain(args))?.into_params()
	}

	#[test]
	fn affinity_ranges() {
		assert_eq!(Affinity::parse_ranges("0-1,2").unwrap(), [0, 1, 2]);
		assert_eq!(Affinity::parse_ranges("0 1 2").unwrap(), [0, 1, 2]);
		assert_eq!(Affinity::parse_ranges("3").unwrap(), [3]);
		assert!(Affinity::parse_ranges("1-x").is_err());
	}

	#[test]
	fn options() {
		let params = parse(&[
			"-c",
			"2",
			"-m",
			"1G",
			"-A",
			"-w",
			"-x",
			"-u",
			"-s",
			"0:0,hostbridge",
			"-s",
			"31,lpc",
			"-l",
			"com1,stdio",
			"-f",
			"kexec,vmlinuz,initrd.gz,\"console=ttyS0\"",
			"-F",
			"/tmp/xhv.pid",
		])
		.unwrap();
		assert_eq!(params.cpu_count.get(), 2);
		assert_eq!(params.memory_size.get(), 1 << 30);
		assert!(params.acpi && params.ignore_unknown_msr && params.x2apic && params.rtc_utc);
		assert_eq!(params.slots.len(), 2);
		assert!(params.lpc.com1.is_some());
		assert!(matches!(params.firmware, Some(Firmware::Kexec { .. })));
		assert_eq!(params.pidfile, Some(PathBuf::from("/tmp/xhv.pid")));
		assert!(!params.vm_config().strictmsr);
	}

	#[test]
	fn firmware_is_required() {
		let err = parse(&["-c", "1"]).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
	}

	#[test]
	fn bad_values() {
		assert!(parse(&["-f", "bootrom,rom.bin", "-c", "0"]).is_err());
		assert!(parse(&["-f", "bootrom,rom.bin", "-m", "1.5G"]).is_err());
		assert!(parse(&["-f", "floppy,a.img"]).is_err());
		assert!(parse(&["-f", "bootrom,rom.bin", "-l", "com3,stdio"]).is_err());
	}

	#[test]
	fn verify_cli() {
		Args::command().debug_assert();
	}
}
