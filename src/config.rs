use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::memmap::{DEBUGFS_MEMBLOCK, PROC_IOMEM, SYSFS_MEMMAP};
use crate::range::Range;

pub const CONFIG_PATH: &str = "renatus.json";

const DEFAULT_DTB: &str = "/sys/firmware/fdt";
const DEFAULT_BOOT_PARAMS: &str = "/sys/kernel/boot_params/data";
const DEFAULT_PURGATORY: &str = "default";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
	#[serde(rename = "x86_64")]
	X86_64,
	#[serde(rename = "arm64")]
	Arm64
}

impl Default for Arch {
	fn default() -> Self {
		if cfg!(target_arch = "aarch64") {
			Self::Arm64
		} else {
			Self::X86_64
		}
	}
}

/// Where the physical memory map is read from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum MemoryMapSource {
	Sysfs {
		#[serde(default)]
		path: Option<PathBuf>
	},
	Iomem {
		#[serde(default)]
		path: Option<PathBuf>
	},
	#[serde(rename = "debugfs")]
	Memblock {
		#[serde(default)]
		path: Option<PathBuf>
	},
	/// Defaults to the configured device tree.
	Fdt {
		#[serde(default)]
		path: Option<PathBuf>
	}
}

impl MemoryMapSource {
	pub fn path(&self) -> Option<&Path> {
		match self {
			Self::Sysfs { path: Some(p) }
			| Self::Iomem { path: Some(p) }
			| Self::Memblock { path: Some(p) }
			| Self::Fdt { path: Some(p) } => Some(p),
			Self::Sysfs { path: None } => Some(Path::new(SYSFS_MEMMAP)),
			Self::Iomem { path: None } => Some(Path::new(PROC_IOMEM)),
			Self::Memblock { path: None } => Some(Path::new(DEBUGFS_MEMBLOCK)),
			Self::Fdt { path: None } => None
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Off,
	Error,
	Warn,
	#[default]
	Info,
	Debug,
	Trace
}

impl From<LogLevel> for LevelFilter {
	fn from(level: LogLevel) -> Self {
		match level {
			LogLevel::Off => LevelFilter::Off,
			LogLevel::Error => LevelFilter::Error,
			LogLevel::Warn => LevelFilter::Warn,
			LogLevel::Info => LevelFilter::Info,
			LogLevel::Debug => LevelFilter::Debug,
			LogLevel::Trace => LevelFilter::Trace
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KexecConfig {
	#[serde(default)]
	arch: Arch,
	kernel: PathBuf,
	#[serde(default)]
	initrd: Option<PathBuf>,
	#[serde(default)]
	cmdline: String,
	#[serde(default)]
	dtb: Option<PathBuf>,
	#[serde(default)]
	boot_params: Option<PathBuf>,
	#[serde(default)]
	purgatory: Option<String>,
	#[serde(default)]
	memory_map: Option<MemoryMapSource>,
	#[serde(default)]
	reservations: Vec<Range>,
	#[serde(default)]
	log_level: LogLevel,
	#[serde(default)]
	dry_run: bool
}

impl KexecConfig {
	pub fn arch(&self) -> Arch {
		self.arch
	}

	pub fn kernel(&self) -> &Path {
		&self.kernel
	}

	pub fn initrd(&self) -> Option<&Path> {
		self.initrd.as_deref()
	}

	pub fn cmdline(&self) -> &str {
		&self.cmdline
	}

	pub fn dtb(&self) -> &Path {
		self.dtb.as_deref().unwrap_or(Path::new(DEFAULT_DTB))
	}

	pub fn boot_params(&self) -> &Path {
		self.boot_params.as_deref().unwrap_or(Path::new(DEFAULT_BOOT_PARAMS))
	}

	pub fn purgatory(&self) -> &str {
		self.purgatory.as_deref().unwrap_or(DEFAULT_PURGATORY)
	}

	/// The configured source, or the usual one for the architecture.
	pub fn memory_map(&self) -> MemoryMapSource {
		match (&self.memory_map, self.arch) {
			(Some(source), _) => source.clone(),
			(None, Arch::X86_64) => MemoryMapSource::Sysfs { path: None },
			(None, Arch::Arm64) => MemoryMapSource::Fdt { path: None }
		}
	}

	pub fn reservations(&self) -> &[Range] {
		&self.reservations
	}

	pub fn log_level(&self) -> LogLevel {
		self.log_level
	}

	pub fn dry_run(&self) -> bool {
		self.dry_run
	}
}

pub fn parse_config(json: &str) -> Result<KexecConfig> {
	let config = serde_json::from_str::<KexecConfig>(json)?;
	Ok(config)
}

pub fn read_config(path: &Path) -> Result<KexecConfig> {
	let config = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
	let config = String::from_utf8_lossy(&config);
	parse_config(&config).with_context(|| format!("parsing {}", path.display()))
}
