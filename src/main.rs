use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, anyhow};
use log::info;

use renatus::boot;
use renatus::config::{self, CONFIG_PATH};
use renatus::kexec::KEXEC_ARCH_DEFAULT;
use renatus::logger::StderrLogger;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("renatus: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let kexec_config = config::read_config(&path)?;
    StderrLogger::new(kexec_config.log_level().into())
        .init()
        .map_err(|e| anyhow!("installing logger: {e}"))?;

    let image = boot::load_from_config(&kexec_config)?;
    if kexec_config.dry_run() {
        info!("dry run, not loading\n{image}");
        image.close()?;
        return Ok(());
    }
    image.load(KEXEC_ARCH_DEFAULT)?;
    info!("kernel loaded, reboot to start it");
    Ok(())
}
