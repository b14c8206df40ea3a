use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use pistrap_core::config::ConfigStore;
use pistrap_core::inventory;
use pistrap_core::pipeline::{self, PipelineOptions, Provisioner};
use pistrap_core::platform::ProbeOps;
use pistrap_core::platform::linux::LinuxPlatform;
use pistrap_core::recovery::RunGuard;
use std::io::{IsTerminal, stdout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

mod progress;
mod prompts;

#[derive(Parser)]
#[command(name = "pistrap")]
#[command(
    about = "Write Raspberry Pi OS to an SD card or USB drive, ready for headless first boot",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the questions, write the image and customize it (default)
    Provision,
    /// List the devices that would be offered as targets
    List,
}

/// Turns off `ECHOCTL` while the tool runs so Ctrl+C is not echoed as `^C`
/// over the progress bars. Restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

fn list(platform: &LinuxPlatform) -> Result<()> {
    let found = inventory::candidates(&platform.block_devices()?);
    if found.devices.is_empty() {
        println!("No candidate devices found.");
        return Ok(());
    }
    if found.fell_back {
        println!(
            "{} no removable devices; showing every non-system disk.",
            style("WARNING:").red().bold()
        );
    }
    println!("Found {} candidate devices:\n", found.devices.len());
    for device in &found.devices {
        println!("  {device}  ({})", device.class());
    }
    Ok(())
}

fn provision(platform: &LinuxPlatform, running: &AtomicBool) -> Result<()> {
    // Armed before anything can fail so every exit records an outcome.
    let guard = RunGuard::start(ConfigStore::locate());

    if !is_root() {
        guard.fail();
        bail!("pistrap writes to raw block devices and must run as root (try sudo).");
    }

    let answers = match prompts::collect_answers(guard.config()) {
        Ok(answers) => answers,
        Err(e) => {
            guard.fail();
            return Err(e);
        }
    };
    let options = PipelineOptions::from_env();

    println!();
    println!("  User:   {}", style(&answers.username).cyan());
    println!(
        "  Image:  {}",
        style(pipeline::describe_source(&answers, &options)).cyan()
    );
    println!();

    let operator = prompts::TerminalOperator;
    let bars = progress::TerminalProgress::new();
    let summary =
        Provisioner::new(platform, &operator, &bars, running, options).execute_guarded(answers, guard)?;

    println!(
        "\n✨ {} is ready ({}).",
        style(summary.device.display()).cyan(),
        summary.class
    );
    println!("  Boot partition: {}", summary.boot.display());
    println!("  Root partition: {}", summary.root.display());
    println!("  Login user:     {}", summary.username);
    println!(
        "\nInsert it into the Pi, power on, then connect with:\n  {}",
        style(summary.ssh_command()).green().bold()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let _term_restorer = TermRestorer::new();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    let platform = LinuxPlatform::new();

    match cli.command.unwrap_or(Commands::Provision) {
        Commands::Provision => provision(&platform, &running),
        Commands::List => list(&platform),
    }
}
