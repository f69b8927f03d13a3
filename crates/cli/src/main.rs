// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Command-line front end: argument parsing, firmware loading, the
//! raw-mode terminal behind the emulated UART, and exit codes.

use anyhow::Context;
use clap::Parser;
use nrfemu_core::{Console, IsaLevel, LogLevel, Machine, MachineConfig, StopReason};
use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
const EXIT_FAULT: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

/// Ctrl-X on the raw terminal ends the emulation.
const CTRL_X: u8 = 0x18;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Instruction-level emulator for nRF51/nRF52-class microcontrollers",
    long_about = None
)]
struct Cli {
    /// Path to the raw firmware image
    firmware: PathBuf,

    /// RAM size in KiB
    #[arg(long, default_value_t = 32)]
    ram: usize,

    /// Flash size in KiB
    #[arg(long, default_value_t = 256)]
    flash: usize,

    /// Flash page size in bytes (must be a power of two)
    #[arg(long, default_value_t = 1024)]
    pagesize: usize,

    /// Log level: error, warning, calls, calls-sp, instrs
    #[arg(long, default_value = "error")]
    loglevel: LogLevel,

    /// CPU profile: cortex-m0 or cortex-m4
    #[arg(long, default_value = "cortex-m4")]
    cpu: IsaLevel,
}

/// Host console over stdin/stdout. When stdin is a terminal it is switched
/// to raw mode so the guest sees individual keystrokes.
struct TerminalConsole {
    raw: bool,
}

impl TerminalConsole {
    fn new() -> Self {
        let raw = std::io::stdin().is_terminal()
            && crossterm::terminal::enable_raw_mode().is_ok();
        Self { raw }
    }

    fn restore(&self) {
        if self.raw {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

impl Drop for TerminalConsole {
    fn drop(&mut self) {
        self.restore();
    }
}

impl Console for TerminalConsole {
    fn getc(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match std::io::stdin().read(&mut byte) {
            Ok(1) => {
                if self.raw && byte[0] == CTRL_X {
                    self.restore();
                    std::process::exit(i32::from(EXIT_OK));
                }
                Some(byte[0])
            }
            _ => None,
        }
    }

    fn putc(&mut self, byte: u8) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }
}

fn subscriber_level(loglevel: LogLevel) -> tracing::Level {
    match loglevel {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Calls | LogLevel::CallsSp => tracing::Level::INFO,
        LogLevel::Instrs => tracing::Level::DEBUG,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(subscriber_level(cli.loglevel))
        .with_target(false)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let firmware = std::fs::read(&cli.firmware)
        .with_context(|| format!("cannot read firmware image {:?}", cli.firmware))?;

    let config = MachineConfig {
        flash_size: cli.flash * 1024,
        pagesize: cli.pagesize,
        ram_size: cli.ram * 1024,
        isa: cli.cpu,
        loglevel: cli.loglevel,
    };
    if firmware.len() > config.flash_size {
        anyhow::bail!(
            "firmware ({} bytes) does not fit in flash ({} bytes)",
            firmware.len(),
            config.flash_size
        );
    }

    let mut machine = Machine::new(&config, Box::new(TerminalConsole::new()))
        .context("cannot create machine")?;
    machine.load(&firmware);
    machine.reset();

    let code = match machine.run() {
        Ok(StopReason::Exit) => {
            eprintln!("exited.");
            EXIT_OK
        }
        Ok(StopReason::Break) => {
            // With no debugger attached a breakpoint is fatal.
            tracing::error!("stopped at a breakpoint with no debugger attached");
            machine.dump_diagnostics();
            EXIT_FAULT
        }
        Ok(stop) => {
            tracing::error!("machine stopped unexpectedly: {stop:?}");
            EXIT_FAULT
        }
        Err(_) => {
            // The run loop already printed the register state and backtrace.
            EXIT_FAULT
        }
    };
    Ok(ExitCode::from(code))
}
