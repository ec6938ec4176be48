use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether_core::{Address, DebugError, ExecutionState, MachineType, Session, StopReason};
use tether_utils::{info, init_logging};

/// A remote debugging client with wire-protocol transport and ELF symbol resolution.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "A remote debugging client with wire-protocol transport and ELF symbol resolution", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Connect to a remote target and debug it
    Connect
    {
        /// Target endpoint, host:port
        endpoint: String,
        /// Machine type to expect (x86, x64, armv6, armv7); defaults to the host's
        #[arg(long)]
        machine: Option<String>,
        /// Breakpoint address (hex 0x... or decimal), repeatable
        #[arg(short, long = "breakpoint", value_parser = parse_address)]
        breakpoints: Vec<Address>,
        /// Per-request reply deadline in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
        /// Keep resuming after each stop instead of detaching
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Show supported machine types and their register layouts
    Info,
}

fn main()
{
    // Initialize logging (reads from RUST_LOG env var)
    // Defaults to INFO level and Pretty format if not set
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let cli = Cli::parse();
    if let Err(e) = run_command(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> tether_core::Result<()>
{
    match cli.command {
        Commands::Connect {
            endpoint,
            machine,
            breakpoints,
            timeout,
            follow,
        } => {
            let expected = match machine {
                Some(name) => parse_machine(&name)?,
                None => MachineType::host()?,
            };
            let request_timeout = Duration::from_secs(timeout.max(1));

            info!("Connecting to {}", endpoint);
            let transport = tether_core::TcpTransport::connect(&endpoint)?;
            let mut session = Session::attach(Box::new(transport), expected, request_timeout)?;
            println!("Attached to {} ({} target)", endpoint, session.machine());
            print_session_info(&session);

            for address in breakpoints.iter().copied() {
                session.set_breakpoint(address)?;
                println!("Breakpoint set at {}", address);
            }

            if breakpoints.is_empty() && !follow {
                // Nothing to wait for; show the initial stop and leave.
                session.detach();
                return Ok(());
            }

            run_target(&mut session, follow)?;
            session.detach();
            Ok(())
        }
        Commands::Info => {
            match MachineType::host() {
                Ok(host) => println!("Host machine: {}", host),
                Err(_) => println!("Host machine: unsupported"),
            }
            for machine in [MachineType::X86, MachineType::X64, MachineType::Armv6, MachineType::Armv7] {
                let descriptor = machine.descriptor();
                println!(
                    "\n{}: {} registers, {}-byte words, {}-byte trap",
                    machine,
                    descriptor.register_count(),
                    descriptor.word_size,
                    descriptor.breakpoint_opcode.len()
                );
                println!("  registers: {}", descriptor.register_names.join(" "));
            }
            Ok(())
        }
    }
}

/// Resume the target and report stops until it exits, the user interrupts,
/// or (without `--follow`) the first stop lands.
fn run_target(session: &mut Session, follow: bool) -> tether_core::Result<()>
{
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })
        .map_err(|e| DebugError::Connection(format!("failed to install interrupt handler: {e}")))?;
    }

    session.resume()?;
    println!("Target running (Ctrl+C to break in)");

    loop {
        if interrupted.swap(false, Ordering::SeqCst) && session.state() == ExecutionState::Running {
            info!("Interrupt received, requesting break-in");
            session.break_in()?;
        }

        // Short waits so interrupts are noticed promptly.
        match session.wait_for_stop(Duration::from_millis(200)) {
            Ok(reason) => {
                print_stop(session, reason);
                if follow && !matches!(reason, StopReason::BreakRequest) {
                    session.resume()?;
                } else {
                    return Ok(());
                }
            }
            Err(DebugError::Timeout(_)) => continue,
            Err(DebugError::InvalidState { .. }) if session.state() == ExecutionState::Exited => {
                println!("Target exited");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn print_stop(session: &Session, reason: StopReason)
{
    let pc = session.registers().pc();
    match session.resolve(pc) {
        Some(resolved) => println!("Stopped: {} at {} ({})", reason, resolved, pc),
        None => println!("Stopped: {} at {}", reason, pc),
    }
}

fn print_session_info(session: &Session)
{
    println!("\nSession Information:");
    println!("  Machine: {}", session.machine());
    println!("  State: {}", session.state());
    if let Some(reason) = session.last_stop() {
        println!("  Stop Reason: {}", reason);
    }
    println!("  Modules: {}", session.modules().len());
    println!("  pc = {}  sp = {}", session.registers().pc(), session.registers().sp());
}

/// Parse a machine type name as accepted by `--machine`.
fn parse_machine(name: &str) -> tether_core::Result<MachineType>
{
    match name.to_ascii_lowercase().as_str() {
        "x86" => Ok(MachineType::X86),
        "x64" | "x86_64" | "amd64" => Ok(MachineType::X64),
        "armv6" => Ok(MachineType::Armv6),
        "armv7" | "arm" => Ok(MachineType::Armv7),
        _ => Err(DebugError::UnsupportedMachine(0)),
    }
}

/// Parse a breakpoint address, hex with `0x` prefix or decimal. Used as a
/// clap value parser, so a bad argument is a usage error rather than a
/// session error.
fn parse_address(text: &str) -> Result<Address, String>
{
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    parsed
        .map(Address::new)
        .map_err(|_| format!("invalid address: {text}"))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_address_forms()
    {
        assert_eq!(parse_address("0x4000").unwrap(), Address::new(0x4000));
        assert_eq!(parse_address("4096").unwrap(), Address::new(4096));
        assert!(parse_address("zork").is_err());
    }

    #[test]
    fn test_parse_machine_names()
    {
        assert_eq!(parse_machine("x64").unwrap(), MachineType::X64);
        assert_eq!(parse_machine("AMD64").unwrap(), MachineType::X64);
        assert_eq!(parse_machine("armv6").unwrap(), MachineType::Armv6);
        assert!(parse_machine("mips").is_err());
    }
}
