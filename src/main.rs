//! Service entry point.
//!
//! Three mutually exclusive operating modes:
//! `-service[:name]` runs under a service manager, `-console[:name]`
//! attaches a console titled `VM:<name>` and shuts down on a break event,
//! and with neither the instance runs headless under a generated name.

use std::io::{Read, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};
use uuid::Uuid;

use lxuser::supervisor::Supervisor;
use lxuser::syslog::LogLevel;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_break(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[derive(Debug)]
enum Mode {
    Service(String),
    Console(String),
    Headless(String),
}

fn instance_name(suffix: &str) -> String {
    match suffix.strip_prefix(':') {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Splits the operating-mode switch off the argument list; everything else
/// flows to the supervisor's parameter walk.
fn parse_mode(args: Vec<String>) -> (Mode, Vec<String>) {
    let mut mode = None;
    let mut rest = Vec::new();

    for arg in args {
        if mode.is_none() {
            if let Some(suffix) = arg.strip_prefix("-service") {
                mode = Some(Mode::Service(instance_name(suffix)));
                continue;
            }
            if let Some(suffix) = arg.strip_prefix("-console") {
                mode = Some(Mode::Console(instance_name(suffix)));
                continue;
            }
        }
        rest.push(arg);
    }

    let mode = mode.unwrap_or_else(|| Mode::Headless(Uuid::new_v4().to_string()));
    (mode, rest)
}

fn install_break_handler() {
    let action = SigAction::new(
        SigHandler::Handler(on_break),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

fn wait_for_shutdown() {
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Reads one raw byte from the terminal, echo off.
fn wait_for_keypress() {
    let stdin = std::io::stdin();
    let Ok(saved) = tcgetattr(&stdin) else {
        return;
    };

    let mut raw = saved.clone();
    raw.local_flags &= !(LocalFlags::ICANON | LocalFlags::ECHO);
    if tcsetattr(&stdin, SetArg::TCSANOW, &raw).is_ok() {
        let mut byte = [0u8; 1];
        let _ = stdin.lock().read_exact(&mut byte);
        let _ = tcsetattr(&stdin, SetArg::TCSANOW, &saved);
    }
}

fn run(name: &str, params: &[String], console: bool) -> ExitCode {
    let supervisor = match Supervisor::start(params) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("{err}");
            let code = u8::try_from(err.exit_code()).unwrap_or(1);
            return ExitCode::from(code.max(1));
        }
    };

    if console {
        supervisor
            .syslog()
            .set_console(Some(Box::new(std::io::stdout())));
    }

    info!("instance {name} running");
    supervisor.log_message(
        0,
        LogLevel::Informational,
        &format!("instance {name} started"),
    );

    install_break_handler();
    wait_for_shutdown();
    supervisor.shutdown();

    if console {
        print!("Press any key to continue . . .");
        let _ = std::io::stdout().flush();
        wait_for_keypress();
        println!();
    }

    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, params) = parse_mode(args);

    match mode {
        Mode::Console(name) => {
            // Title the console for the life of the instance.
            print!("\x1b]0;VM:{name}\x07");
            let _ = std::io::stdout().flush();
            run(&name, &params, true)
        }
        Mode::Service(name) | Mode::Headless(name) => run(&name, &params, false),
    }
}
