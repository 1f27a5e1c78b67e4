//! The supervisor: the single process-wide composition root.
//!
//! Owns the system log, the job every guest process is placed into, the
//! root namespace with RootFs mounted at `/`, and the typed parameter
//! table populated from the command line. Constructed once by the entry
//! point; no global state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, setpgid};
use parking_lot::Mutex;

use crate::error::{LxError, LxResult};
use crate::guest::GuestArchitecture;
use crate::mount_options::MountFlags;
use crate::ns::Namespace;
use crate::param::{ParamOutcome, Params};
use crate::rpc::{AttachedThread, ThreadStartupInfo};
use crate::syslog::{LogLevel, SystemLog};
use crate::vfs::{Credentials, rootfs};

/// A fatal startup failure: which subsystem failed and why.
#[derive(Debug)]
pub struct StartupError {
    subsystem: &'static str,
    cause: LxError,
}

impl StartupError {
    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        self.cause.errno()
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to create {}: {}", self.subsystem, self.cause)
    }
}

impl std::error::Error for StartupError {}

/// The container every guest process is placed into, so that forced
/// termination is transitive.
#[derive(Debug)]
pub struct Job {
    pgid: Mutex<Option<Pid>>,
}

impl Job {
    pub fn create() -> LxResult<Job> {
        Ok(Job {
            pgid: Mutex::new(None),
        })
    }

    /// Moves a process into the job's process group. The first process
    /// added becomes the group leader.
    pub fn add(&self, pid: Pid) -> LxResult<()> {
        let mut pgid = self.pgid.lock();
        let group = pgid.unwrap_or(pid);
        setpgid(pid, group)
            .map_err(|err| LxError::from_host(std::io::Error::from_raw_os_error(err as i32)))?;
        *pgid = Some(group);
        Ok(())
    }

    /// Forcibly terminates every process in the job.
    pub fn terminate(&self) {
        if let Some(group) = *self.pgid.lock() {
            let _ = nix::sys::signal::killpg(group, Signal::SIGKILL);
        }
    }
}

/// Outcome of the supervisor's argument walk.
struct ParsedArguments {
    params: Params,
    invalid: Vec<String>,
    init_args: Vec<String>,
    init_env: Vec<(String, String)>,
}

/// Walks the command line the way the kernel walks its own: `--` ends
/// parameter parsing, recognized keys go to the parameter table, unknown
/// `key=value` tokens become guest environment, unknown bare tokens become
/// guest arguments.
fn parse_arguments(args: &[String]) -> ParsedArguments {
    let mut parsed = ParsedArguments {
        params: Params::default(),
        invalid: Vec::new(),
        init_args: Vec::new(),
        init_env: Vec::new(),
    };

    let mut iter = args.iter();
    for arg in iter.by_ref() {
        if arg == "--" {
            break;
        }

        let (raw_key, value) = match arg.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (arg.as_str(), None),
        };
        let key = raw_key.to_lowercase().replace('-', "_");

        match parsed.params.try_set(&key, value.unwrap_or("")) {
            ParamOutcome::Parsed => {}
            ParamOutcome::Invalid => parsed.invalid.push(arg.clone()),
            ParamOutcome::Unknown => match value {
                Some(value) if !value.is_empty() => parsed
                    .init_env
                    .push((raw_key.to_string(), value.to_string())),
                _ => parsed.init_args.push(arg.clone()),
            },
        }
    }

    // Everything after "--" goes to init untouched.
    for arg in iter {
        parsed.init_args.push(arg.clone());
    }

    parsed
}

/// The running kernel instance.
pub struct Supervisor {
    syslog: Arc<SystemLog>,
    job: Job,
    root_ns: Namespace,
    params: Params,
    init_args: Vec<String>,
    init_env: Vec<(String, String)>,
    next_thread: AtomicU32,
}

impl Supervisor {
    /// Brings the instance up: parameters, system log, job, root
    /// namespace. A failure of any of these is fatal and is logged at
    /// Emergency on whatever log exists by then.
    pub fn start(args: &[String]) -> Result<Supervisor, StartupError> {
        let parsed = parse_arguments(args);

        // The log comes first so everything after it can be reported.
        // Sizes below the minimum are clamped, not rejected.
        let syslog = Arc::new(SystemLog::new(parsed.params.log_buf_len as usize));
        syslog.set_default_level(parsed.params.loglevel);

        for argument in &parsed.invalid {
            syslog.write(
                0,
                LogLevel::Warning,
                format!("Failed to parse parameter: {argument}").as_bytes(),
            );
        }

        let job = match Job::create() {
            Ok(job) => job,
            Err(cause) => {
                let error = StartupError {
                    subsystem: "job object",
                    cause,
                };
                syslog.write(0, LogLevel::Emergency, error.to_string().as_bytes());
                return Err(error);
            }
        };

        let root_ns = Namespace::new();
        let mounted = rootfs::create("rootfs", MountFlags::KERNMOUNT, b"").and_then(|fs| {
            root_ns
                .mount_ns()
                .mount("/", fs, MountFlags::KERNMOUNT, b"")
        });
        if let Err(cause) = mounted {
            let error = StartupError {
                subsystem: "root namespace",
                cause,
            };
            syslog.write(0, LogLevel::Emergency, error.to_string().as_bytes());
            return Err(error);
        }

        Ok(Supervisor {
            syslog,
            job,
            root_ns,
            params: parsed.params,
            init_args: parsed.init_args,
            init_env: parsed.init_env,
            next_thread: AtomicU32::new(1),
        })
    }

    pub fn syslog(&self) -> &Arc<SystemLog> {
        &self.syslog
    }

    /// Writes a message to the system log.
    pub fn log_message(&self, facility: u8, level: LogLevel, message: &str) {
        self.syslog.write(facility, level, message.as_bytes());
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn root_namespace(&self) -> &Namespace {
        &self.root_ns
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Arguments handed to the guest init process.
    pub fn init_args(&self) -> &[String] {
        &self.init_args
    }

    /// Environment handed to the guest init process.
    pub fn init_env(&self) -> &[(String, String)] {
        &self.init_env
    }

    /// Acquires a kernel-side context for a new guest thread. The returned
    /// context's rundown is idempotent and covers guests that die without
    /// detaching.
    pub fn attach_thread(
        &self,
        architecture: GuestArchitecture,
    ) -> (ThreadStartupInfo, Arc<AttachedThread>) {
        let thread_id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let syslog = self.syslog.clone();

        let context = Arc::new(AttachedThread::new(
            thread_id,
            self.root_ns.clone(),
            Credentials::root(),
            move || {
                debug!("thread {thread_id} context released");
                syslog.write(
                    0,
                    LogLevel::Debug,
                    format!("thread {thread_id} detached").as_bytes(),
                );
            },
        ));

        (
            ThreadStartupInfo {
                thread_id,
                architecture,
            },
            context,
        )
    }

    /// Stops the instance: terminates the job and everything in it.
    pub fn shutdown(&self) {
        self.log_message(0, LogLevel::Informational, "instance stopping");
        self.job.terminate();
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("params", &self.params)
            .field("init_args", &self.init_args)
            .finish_non_exhaustive()
    }
}
