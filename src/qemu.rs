//! QEMU execution and live serial forwarding.

use std::env;
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::deps::{Capabilities, Tool};
use crate::error::{HarnessError, PreconditionError, Result, ToolFailure};
use crate::tool;
use crate::transport::Transport;

pub const DEFAULT_MACHINE: &str = "q35";
pub const DEFAULT_MEMORY: &str = "1G";
const KVM_DEVICE: &str = "/dev/kvm";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time between SIGTERM and SIGKILL when stopping the emulator.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Firmware ROM used when none is given: `$HOME/coreboot/build/coreboot.rom`.
pub fn default_firmware() -> PathBuf {
    let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join("coreboot/build/coreboot.rom")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    Kvm,
    Tcg,
}

impl Acceleration {
    /// KVM when `/dev/kvm` exists and we may open it read-write.
    pub fn detect() -> Self {
        Self::detect_at(Path::new(KVM_DEVICE))
    }

    pub fn detect_at(device: &Path) -> Self {
        if !device.exists() {
            return Acceleration::Tcg;
        }
        let Ok(path) = CString::new(device.as_os_str().as_bytes()) else {
            return Acceleration::Tcg;
        };
        // SAFETY: `path` is NUL-terminated and outlives the call.
        if unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) } == 0 {
            Acceleration::Kvm
        } else {
            Acceleration::Tcg
        }
    }

    fn args(self) -> &'static [&'static str] {
        match self {
            Acceleration::Kvm => &["-enable-kvm", "-cpu", "host"],
            Acceleration::Tcg => &["-cpu", "qemu64"],
        }
    }
}

/// One emulator invocation.
#[derive(Debug, Clone)]
pub struct Session {
    pub firmware: PathBuf,
    pub image: PathBuf,
    pub transport: Transport,
    pub memory: String,
    pub machine: String,
    pub accel: Acceleration,
    /// Serial output is also written here when set.
    pub serial_log: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Appended verbatim after everything else.
    pub extra_args: Vec<String>,
}

impl Session {
    pub fn new(firmware: PathBuf, image: PathBuf, transport: Transport) -> Self {
        Session {
            firmware,
            image,
            transport,
            memory: DEFAULT_MEMORY.to_string(),
            machine: DEFAULT_MACHINE.to_string(),
            accel: Acceleration::detect(),
            serial_log: None,
            timeout: None,
            extra_args: Vec::new(),
        }
    }

    /// Full emulator argument list, in order.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-machine".into(),
            self.machine.clone(),
            "-bios".into(),
            self.firmware.to_string_lossy().into_owned(),
            "-m".into(),
            self.memory.clone(),
            "-serial".into(),
            "stdio".into(),
            "-display".into(),
            "none".into(),
            "-monitor".into(),
            "none".into(),
            "-no-reboot".into(),
        ];
        args.extend(self.accel.args().iter().map(|a| a.to_string()));
        args.extend(self.transport.args(&self.image));
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn check_inputs(&self) -> Result<(), PreconditionError> {
        if !self.firmware.is_file() {
            return Err(PreconditionError::MissingInput {
                what: "firmware ROM",
                path: self.firmware.clone(),
            });
        }
        if !self.image.is_file() {
            return Err(PreconditionError::MissingInput {
                what: "disk image",
                path: self.image.clone(),
            });
        }
        Ok(())
    }
}

/// How the emulator process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Exited(i32),
    Signaled(i32),
    Cancelled,
    TimedOut,
}

impl Terminal {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Terminal::Exited(code),
            (None, Some(signal)) => Terminal::Signaled(signal),
            (None, None) => Terminal::Exited(-1),
        }
    }

    pub fn is_success(self) -> bool {
        self == Terminal::Exited(0)
    }

    /// Exit code a wrapping process should report, shell style.
    pub fn exit_code(self) -> i32 {
        match self {
            Terminal::Exited(code) => code,
            Terminal::Signaled(signal) => 128 + signal,
            Terminal::Cancelled => 130,
            Terminal::TimedOut => 124,
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Exited(code) => write!(f, "exited with status {code}"),
            Terminal::Signaled(signal) => write!(f, "was killed by signal {signal}"),
            Terminal::Cancelled => f.write_str("was cancelled"),
            Terminal::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub terminal: Terminal,
    pub duration: Duration,
    pub serial_bytes: u64,
}

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static INSTALL_HANDLERS: Once = Once::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Shared cancellation flag, optionally tied to SIGINT/SIGTERM.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    signals: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips on SIGINT or SIGTERM. Installs the handlers
    /// on first use.
    pub fn from_signals() -> Self {
        INSTALL_HANDLERS.call_once(|| {
            let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
            unsafe {
                libc::signal(libc::SIGINT, handler);
                libc::signal(libc::SIGTERM, handler);
            }
        });
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            signals: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.signals && SIGNALLED.load(Ordering::SeqCst))
    }
}

pub struct EmulatorHarness {
    qemu: PathBuf,
    cancel: CancelToken,
    poll_interval: Duration,
    grace: Duration,
}

impl EmulatorHarness {
    pub fn new(qemu: PathBuf) -> Self {
        EmulatorHarness {
            qemu,
            cancel: CancelToken::new(),
            poll_interval: POLL_INTERVAL,
            grace: KILL_GRACE,
        }
    }

    pub fn from_capabilities(caps: &Capabilities) -> Result<Self, PreconditionError> {
        Ok(Self::new(caps.resolve(Tool::Qemu)?))
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Launch the emulator for `session`, forwarding serial output to `sink`
    /// until it exits. Anything but a clean zero exit is an error.
    pub fn run(&self, session: &Session, sink: &mut (dyn Write + Send)) -> Result<SessionReport> {
        session.check_inputs()?;
        if session.accel == Acceleration::Tcg {
            info!("KVM is not available, using software emulation (this will be slow)");
        }

        let mut cmd = Command::new(&self.qemu);
        cmd.args(session.args());
        info!(transport = %session.transport, image = %session.image.display(), "starting QEMU");
        self.run_command(cmd, session.serial_log.as_deref(), session.timeout, sink)
    }

    /// Run an arbitrary emulator-like command with the same forwarding,
    /// cancellation and timeout handling as [`run`](Self::run).
    pub fn run_command(
        &self,
        mut cmd: Command,
        serial_log: Option<&Path>,
        timeout: Option<Duration>,
        sink: &mut (dyn Write + Send),
    ) -> Result<SessionReport> {
        let line = tool::describe(&cmd);
        if self.cancel.is_cancelled() {
            warn!(command = %line, "cancellation requested, not starting emulator");
            return Err(HarnessError::EmulatorExit {
                terminal: Terminal::Cancelled,
                serial_bytes: 0,
            });
        }
        debug!(command = %line, "spawning");

        let mut log = serial_log.map(File::create).transpose()?;
        let start = Instant::now();
        // Own process group, so terminal signals reach us first and the whole
        // group can be stopped together.
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| ToolFailure::spawn(line, &e))?;
        let stdout = child.stdout.take();

        let (terminal, forwarded) = thread::scope(|scope| {
            let forwarder = scope.spawn(move || match stdout {
                Some(mut out) => forward(&mut out, sink, log.as_mut()),
                None => (0, None),
            });
            let terminal = self.supervise(&mut child, start, timeout);
            let forwarded = forwarder.join().unwrap_or((0, None));
            (terminal, forwarded)
        });
        let terminal = terminal?;
        let (serial_bytes, sink_error) = forwarded;
        if let Some(err) = sink_error {
            warn!(error = %err, "serial forwarding stopped early");
        }

        let report = SessionReport {
            terminal,
            duration: start.elapsed(),
            serial_bytes,
        };
        info!(
            terminal = %report.terminal,
            duration = ?report.duration,
            serial_bytes = report.serial_bytes,
            "emulator finished"
        );
        if !terminal.is_success() {
            return Err(HarnessError::EmulatorExit {
                terminal,
                serial_bytes,
            });
        }
        Ok(report)
    }

    fn supervise(
        &self,
        child: &mut Child,
        start: Instant,
        timeout: Option<Duration>,
    ) -> Result<Terminal> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Terminal::from_status(status));
            }
            if self.cancel.is_cancelled() {
                warn!("cancellation requested, stopping emulator");
                self.stop(child)?;
                return Ok(Terminal::Cancelled);
            }
            if timeout.is_some_and(|limit| start.elapsed() >= limit) {
                warn!(timeout = ?timeout, "emulator timed out");
                self.stop(child)?;
                return Ok(Terminal::TimedOut);
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// SIGTERM the child's process group, then SIGKILL it after the grace period.
    fn stop(&self, child: &mut Child) -> io::Result<()> {
        let group = -(child.id() as libc::pid_t);
        // SAFETY: kill has no memory-safety preconditions.
        unsafe { libc::kill(group, libc::SIGTERM) };

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                // SAFETY: as above; reaps stragglers that ignored SIGTERM.
                unsafe { libc::kill(group, libc::SIGKILL) };
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
        // SAFETY: as above.
        unsafe { libc::kill(group, libc::SIGKILL) };
        child.wait()?;
        Ok(())
    }
}

/// Copy `source` to `sink` (and `log`) until EOF. Keeps draining after a
/// sink error so the child never blocks on a full pipe.
fn forward(
    source: &mut impl Read,
    sink: &mut (dyn Write + Send),
    mut log: Option<&mut File>,
) -> (u64, Option<io::Error>) {
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    let mut first_error = None;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                first_error.get_or_insert(e);
                break;
            }
        };
        total += n as u64;
        if first_error.is_none() {
            if let Err(e) = sink.write_all(&buf[..n]).and_then(|_| sink.flush()) {
                first_error = Some(e);
            }
        }
        if let Some(file) = log.as_mut() {
            if let Err(e) = file.write_all(&buf[..n]) {
                warn!(error = %e, "serial log write failed, no longer logging");
                log = None;
            }
        }
    }
    (total, first_error)
}
