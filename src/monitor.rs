use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{PipelineError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Operators that only a shell can interpret.
const SHELL_OPERATORS: &[&str] = &[
    "&&", "||", ";", "|", ">", "<", "&", "`", "$(", "*", "?", "~",
];

pub fn requires_shell(command: &str) -> bool {
    SHELL_OPERATORS.iter().any(|op| command.contains(op))
}

/// Split a command line into argv using POSIX-like quoting rules.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let parse_error = |reason: &str| PipelineError::Parse {
        command: command.to_string(),
        reason: reason.to_string(),
    };

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(parse_error("unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(parse_error("unterminated double quote")),
                        },
                        Some(c) => current.push(c),
                        None => return Err(parse_error("unterminated double quote")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(parse_error("trailing backslash")),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    if args.is_empty() {
        return Err(parse_error("empty command"));
    }
    Ok(args)
}

/// One command to hand to the monitor.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub shell: bool,
    pub capture: bool,
    /// Shared time budget of the enclosing step; overrides the monitor's
    /// own per-call limit.
    pub deadline: Option<Instant>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, shell: Option<bool>) -> Self {
        let command = command.into();
        let shell = shell.unwrap_or_else(|| requires_shell(&command));
        Self {
            command,
            shell,
            capture: false,
            deadline: None,
        }
    }

    pub fn capturing(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn until(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub elapsed: Duration,
    pub peak_memory_kb: u64,
    pub timed_out: bool,
    #[serde(skip)]
    pub stdout: Option<String>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Running maximum of memory samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeakMemory {
    peak_kb: u64,
    samples: usize,
}

impl PeakMemory {
    pub fn observe(&mut self, kb: u64) {
        self.samples += 1;
        self.peak_kb = self.peak_kb.max(kb);
    }

    pub fn peak_kb(&self) -> u64 {
        self.peak_kb
    }

    pub fn samples(&self) -> usize {
        self.samples
    }
}

/// Handle to the process group currently being supervised.
///
/// Shared with the signal listener so an interruption can tear down the
/// running tree from another thread.
#[derive(Debug, Default, Clone)]
pub struct ActiveProcess {
    inner: Arc<Mutex<ActiveState>>,
}

#[derive(Debug, Default)]
struct ActiveState {
    pgid: Option<u32>,
    cancelled: Option<String>,
}

impl ActiveProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly spawned group. Returns false when cancellation
    /// already happened, in which case the caller must kill it itself.
    fn register(&self, pgid: u32) -> bool {
        match self.inner.lock() {
            Ok(mut guard) => {
                guard.pgid = Some(pgid);
                guard.cancelled.is_none()
            }
            Err(_) => true,
        }
    }

    fn unregister(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.pgid = None;
        }
    }

    pub fn current(&self) -> Option<u32> {
        self.inner.lock().ok().and_then(|guard| guard.pgid)
    }

    pub fn cancellation(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|guard| guard.cancelled.clone())
    }

    /// Mark the run as cancelled and terminate the running group, if any.
    pub fn cancel(&self, reason: &str, grace: Duration) {
        let pgid = match self.inner.lock() {
            Ok(mut guard) => {
                guard.cancelled.get_or_insert_with(|| reason.to_string());
                guard.pgid
            }
            Err(_) => None,
        };
        if let Some(pgid) = pgid {
            debug!(pgid, reason, "Terminating active process group");
            terminate_group(pgid, grace, || false);
        }
    }
}

/// Spawns commands and watches them until they exit.
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    shell_program: String,
    sample_interval: Duration,
    kill_grace: Duration,
    timeout: Option<Duration>,
    active: ActiveProcess,
}

impl ProcessMonitor {
    pub fn new(config: &RunConfig, active: ActiveProcess) -> Self {
        Self {
            shell_program: config.shell_program.clone(),
            sample_interval: config.sample_interval(),
            kill_grace: config.kill_grace(),
            timeout: config.step_timeout(),
            active,
        }
    }

    pub fn active(&self) -> &ActiveProcess {
        &self.active
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn build(&self, spec: &CommandSpec) -> Result<Command> {
        let mut cmd = if spec.shell {
            let mut cmd = Command::new(&self.shell_program);
            cmd.arg("-c").arg(&spec.command);
            cmd
        } else {
            let argv = split_command(&spec.command)?;
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        };
        cmd.process_group(0).stdin(Stdio::null());
        if spec.capture {
            cmd.stdout(Stdio::piped());
        }
        Ok(cmd)
    }

    /// Run one command to completion, sampling the memory of its process tree.
    pub fn execute(&self, spec: &CommandSpec) -> Result<CommandResult> {
        let mut cmd = self.build(spec)?;
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| PipelineError::Spawn {
            command: spec.command.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(pid, shell = spec.shell, command = spec.command.as_str(), "Spawned command");

        if !self.active.register(pid) {
            terminate_group(pid, self.kill_grace, || false);
        }

        let reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.sample_interval;
        let sampler = thread::spawn(move || {
            let mut peak = PeakMemory::default();
            loop {
                if let Some(kb) = tree_rss_kb(pid) {
                    peak.observe(kb);
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
            peak
        });

        let deadline = spec
            .deadline
            .or_else(|| self.timeout.map(|limit| started + limit));
        let waited = self.wait(&mut child, pid, deadline);
        let elapsed = started.elapsed();
        let _ = stop_tx.send(());
        let peak = sampler.join().unwrap_or_default();
        self.active.unregister();
        let (status, timed_out) = waited?;

        let stdout = match reader {
            Some(handle) => Some(collect_output(&spec.command, handle.join())?),
            None => None,
        };
        debug!(
            pid,
            samples = peak.samples(),
            peak_kb = peak.peak_kb(),
            "Command finished"
        );

        Ok(CommandResult {
            command: spec.command.clone(),
            exit_code: exit_code(status),
            elapsed,
            peak_memory_kb: peak.peak_kb(),
            timed_out,
            stdout,
        })
    }

    fn wait(
        &self,
        child: &mut Child,
        pgid: u32,
        deadline: Option<Instant>,
    ) -> Result<(ExitStatus, bool)> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok((status, false)),
                Ok(None) => {}
                Err(source) => {
                    return Err(PipelineError::io(
                        format!("Failed to wait for process {pgid}"),
                        source,
                    ));
                }
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!(pgid, limit = ?self.timeout, "Time limit exceeded, terminating");
                terminate_group(pgid, self.kill_grace, || {
                    matches!(child.try_wait(), Ok(Some(_)))
                });
                let status = child.wait().map_err(|source| {
                    PipelineError::io(format!("Failed to reap process {pgid}"), source)
                })?;
                return Ok((status, true));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

type ReaderOutcome = thread::Result<std::io::Result<Vec<u8>>>;

/// Captured stdout as text; invalid UTF-8 is replaced, read failures are errors.
fn collect_output(command: &str, outcome: ReaderOutcome) -> Result<String> {
    match outcome {
        Ok(Ok(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Ok(Err(err)) => Err(PipelineError::io(
            format!("Failed to read output of `{command}`"),
            err,
        )),
        Err(_) => Err(PipelineError::io(
            format!("Output reader for `{command}` panicked"),
            std::io::Error::other("reader thread panicked"),
        )),
    }
}

/// Location of `program` as it would be found by `execvp`.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// SIGTERM the whole group, wait up to `grace`, then SIGKILL what is left.
///
/// `reap` lets a caller holding the direct child collect it while waiting;
/// an unreaped zombie still counts as a group member.
fn terminate_group(pgid: u32, grace: Duration, mut reap: impl FnMut() -> bool) {
    let group = -(pgid as libc::pid_t);
    unsafe {
        libc::kill(group, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        reap();
        if !group_alive(group) {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    if group_alive(group) {
        warn!(pgid, "Process group ignored SIGTERM, sending SIGKILL");
        unsafe {
            libc::kill(group, libc::SIGKILL);
        }
    }
}

fn group_alive(group: libc::pid_t) -> bool {
    unsafe { libc::kill(group, 0) == 0 }
}

#[cfg(target_os = "linux")]
static PAGE_KB: once_cell::sync::Lazy<u64> = once_cell::sync::Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 / 1024 } else { 4 }
});

/// Resident memory of `root` and all of its descendants, in KiB.
#[cfg(target_os = "linux")]
pub fn tree_rss_kb(root: u32) -> Option<u64> {
    use std::collections::HashMap;

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut rss: HashMap<u32, u64> = HashMap::new();
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((ppid, pages)) = parse_stat(&stat) {
            children.entry(ppid).or_default().push(pid);
            rss.insert(pid, pages * *PAGE_KB);
        }
    }

    let mut total = *rss.get(&root)?;
    let mut stack = children.get(&root).cloned().unwrap_or_default();
    while let Some(pid) = stack.pop() {
        total += rss.get(&pid).copied().unwrap_or(0);
        if let Some(grandchildren) = children.get(&pid) {
            stack.extend(grandchildren);
        }
    }
    Some(total)
}

#[cfg(not(target_os = "linux"))]
pub fn tree_rss_kb(_root: u32) -> Option<u64> {
    None
}

/// Parent pid and resident pages from a `/proc/<pid>/stat` line.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(u32, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let ppid = fields.get(1)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((ppid, rss))
}
