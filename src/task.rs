//! Runs build commands, potentially in parallel.
//! Unaware of the build graph or pools; just command execution and the
//! extraction of discovered dependencies from the results.

use crate::depfile;
use crate::graph::{DepsKind, EdgeId, RspFile};
use crate::scanner::Scanner;
use anyhow::{anyhow, bail};
use std::path::Path;
use std::sync::mpsc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// The result of executing one build command.
pub struct TaskResult {
    pub termination: Termination,
    /// Captured stdout+stderr.
    pub output: Vec<u8>,
    pub discovered_deps: Option<Vec<String>>,
}

pub struct FinishedTask {
    /// A (faked) "thread id", used to lane parallel tasks in trace output.
    pub tid: usize,
    pub edge: EdgeId,
    pub span: (Instant, Instant),
    pub result: TaskResult,
}

/// Everything the worker needs to run one edge's command.
pub struct TaskSpec {
    pub cmdline: String,
    pub use_console: bool,
    pub deps: DepsKind,
    pub depfile: Option<String>,
    pub msvc_deps_prefix: Option<String>,
    pub rspfile: Option<RspFile>,
}

const DEFAULT_MSVC_PREFIX: &str = "Note: including file:";

/// Reads dependencies from a makefile-syntax `.d` file, removing it
/// afterwards; its content now lives in the deps log.
fn read_depfile(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => bail!("read {}: {}", path.display(), err),
    };
    bytes.push(0);
    let mut scanner = Scanner::new(&bytes);
    let parsed = depfile::parse(&mut scanner)
        .map_err(|err| anyhow!(scanner.format_parse_error(path, err)))?;
    let mut deps: Vec<String> = Vec::new();
    for (_target, target_deps) in parsed.iter() {
        for dep in target_deps {
            if !deps.iter().any(|d| d == dep) {
                deps.push((*dep).to_owned());
            }
        }
    }
    let _ = std::fs::remove_file(path);
    Ok(deps)
}

/// Extract `/showIncludes` deps from captured output, returning the deps and
/// the output with those lines removed.
fn parse_showincludes(output: &[u8], prefix: &str) -> (Vec<String>, Vec<u8>) {
    let mut deps = Vec::new();
    let mut filtered = Vec::new();
    for line in output.split_inclusive(|&b| b == b'\n') {
        let text = String::from_utf8_lossy(line);
        match text.trim_end().strip_prefix(prefix) {
            Some(path) if !path.trim().is_empty() => {
                let path = path.trim().to_owned();
                if !deps.contains(&path) {
                    deps.push(path);
                }
            }
            _ => filtered.extend_from_slice(line),
        }
    }
    (deps, filtered)
}

fn write_rspfile(rspfile: &RspFile) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(&rspfile.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&rspfile.path, &rspfile.content)?;
    Ok(())
}

/// Executes a build task as a subprocess.
/// Returns an Err() only when we failed outside of the process itself.
fn run_task(spec: &TaskSpec) -> anyhow::Result<TaskResult> {
    if let Some(rspfile) = &spec.rspfile {
        write_rspfile(rspfile)?;
    }
    let mut result = run_command(&spec.cmdline, spec.use_console)?;
    if result.termination == Termination::Success {
        match spec.deps {
            DepsKind::Gcc => {
                if let Some(depfile) = &spec.depfile {
                    result.discovered_deps = Some(read_depfile(Path::new(depfile))?);
                }
            }
            DepsKind::Msvc => {
                let prefix = spec
                    .msvc_deps_prefix
                    .as_deref()
                    .unwrap_or(DEFAULT_MSVC_PREFIX);
                let (deps, filtered) = parse_showincludes(&result.output, prefix);
                result.output = filtered;
                result.discovered_deps = Some(deps);
            }
            DepsKind::None => {}
        }
    }
    Ok(result)
}

#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret != 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_string_lossy());
    }
    Ok(())
}

#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        // Safety: zeroed init followed by the libc init call.
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Spawn `/bin/sh -c cmdline` with stdout and stderr merged into one pipe.
/// std::process can't feed both streams into a single pipe, which we want so
/// interleaved output stays interleaved.  Console tasks skip the capture and
/// inherit our terminal.
#[cfg(unix)]
fn run_command(cmdline: &str, use_console: bool) -> anyhow::Result<TaskResult> {
    use std::io::Read;
    use std::io::Write;
    use std::os::unix::process::ExitStatusExt;

    let (pid, mut pipe) = unsafe {
        use std::os::fd::FromRawFd;

        let mut actions = PosixSpawnFileActions::new()?;
        let mut pipe_fds: [libc::c_int; 2] = [0; 2];
        if !use_console {
            if libc::pipe(pipe_fds.as_mut_ptr()) != 0 {
                bail!("pipe: {}", std::io::Error::last_os_error());
            }
            actions.adddup2(pipe_fds[1], 1)?;
            actions.adddup2(pipe_fds[1], 2)?;
            actions.addclose(pipe_fds[0])?;
            actions.addclose(pipe_fds[1])?;
        }

        let shell = c"/bin/sh";
        let dash_c = c"-c";
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv = [
            shell.as_ptr(),
            dash_c.as_ptr(),
            cmdline_nul.as_ptr(),
            std::ptr::null(),
        ];

        let mut pid: libc::pid_t = 0;
        check_posix(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                shell.as_ptr(),
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                std::ptr::null(),
            ),
        )?;

        if use_console {
            (pid, None)
        } else {
            check_posix("close", libc::close(pipe_fds[1]))?;
            (pid, Some(std::fs::File::from_raw_fd(pipe_fds[0])))
        }
    };

    let mut output = Vec::new();
    if let Some(pipe) = pipe.as_mut() {
        pipe.read_to_end(&mut output)?;
    }

    let status = unsafe {
        let mut status: libc::c_int = 0;
        if libc::waitpid(pid, &mut status, 0) < 0 {
            bail!("waitpid: {}", std::io::Error::last_os_error());
        }
        std::process::ExitStatus::from_raw(status)
    };

    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    write!(output, "interrupted")?;
                    termination = Termination::Interrupted;
                }
                _ => write!(output, "signal {}", sig)?,
            }
        }
    }

    Ok(TaskResult {
        termination,
        output,
        discovered_deps: None,
    })
}

#[cfg(not(unix))]
fn run_command(cmdline: &str, use_console: bool) -> anyhow::Result<TaskResult> {
    use std::process::{Command, Stdio};

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(cmdline);
    let (termination, output) = if use_console {
        let status = cmd.status()?;
        (
            if status.success() {
                Termination::Success
            } else {
                Termination::Failure
            },
            Vec::new(),
        )
    } else {
        cmd.stdin(Stdio::null());
        let out = cmd.output()?;
        let mut bytes = out.stdout;
        bytes.extend_from_slice(&out.stderr);
        (
            if out.status.success() {
                Termination::Success
            } else {
                Termination::Failure
            },
            bytes,
        )
    };
    Ok(TaskResult {
        termination,
        output,
        discovered_deps: None,
    })
}

/// The 1-minute load average, where the platform exposes one.
pub fn load_average() -> Option<f64> {
    #[cfg(unix)]
    {
        let mut avgs: [f64; 3] = [0.0; 3];
        let rc = unsafe { libc::getloadavg(avgs.as_mut_ptr(), 3) };
        if rc < 1 {
            None
        } else {
            Some(avgs[0])
        }
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Tracks faked "thread ids": small integers assigned to running tasks so
/// trace output gets stable lanes.
#[derive(Default)]
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    running: usize,
    tids: ThreadIds,
    parallelism: usize,
    /// Refuse new admissions while the 1-minute load exceeds this; <= 0
    /// disables the governor.
    max_load_average: f64,
}

impl Runner {
    pub fn new(parallelism: usize, max_load_average: f64) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::default(),
            parallelism,
            max_load_average,
        }
    }

    pub fn can_start_more(&self) -> bool {
        if self.running >= self.parallelism {
            return false;
        }
        if self.max_load_average > 0.0 {
            if let Some(load) = load_average() {
                if load > self.max_load_average {
                    return false;
                }
            }
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(&mut self, edge: EdgeId, spec: TaskSpec) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = run_task(&spec).unwrap_or_else(|err| TaskResult {
                termination: Termination::Failure,
                output: err.to_string().into_bytes(),
                discovered_deps: None,
            });
            let finish = Instant::now();
            // The send only fails if the receiver is shutting down.
            let _ = tx.send(FinishedTask {
                tid,
                edge,
                span: (start, finish),
                result,
            });
        });
        self.running += 1;
    }

    /// Wait for some task to complete.  May block for a long time.
    pub fn wait(&mut self) -> FinishedTask {
        let task = self.finished_recv.recv().expect("runner thread lost");
        self.tids.release(task.tid);
        self.running -= 1;
        task
    }
}
