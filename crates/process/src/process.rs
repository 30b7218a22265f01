use common::{CompDisp, StateMachine};
use monad::{cont, Error, Promise, Result};
use reactor::Reactor;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;
use stream::{fd_cloexec, BufferedStream, File, Stream};

pub const NOT_STARTED: usize = 0;
pub const FORKING: usize = 1;
pub const RUNNING: usize = 2;
pub const DISPOSED: usize = 3;

const STATE_NAMES: &[&str] = &["not-started", "forking", "running", "disposed"];

/// Exit code used by the child trampoline to signal exec failure,
/// distinct from ordinary command exit codes.
pub const EXEC_FAILURE_CODE: i32 = 111;

/// Policy for one of the child's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    /// Share this process's descriptor.
    Inherit,
    /// Create a pipe; the parent side becomes a buffered stream.
    Pipe,
    /// Wire the child side to /dev/null.
    Null,
    /// Use the given descriptor as the child side.
    Fd(RawFd),
}

pub struct ProcessOpts {
    pub command: Vec<String>,
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
    pub shell: bool,
    pub environ: Option<Vec<(String, String)>>,
    pub check: bool,
    pub bufsize: Option<usize>,
    /// SIGTERM delay applied on dispose while the child is alive;
    /// `None` never kills.
    pub kill_delay: Option<Duration>,
    /// Runs in the child between fork and exec.
    pub preexec: Option<Box<dyn FnOnce() -> Result<()>>>,
}

impl ProcessOpts {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessOpts {
            command: command.into_iter().map(Into::into).collect(),
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
            shell: false,
            environ: None,
            check: true,
            bufsize: None,
            kill_delay: Some(Duration::from_secs(10)),
            preexec: None,
        }
    }
}

struct StdioPlan {
    dups: Vec<(RawFd, RawFd)>,
    close_in_child: Vec<RawFd>,
    close_in_parent: Vec<RawFd>,
    parent: [Option<RawFd>; 3],
}

fn raw_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // Safety: fds points at a live two-element array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(Error::connection(format!(
            "pipe: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((fds[0], fds[1]))
}

fn plan_stdio(policies: [&Stdio; 3]) -> Result<StdioPlan> {
    let mut plan = StdioPlan {
        dups: Vec::new(),
        close_in_child: Vec::new(),
        close_in_parent: Vec::new(),
        parent: [None, None, None],
    };
    let mut null_fd: Option<RawFd> = None;

    for (slot, policy) in policies.into_iter().enumerate() {
        let target = slot as RawFd;
        let child_reads = slot == 0;
        match policy {
            Stdio::Inherit => {}
            Stdio::Fd(fd) => plan.dups.push((*fd, target)),
            Stdio::Null => {
                let fd = match null_fd {
                    Some(fd) => fd,
                    None => {
                        // Safety: opening a well-known path.
                        let fd = unsafe {
                            libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR)
                        };
                        if fd < 0 {
                            return Err(Error::connection(format!(
                                "open /dev/null: {}",
                                std::io::Error::last_os_error()
                            )));
                        }
                        null_fd = Some(fd);
                        plan.close_in_parent.push(fd);
                        fd
                    }
                };
                plan.dups.push((fd, target));
            }
            Stdio::Pipe => {
                let (read_end, write_end) = raw_pipe()?;
                let (child_fd, parent_fd) = if child_reads {
                    (read_end, write_end)
                } else {
                    (write_end, read_end)
                };
                plan.dups.push((child_fd, target));
                plan.close_in_parent.push(child_fd);
                plan.close_in_child.push(parent_fd);
                plan.parent[slot] = Some(parent_fd);
            }
        }
    }
    Ok(plan)
}

/// Child-side trampoline: plumb descriptors, detach from the parent's
/// session, run preexec, exec. Returns only on failure.
///
/// Runs between fork and exec, so it sticks to plumbing syscalls and
/// the pre-built argv; the framework is single-threaded by
/// construction, which keeps the brief allocating paths (preexec,
/// environment setup) safe here.
fn child_exec(
    plan: &StdioPlan,
    preexec: Option<Box<dyn FnOnce() -> Result<()>>>,
    argv: &[*const libc::c_char],
    environ: &Option<Vec<(CString, CString)>>,
) -> Error {
    // Safety: descriptor plumbing with fds recorded in the plan.
    unsafe {
        for fd in &plan.close_in_child {
            libc::close(*fd);
        }
        for (source, target) in &plan.dups {
            if source != target && libc::dup2(*source, *target) < 0 {
                return Error::connection(format!(
                    "dup2({source}, {target}): {}",
                    std::io::Error::last_os_error()
                ));
            }
        }
        for (source, _) in &plan.dups {
            if *source > 2 {
                libc::close(*source);
            }
        }
        if libc::chdir(b"/\0".as_ptr() as *const libc::c_char) < 0 {
            return Error::process(format!("chdir: {}", std::io::Error::last_os_error()));
        }
        libc::setsid();
    }

    if let Some(preexec) = preexec {
        if let Err(error) = preexec() {
            return error.context("preexec failed");
        }
    }
    if let Some(environ) = environ {
        for (key, value) in environ {
            // Safety: pre-built NUL-terminated strings.
            unsafe { libc::setenv(key.as_ptr(), value.as_ptr(), 1) };
        }
    }

    // Safety: argv is NULL-terminated and outlives the call.
    unsafe { libc::execvp(argv[0], argv.as_ptr()) };
    Error::process(format!(
        "execvp failed: {}",
        std::io::Error::last_os_error()
    ))
}

fn report_exec_failure(status_fd: RawFd, error: &Error) {
    let encoded = postcard::to_stdvec(error).unwrap_or_default();
    let mut remaining = encoded.as_slice();
    while !remaining.is_empty() {
        // Safety: writing a live slice to the status pipe.
        let n = unsafe {
            libc::write(
                status_fd,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
            )
        };
        if n <= 0 {
            break;
        }
        remaining = &remaining[n as usize..];
    }
}

struct ProcInner {
    pid: libc::pid_t,
    command: Vec<String>,
    state: Rc<StateMachine>,
    stdin: Option<BufferedStream>,
    stdout: Option<BufferedStream>,
    stderr: Option<BufferedStream>,
    status: Promise<i32>,
    started: Promise<()>,
    kill_delay: Option<Duration>,
    core: Reactor,
    disp: CompDisp,
}

/// Supervised child process.
///
/// Forks and execs the command with the configured stdio plumbing. A
/// dedicated status pipe (close-on-exec on the child side) carries a
/// serialized error if exec or preexec fails; otherwise it closes on
/// exec and the supervisor moves to running. The exit status arrives
/// through the reactor's child queue.
pub struct Process {
    inner: Rc<ProcInner>,
}

impl Clone for Process {
    fn clone(&self) -> Self {
        Process {
            inner: self.inner.clone(),
        }
    }
}

impl Process {
    pub fn spawn(mut opts: ProcessOpts, core: &Reactor) -> Result<Process> {
        let state = Rc::new(StateMachine::new(
            &[
                (NOT_STARTED, &[FORKING, DISPOSED]),
                (FORKING, &[RUNNING, DISPOSED]),
                (RUNNING, &[DISPOSED]),
                (DISPOSED, &[DISPOSED]),
            ],
            STATE_NAMES,
        ));
        state.transition(FORKING)?;

        let command = if opts.shell {
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                opts.command.join(" "),
            ]
        } else {
            opts.command.clone()
        };
        if command.is_empty() {
            return Err(Error::value("empty command"));
        }

        let mut plan = plan_stdio([&opts.stdin, &opts.stdout, &opts.stderr])?;

        // Status pipe: the write end is close-on-exec, so a successful
        // exec closes it and the parent reads clean EOF.
        let (status_read, status_write) = raw_pipe()?;
        fd_cloexec(status_write, true)?;
        plan.close_in_child.push(status_read);

        let argv: Vec<CString> = command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::value("command contains NUL bytes"))?;
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let environ = match &opts.environ {
            None => None,
            Some(pairs) => {
                let mut built = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    built.push((
                        CString::new(key.as_str())
                            .map_err(|_| Error::value("environment key contains NUL"))?,
                        CString::new(value.as_str())
                            .map_err(|_| Error::value("environment value contains NUL"))?,
                    ));
                }
                Some(built)
            }
        };

        let preexec = opts.preexec.take();
        // Safety: single fork point; the child immediately runs the
        // exec trampoline and never returns into this function.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::process(format!(
                "fork: {}",
                std::io::Error::last_os_error()
            )));
        }
        if pid == 0 {
            let error = child_exec(&plan, preexec, &argv_ptrs, &environ);
            report_exec_failure(status_write, &error);
            // Safety: terminating the child without unwinding.
            unsafe { libc::_exit(EXEC_FAILURE_CODE) };
        }

        // Parent: release the child-side descriptors.
        for fd in &plan.close_in_parent {
            // Safety: closing ends now owned by the child.
            unsafe { libc::close(*fd) };
        }
        // Safety: the parent's copy of the status write end.
        unsafe { libc::close(status_write) };

        let wrap = |fd: Option<RawFd>| -> Result<Option<BufferedStream>> {
            match fd {
                None => Ok(None),
                Some(fd) => {
                    fd_cloexec(fd, true)?;
                    Ok(Some(BufferedStream::new(
                        Rc::new(File::new(fd, true, core)?),
                        opts.bufsize,
                    )))
                }
            }
        };
        let stdin = wrap(plan.parent[0])?;
        let stdout = wrap(plan.parent[1])?;
        let stderr = wrap(plan.parent[2])?;
        fd_cloexec(status_read, true)?;
        let status_reader = BufferedStream::new(Rc::new(File::new(status_read, true, core)?), None);

        let (started, started_ret) = Promise::pending();
        let status = {
            let core = core.clone();
            let command = command.clone();
            let state = state.clone();
            let check = opts.check;
            cont(async move {
                // Register the wait before anything else: the child may
                // already be gone.
                let wait = core.waitpid(pid).promise();

                let report = match status_reader.read_until_eof().await {
                    Ok(data) if !data.is_empty() => match postcard::from_bytes::<Error>(&data) {
                        Ok(error) => Some(error.hop(format!("exec of {command:?}"))),
                        Err(err) => Some(Error::process(format!(
                            "undecodable exec failure report: {err}"
                        ))),
                    },
                    Ok(_) => None,
                    Err(error) if error.is_broken_pipe() => None,
                    Err(error) => Some(error),
                };
                status_reader.dispose();

                if let Some(error) = report {
                    started_ret.error(error.clone());
                    let _ = wait.cont().await; // reap the trampoline
                    return Err(error);
                }
                let _ = state.transition(RUNNING);
                started_ret.value(());

                let code = wait.cont().await?;
                if check && code != 0 {
                    return Err(Error::process(format!(
                        "command {command:?} exited with status {code}"
                    )));
                }
                Ok(code)
            })
            .promise()
        };

        let disp = CompDisp::new();
        for stream in [&stdin, &stdout, &stderr].into_iter().flatten() {
            let stream = stream.clone();
            disp.add_action(move || stream.dispose());
        }

        Ok(Process {
            inner: Rc::new(ProcInner {
                pid,
                command,
                state,
                stdin,
                stdout,
                stderr,
                status,
                started,
                kill_delay: opts.kill_delay,
                core: core.clone(),
                disp,
            }),
        })
    }

    pub fn pid(&self) -> i32 {
        self.inner.pid
    }

    pub fn command(&self) -> &[String] {
        &self.inner.command
    }

    pub fn stdin(&self) -> Option<BufferedStream> {
        self.inner.stdin.clone()
    }

    pub fn stdout(&self) -> Option<BufferedStream> {
        self.inner.stdout.clone()
    }

    pub fn stderr(&self) -> Option<BufferedStream> {
        self.inner.stderr.clone()
    }

    /// Resolves once exec succeeded (the status pipe closed clean), or
    /// with the child's serialized error.
    pub fn started(&self) -> Promise<()> {
        self.inner.started.clone()
    }

    /// Resolves with the decoded exit status; under `check`, a
    /// non-zero exit resolves with a process error instead.
    pub fn status(&self) -> Promise<i32> {
        self.inner.status.clone()
    }

    pub fn state(&self) -> usize {
        self.inner.state.state()
    }

    /// Release the stdio streams. If the child is still alive and the
    /// kill policy allows, SIGTERM goes to its process group after the
    /// configured delay.
    pub fn dispose(&self) {
        if !matches!(self.inner.state.transition(DISPOSED), Ok(true)) {
            return;
        }
        self.inner.disp.dispose();

        if self.inner.status.completed() {
            return;
        }
        let Some(delay) = self.inner.kill_delay else {
            return;
        };
        let pid = self.inner.pid;
        let status = self.inner.status.clone();
        let core = self.inner.core.clone();
        cont(async move {
            if !delay.is_zero() {
                let _ = core.sleep(delay).await;
            }
            if !status.completed() {
                tracing::warn!(pid, "terminating process group on dispose");
                // Safety: signalling the child's own process group.
                unsafe { libc::kill(-pid, libc::SIGTERM) };
            }
            Ok(())
        })
        .run_detached();
    }
}
