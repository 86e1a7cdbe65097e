//! CGI script execution.
//!
//! The script runs as a child process in its own process group with the request body on its
//! standard input. Both pipes are non-blocking and serviced with `poll` against a single
//! deadline; whatever happens, the child is killed and reaped before `execute` returns.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::Status;

const READ_CHUNK: usize = 1 << 14;
const SPAWN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to start {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: io::Error,
    },
    #[error("child {0} pipe unavailable")]
    Pipe(&'static str),
    #[error("script did not finish within {0:?}")]
    Timeout(Duration),
    #[error("failed to talk to script: {0}")]
    Io(#[from] io::Error),
    #[error("failed to poll script pipes: {0}")]
    Poll(#[from] nix::Error),
}

impl CgiError {
    pub fn status(&self) -> Status {
        match self {
            CgiError::Timeout(_) => Status::GATEWAY_TIMEOUT,
            _ => Status::INTERNAL_SERVER_ERROR,
        }
    }
}

/// One script invocation.
#[derive(Debug)]
pub struct CgiJob<'a> {
    pub script: &'a Path,
    pub env: Vec<(String, String)>,
    pub input: &'a [u8],
    pub timeout: Duration,
}

/// Kills the whole process group and reaps the child on drop, unless it was already reaped.
struct ScopedChild {
    child: Child,
    reaped: bool,
}

impl ScopedChild {
    fn wait_until(&mut self, deadline: Instant, timeout: Duration) -> Result<ExitStatus, CgiError> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(CgiError::Timeout(timeout));
            }
            sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for ScopedChild {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let pid = self.child.id();
        if let Err(e) = killpg(Pid::from_raw(pid as libc::pid_t), Signal::SIGKILL) {
            debug!(target: "cgi", "killpg({}) failed: {}", pid, e);
        }
        self.child.kill().ok();
        match self.child.wait() {
            Ok(status) => debug!(target: "cgi", "killed pid {} ({})", pid, status),
            Err(e) => warn!(target: "cgi", "failed to reap pid {}: {}", pid, e),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn spawn(script: &Path, job: &CgiJob) -> Result<Child, CgiError> {
    let dir = script.parent().unwrap_or_else(|| Path::new("/"));
    let mut attempt = 0;
    loop {
        let result = Command::new(script)
            .env_clear()
            .envs(job.env.iter().map(|(name, value)| (name, value)))
            .current_dir(dir)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn();
        attempt += 1;
        match result {
            Ok(child) => return Ok(child),
            // a script written moments ago may still be open for writing elsewhere
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                sleep(Duration::from_millis(10));
            }
            Err(source) => {
                return Err(CgiError::Spawn {
                    script: script.display().to_string(),
                    source,
                })
            }
        }
    }
}

/// Run a script to completion and return everything it wrote to standard output.
pub fn execute(job: &CgiJob) -> Result<Vec<u8>, CgiError> {
    let script: PathBuf = job.script.canonicalize().map_err(|source| CgiError::Spawn {
        script: job.script.display().to_string(),
        source,
    })?;
    let deadline = Instant::now() + job.timeout;
    let mut child = ScopedChild {
        child: spawn(&script, job)?,
        reaped: false,
    };
    debug!(target: "cgi", "started {} as pid {}", script.display(), child.child.id());

    let stdin = child.child.stdin.take().ok_or(CgiError::Pipe("stdin"))?;
    let stdout = child.child.stdout.take().ok_or(CgiError::Pipe("stdout"))?;
    set_nonblocking(stdin.as_raw_fd())?;
    set_nonblocking(stdout.as_raw_fd())?;

    let output = pump(stdin, stdout, job.input, deadline, job.timeout)?;
    let status = child.wait_until(deadline, job.timeout)?;
    if !status.success() {
        warn!(target: "cgi", "{} exited with {}", script.display(), status);
    }
    debug!(target: "cgi", "{} wrote {} bytes", script.display(), output.len());
    Ok(output)
}

/// Feed `input` to the child and collect its output until EOF or the deadline.
fn pump(
    stdin: ChildStdin,
    mut stdout: ChildStdout,
    input: &[u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<u8>, CgiError> {
    let mut stdin = (!input.is_empty()).then(|| stdin);
    let mut written = 0;
    let mut output = Vec::new();
    let mut buf = [0; READ_CHUNK];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(CgiError::Timeout(timeout));
        }
        let wait = (deadline - now).as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
        let mut fds = vec![PollFd::new(stdout.as_raw_fd(), PollFlags::POLLIN)];
        if let Some(pipe) = &stdin {
            fds.push(PollFd::new(pipe.as_raw_fd(), PollFlags::POLLOUT));
        }
        match poll(&mut fds, wait) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Err(e) => return Err(e.into()),
        }
        let ready = |fd: &PollFd| fd.revents().map_or(false, |revents| !revents.is_empty());
        let stdin_ready = fds.get(1).map_or(false, ready);
        let stdout_ready = ready(&fds[0]);

        if stdin_ready {
            let mut finished = false;
            if let Some(pipe) = stdin.as_mut() {
                match pipe.write(&input[written..]) {
                    Ok(n) => written += n,
                    Err(e) if is_transient(&e) => {}
                    // the script stopped reading its input
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => written = input.len(),
                    Err(e) => return Err(e.into()),
                }
                finished = written >= input.len();
            }
            if finished {
                // closing stdin signals EOF to the script
                stdin = None;
            }
        }
        if stdout_ready {
            match stdout.read(&mut buf) {
                Ok(0) => return Ok(output),
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
