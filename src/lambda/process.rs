use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BridgeError;

const SHELL: &str = "/bin/sh";
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Terminating,
    Reaped,
    /// Waiting on the child failed; the slot may not have been reclaimed.
    Failed,
}

/// A running filter process and the parent-side ends of its two pipes.
///
/// The pipe ends are shared (`Arc<File>`) with the multiplexing loop and
/// the outbound writer. They are only closed once every user has let go
/// *and* [`LambdaProcess::close_pipes`] has run, so the descriptors outlive
/// the process itself.
pub struct LambdaProcess {
    child: Child,
    pid: i32,
    to_lambda: Option<Arc<File>>,
    from_lambda: Option<Arc<File>>,
    state: ProcessState,
    exit_status: Option<ExitStatus>,
    /// How long [`LambdaProcess::terminate`] waits between SIGTERM and SIGKILL.
    grace: Duration,
}

impl LambdaProcess {
    /// Spawn `sh -c <command>` in its own process group with `env` added
    /// to its environment. `grace` bounds how long termination waits for
    /// the filter to exit on SIGTERM, including when the process is dropped.
    ///
    /// Both retained pipe ends are switched to non-blocking mode before
    /// this returns. If that fails the child is killed and reaped again.
    pub fn spawn(
        command: &str,
        env: &[(&'static str, String)],
        grace: Duration,
    ) -> Result<Self, BridgeError> {
        let spawn_err = |source: std::io::Error| BridgeError::Spawn {
            command: command.to_string(),
            source,
        };

        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id() as i32;

        let pipes = child
            .stdin
            .take()
            .zip(child.stdout.take())
            .ok_or_else(|| std::io::Error::other("child stdio was not piped"))
            .and_then(|(stdin, stdout)| {
                let to_lambda = File::from(OwnedFd::from(stdin));
                let from_lambda = File::from(OwnedFd::from(stdout));
                set_nonblocking(to_lambda.as_fd())?;
                set_nonblocking(from_lambda.as_fd())?;
                Ok((to_lambda, from_lambda))
            });

        let (to_lambda, from_lambda) = match pipes {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_err(e));
            }
        };

        log::info!("Lambda process spawned with PID {} (`{}`)", pid, command);

        Ok(Self {
            child,
            pid,
            to_lambda: Some(Arc::new(to_lambda)),
            from_lambda: Some(Arc::new(from_lambda)),
            state: ProcessState::Running,
            exit_status: None,
            grace,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    #[cfg(test)]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    #[cfg(test)]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Write end of the filter's stdin.
    pub fn to_lambda(&self) -> Option<Arc<File>> {
        self.to_lambda.clone()
    }

    /// Read end of the filter's stdout.
    pub fn from_lambda(&self) -> Option<Arc<File>> {
        self.from_lambda.clone()
    }

    /// SIGTERM the process group, give it the grace period to exit, then
    /// SIGKILL and wait. A child that already exited is only reaped.
    ///
    /// Calling this again after the child was reaped does nothing.
    pub fn terminate(&mut self) {
        let grace = self.grace;
        if self.exit_status.is_some() || self.state == ProcessState::Failed {
            return;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped(status);
                return;
            }
            Ok(None) => {}
            Err(e) => log::warn!("try_wait on lambda {} failed: {}", self.pid, e),
        }

        self.state = ProcessState::Terminating;
        log::debug!("Sending SIGTERM to lambda process group {}", self.pid);
        self.signal(libc::SIGTERM);

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.reaped(status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(REAP_POLL_INTERVAL),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("try_wait on lambda {} failed: {}", self.pid, e);
                    break;
                }
            }
        }

        log::warn!(
            "Lambda process {} ignored SIGTERM for {:?}, sending SIGKILL",
            self.pid,
            grace
        );
        self.signal(libc::SIGKILL);
        match self.child.wait() {
            Ok(status) => self.reaped(status),
            Err(e) => {
                log::error!("Failed to reap lambda process {}: {}", self.pid, e);
                self.state = ProcessState::Failed;
            }
        }
    }

    /// Drop this side's references to both pipe ends.
    pub fn close_pipes(&mut self) {
        let had_pipes = self.to_lambda.take().is_some() | self.from_lambda.take().is_some();
        if had_pipes {
            log::debug!("Closed pipes of lambda process {}", self.pid);
        }
    }

    fn signal(&self, sig: libc::c_int) {
        // Negative pid addresses the whole group, which also reaches
        // commands the shell forked instead of exec'ing.
        let ret = unsafe { libc::kill(-self.pid, sig) };
        if ret < 0 {
            let ret = unsafe { libc::kill(self.pid, sig) };
            if ret < 0 {
                log::debug!(
                    "kill({}, {}) failed: {}",
                    self.pid,
                    sig,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    fn reaped(&mut self, status: ExitStatus) {
        log::info!("Lambda process {} exited: {}", self.pid, status);
        self.exit_status = Some(status);
        self.state = ProcessState::Reaped;
    }
}

impl Drop for LambdaProcess {
    fn drop(&mut self) {
        self.terminate();
        self.close_pipes();
    }
}

/// Set `O_NONBLOCK` on a descriptor, keeping its other status flags.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
