//! External engine processes and operator cancellation.
//!
//! [`EngineProcess`] is a handle on one shell-launched engine run. On unix the
//! shell becomes the leader of a fresh process group, so [`kill_group`]
//! reaches everything the engine forks. Elsewhere only the direct child can
//! be killed.
//!
//! [`JobControl`] is shared between the signal handlers and the executor.
//!
//! [`kill_group`]: EngineProcess::kill_group

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};

use crate::error::PipelineError;

pub struct EngineProcess {
    child: Child,
    command: String,
}

impl EngineProcess {
    /// Runs `command` through the platform shell with `cwd` as working
    /// directory. All standard streams are detached from the controller.
    pub fn spawn(command: &str, cwd: &Path) -> Result<Self, PipelineError> {
        let mut cmd = shell(command);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| PipelineError::Spawn {
            command: command.to_string(),
            source,
        })?;
        debug!(pid = ?child.id(), command, "engine spawned");
        Ok(Self {
            child,
            command: command.to_string(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Non-blocking liveness check: `Some` once the process has exited.
    pub fn poll(&mut self) -> Result<Option<ExitStatus>, PipelineError> {
        Ok(self.child.try_wait()?)
    }

    /// SIGKILLs the whole process group, then reaps the leader.
    pub async fn kill_group(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: `pid` is our own child, not yet reaped, so the id cannot
                // have been recycled; process_group(0) made it the group leader.
                let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
                if rc != 0 {
                    warn!(pid, error = %std::io::Error::last_os_error(), "killpg failed, killing leader only");
                }
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "engine already gone");
        }
        if let Err(e) = self.child.wait().await {
            warn!(error = %e, "could not reap engine process");
        }
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// What an operator interrupt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    /// Kill the running job, keep the controller alive.
    SkipJob,
    /// Kill the running job and leave the control loop.
    Quit,
}

#[derive(Debug)]
pub struct JobControl {
    stop: Notify,
    quit: AtomicBool,
    last_interrupt: Mutex<Option<Instant>>,
    debounce: Duration,
}

impl JobControl {
    pub fn new(debounce: Duration) -> Self {
        Self {
            stop: Notify::new(),
            quit: AtomicBool::new(false),
            last_interrupt: Mutex::new(None),
            debounce,
        }
    }

    /// Kills the current job, if any. Has no lasting effect when idle.
    pub fn stop_current_job(&self) {
        self.stop.notify_waiters();
    }

    /// Handles one Ctrl+C. A second one within the debounce window quits.
    pub fn interrupt(&self) -> StopRequest {
        let now = Instant::now();
        let repeated = {
            let mut last = self
                .last_interrupt
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let repeated = last.is_some_and(|at| now.duration_since(at) < self.debounce);
            *last = Some(now);
            repeated
        };
        if repeated {
            self.shutdown();
            StopRequest::Quit
        } else {
            self.stop_current_job();
            StopRequest::SkipJob
        }
    }

    /// Quits the controller after killing the current job.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Future resolving on the next stop or quit request. Call `enable` on
    /// the pinned future before polling anything else so no request is lost.
    pub fn stopped(&self) -> Notified<'_> {
        self.stop.notified()
    }
}
