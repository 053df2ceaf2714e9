//! Launched execution units and their bounded-wait shutdown.
//!
//! Load workers are forked processes; the memory worker and the killfile
//! monitor are threads. Both kinds expose the same drain contract: wait for
//! natural exit until a deadline, then escalate.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use libc::{c_int, pid_t};

/// How often a draining handle re-checks liveness.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Exit code a forked worker uses when its body panicked.
const PANIC_EXIT_CODE: c_int = 101;

/// How a worker left the drain phase.
#[derive(Debug)]
pub enum Drain<T> {
    /// Exited on its own before the deadline.
    Finished(T),
    /// Exited on its own, but abnormally (panic, non-zero status, signal).
    Failed(String),
    /// Still running at the deadline. Processes are killed with SIGKILL;
    /// threads cannot be killed, so they are detached and die with the process.
    Forced,
}

/// Identity plus liveness of a launched unit.
pub trait WorkerHandle {
    type Output;

    fn id(&self) -> &str;

    fn is_alive(&mut self) -> bool;

    /// Wait until `deadline` for the unit to exit, escalating afterwards.
    /// Never blocks past the deadline by more than one kill-and-reap.
    fn drain_until(self, deadline: Instant) -> Drain<Self::Output>;
}

/// Terminal state of a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Code(c_int),
    Signal(c_int),
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exited with status {code}"),
            Exit::Signal(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}

/// A forked child running a worker body.
pub struct ProcessWorker {
    id: String,
    pid: pid_t,
    exit: Option<Exit>,
}

impl ProcessWorker {
    /// Fork and run `body` in the child, which then `_exit`s.
    ///
    /// The child ignores SIGINT (the supervisor turns Ctrl-C into a stop
    /// request), restores the default SIGTERM action, and on Linux asks to be
    /// SIGKILLed when the parent goes away. `body` must not allocate, lock or
    /// log: the parent may have other threads at fork time.
    pub fn spawn<F>(id: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(),
    {
        let id = id.into();
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            unsafe {
                libc::signal(libc::SIGINT, libc::SIG_IGN);
                libc::signal(libc::SIGTERM, libc::SIG_DFL);
                #[cfg(target_os = "linux")]
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
            }
            let code = match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(()) => 0,
                Err(_) => PANIC_EXIT_CODE,
            };
            unsafe { libc::_exit(code) };
        }
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::debug!(worker = %id, pid, "load worker forked");
        Ok(Self { id, pid, exit: None })
    }

    /// Reap the child if it has exited. `block` waits for it.
    fn reap(&mut self, block: bool) -> Option<Exit> {
        if self.exit.is_some() {
            return self.exit;
        }

        let flags = if block { 0 } else { libc::WNOHANG };
        let mut status: c_int = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if ret == self.pid {
                break;
            }
            if ret == 0 {
                return None;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // ECHILD: someone else reaped it. Treat as a clean exit.
            self.exit = Some(Exit::Code(0));
            return self.exit;
        }

        self.exit = if libc::WIFEXITED(status) {
            Some(Exit::Code(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(Exit::Signal(libc::WTERMSIG(status)))
        } else {
            None
        };
        self.exit
    }

    fn kill(&mut self) {
        if self.reap(false).is_none() {
            unsafe { libc::kill(self.pid, libc::SIGKILL) };
            self.reap(true);
        }
    }
}

impl WorkerHandle for ProcessWorker {
    type Output = ();

    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&mut self) -> bool {
        self.reap(false).is_none()
    }

    fn drain_until(mut self, deadline: Instant) -> Drain<()> {
        loop {
            if let Some(exit) = self.reap(false) {
                return match exit {
                    Exit::Code(0) => Drain::Finished(()),
                    other => Drain::Failed(other.to_string()),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(DRAIN_POLL.min(deadline - now));
        }

        tracing::warn!(worker = %self.id, pid = self.pid, "drain window elapsed, sending SIGKILL");
        self.kill();
        Drain::Forced
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.kill();
    }
}

/// A thread running a worker body in the supervisor's address space.
pub struct ThreadWorker<T> {
    id: String,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> ThreadWorker<T> {
    pub fn spawn<F>(id: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let id = id.into();
        let handle = thread::Builder::new().name(id.clone()).spawn(body)?;
        tracing::debug!(worker = %id, "worker thread started");
        Ok(Self { id, handle })
    }
}

impl<T> WorkerHandle for ThreadWorker<T> {
    type Output = T;

    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&mut self) -> bool {
        !self.handle.is_finished()
    }

    fn drain_until(self, deadline: Instant) -> Drain<T> {
        while !self.handle.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(worker = %self.id, "drain window elapsed, detaching thread");
                return Drain::Forced;
            }
            thread::sleep(DRAIN_POLL.min(deadline - now));
        }

        match self.handle.join() {
            Ok(value) => Drain::Finished(value),
            Err(_) => Drain::Failed("thread panicked".to_string()),
        }
    }
}
