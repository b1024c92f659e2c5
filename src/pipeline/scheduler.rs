//! Dedicated-thread task scheduling.
//!
//! Each task owns one OS thread blocked on an mpsc control channel.
//! `start` nudges run the work immediately; when an interval is
//! configured, the channel's receive timeout doubles as the timed
//! re-trigger. Disposal delivers one final run with
//! [`RunReason::Disposing`] so tasks can drain, then the thread exits.
//! Worker panics are caught, reported, and suppressed: a scheduled
//! task survives its own bugs and runs again on the next trigger.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

/// Why the task body is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    /// A normal trigger: external nudge or interval expiry.
    Running,
    /// The task is being disposed; this is the final invocation and
    /// should finish or abandon outstanding work without starting new
    /// work.
    Disposing,
}

enum Control {
    Start,
    Dispose,
}

/// A background worker with an external `start` nudge and an optional
/// timed re-trigger.
pub struct ScheduledTask {
    name: &'static str,
    sender: mpsc::Sender<Control>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ScheduledTask {
    /// Spawns the worker thread.
    ///
    /// With an interval, the body runs whenever the interval elapses
    /// without an external nudge; without one, the body runs only when
    /// nudged.
    pub fn spawn<F>(name: &'static str, interval: Option<Duration>, mut work: F) -> Self
    where
        F: FnMut(RunReason) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Control>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let control = match interval {
                    Some(interval) => match receiver.recv_timeout(interval) {
                        Ok(control) => control,
                        Err(RecvTimeoutError::Timeout) => Control::Start,
                        Err(RecvTimeoutError::Disconnected) => Control::Dispose,
                    },
                    None => match receiver.recv() {
                        Ok(control) => control,
                        Err(_) => Control::Dispose,
                    },
                };
                match control {
                    Control::Start => run_guarded(name, &mut work, RunReason::Running),
                    Control::Dispose => {
                        run_guarded(name, &mut work, RunReason::Disposing);
                        break;
                    }
                }
            })
            .expect("failed to spawn scheduled task thread");

        Self {
            name,
            sender,
            handle: Some(handle),
        }
    }

    /// Nudges the task to run as soon as possible.
    pub fn start(&self) {
        // A disconnected channel means the thread already exited; the
        // nudge is moot.
        let _ = self.sender.send(Control::Start);
    }

    /// Runs the final `Disposing` invocation and joins the thread.
    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(Control::Dispose);
            // Disposal from within the task's own callback (a worker
            // dropping the last handle to its owner) must not join
            // itself; the control message alone ends the loop.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(task = self.name, "Scheduled task thread terminated abnormally.");
            }
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

fn run_guarded<F>(name: &'static str, work: &mut F, reason: RunReason)
where
    F: FnMut(RunReason),
{
    // The suppressed-error sink: a panicking worker must not take the
    // scheduler thread down with it, or the task would never run
    // again.
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| work(reason))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(task = name, panic = %message, "Scheduled task panicked; suppressing.");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn nudges_and_dispose_run_the_body() {
        let runs = Arc::new(AtomicUsize::new(0));
        let disposals = Arc::new(AtomicUsize::new(0));
        let runs_in_task = Arc::clone(&runs);
        let disposals_in_task = Arc::clone(&disposals);

        let task = ScheduledTask::spawn("test-task", None, move |reason| match reason {
            RunReason::Running => {
                runs_in_task.fetch_add(1, Ordering::SeqCst);
            }
            RunReason::Disposing => {
                disposals_in_task.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.start();
        task.start();
        task.dispose();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interval_retriggers_without_nudges() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_task = Arc::clone(&runs);
        let task = ScheduledTask::spawn(
            "interval-task",
            Some(Duration::from_millis(5)),
            move |reason| {
                if reason == RunReason::Running {
                    runs_in_task.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        std::thread::sleep(Duration::from_millis(60));
        task.dispose();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn panicking_worker_is_suppressed_and_reruns() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_task = Arc::clone(&runs);
        let task = ScheduledTask::spawn("panicky-task", None, move |_| {
            runs_in_task.fetch_add(1, Ordering::SeqCst);
            panic!("boom");
        });
        task.start();
        task.start();
        task.dispose();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
