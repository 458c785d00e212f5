/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Request/response correlation.
//!
//! A `Task` binds one outbound `Command` to the one reply that answers it.  Its terminal status
//! is a set of flags rather than a single state because completion (from the receive pump),
//! cancellation (from dispose, transport failure or a caller timing out) and failure (from the
//! send path) can race.  Only the first transition takes effect, so each task is completed,
//! canceled or failed exactly once and its waiter is woken exactly once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use futures_channel::oneshot;

use crate::{
    error::{self, Error},
    protocol::{Command, RespValue},
};

const COMPLETED: u8 = 0b001;
const CANCELED: u8 = 0b010;
const FAILED: u8 = 0b100;

/// Snapshot of a task's status flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus(u8);

impl TaskStatus {
    pub fn is_completed(self) -> bool {
        self.0 & COMPLETED != 0
    }

    pub fn is_canceled(self) -> bool {
        self.0 & CANCELED != 0
    }

    pub fn is_failed(self) -> bool {
        self.0 & FAILED != 0
    }

    pub fn is_pending(self) -> bool {
        self.0 == 0
    }
}

pub(crate) type TaskResult = Result<RespValue, Error>;

/// How the owner of a task observes its result
enum Waiter {
    /// A caller blocked in `Task::wait`
    Blocking(Condvar),
    /// A caller holding the receiving half of this channel
    Future(Mutex<Option<oneshot::Sender<TaskResult>>>),
    /// Internal bookkeeping commands (e.g. `SELECT`) whose result nobody reads
    Detached,
}

pub(crate) struct Task {
    command: Command,
    flags: AtomicU8,
    result: Mutex<Option<TaskResult>>,
    waiter: Waiter,
    retried: AtomicU8,
}

impl Task {
    pub(crate) fn blocking(command: Command) -> Task {
        Task::with_waiter(command, Waiter::Blocking(Condvar::new()))
    }

    pub(crate) fn future(command: Command) -> (Task, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        (Task::with_waiter(command, Waiter::Future(Mutex::new(Some(tx)))), rx)
    }

    pub(crate) fn detached(command: Command) -> Task {
        Task::with_waiter(command, Waiter::Detached)
    }

    fn with_waiter(command: Command, waiter: Waiter) -> Task {
        Task {
            command,
            flags: AtomicU8::new(0),
            result: Mutex::new(None),
            waiter,
            retried: AtomicU8::new(0),
        }
    }

    pub(crate) fn command(&self) -> &Command {
        &self.command
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn is_future(&self) -> bool {
        matches!(self.waiter, Waiter::Future(_))
    }

    pub(crate) fn is_detached(&self) -> bool {
        matches!(self.waiter, Waiter::Detached)
    }

    /// Only future-style tasks survive a transport failure, and only once
    pub(crate) fn take_retry(&self) -> bool {
        self.is_future() && self.retried.swap(1, Ordering::AcqRel) == 0
    }

    /// Claim the single terminal transition.  Returns `false` if another transition won.
    fn transition(&self, flag: u8) -> bool {
        self.flags
            .compare_exchange(0, flag, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn complete(&self, value: RespValue) -> bool {
        self.finish(COMPLETED, Ok(value))
    }

    pub(crate) fn cancel(&self) -> bool {
        self.finish(CANCELED, Err(Error::Canceled(TaskStatus(CANCELED))))
    }

    pub(crate) fn fail(&self, err: Error) -> bool {
        self.finish(FAILED, Err(err))
    }

    fn finish(&self, flag: u8, result: TaskResult) -> bool {
        if !self.transition(flag) {
            return false;
        }
        let mut slot = match self.result.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &self.waiter {
            Waiter::Blocking(cond) => {
                *slot = Some(result);
                cond.notify_all();
            }
            Waiter::Future(sender) => {
                drop(slot);
                let sender = match sender.lock() {
                    Ok(mut sender) => sender.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                if let Some(tx) = sender {
                    // The receiver may have been dropped; nobody is interested any more
                    let _ = tx.send(result);
                }
            }
            Waiter::Detached => {
                if let Err(e) = &result {
                    log::debug!("Detached {:?} did not complete: {}", self.command, e);
                }
                *slot = Some(result);
            }
        }
        true
    }

    /// The result of a completed task; an error if it has not completed yet
    pub(crate) fn result(&self) -> TaskResult {
        let status = self.status();
        if status.is_pending() {
            return Err(Error::UncompleteTransaction);
        }
        let slot = self.result.lock().map_err(|_| error::internal("Task lock poisoned"))?;
        match slot.as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(_)) | None if status.is_canceled() => Err(Error::Canceled(status)),
            Some(Err(e)) => Err(error::internal(e.to_string())),
            None => Err(Error::UncompleteTransaction),
        }
    }

    /// Block until the task finishes or `timeout` elapses, measured from this call.
    ///
    /// The wait is not passive: every `poll` interval without a result, `pump` is invoked so a
    /// reply that has arrived on the socket but not yet been read gets processed even when no
    /// other thread is driving the receive side.  On timeout the task is canceled, so a late
    /// reply is still consumed in order but completes nothing, and the connection stays open.
    pub(crate) fn wait<F>(&self, timeout: Duration, poll: Duration, mut pump: F) -> TaskResult
    where
        F: FnMut(),
    {
        let cond = match &self.waiter {
            Waiter::Blocking(cond) => cond,
            _ => return Err(error::internal("Only blocking tasks can be waited on")),
        };
        let started = Instant::now();
        let mut slot = self.result.lock().map_err(|_| error::internal("Task lock poisoned"))?;
        loop {
            match slot.take() {
                Some(Ok(value)) => {
                    *slot = Some(Ok(value.clone()));
                    return Ok(value);
                }
                // The waiter gets the error itself; `result` keeps reporting it
                Some(Err(e)) => {
                    *slot = Some(Err(error::internal(e.to_string())));
                    return Err(e);
                }
                None => (),
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                drop(slot);
                if self.cancel() {
                    return Err(error::timeout());
                }
                // Lost the race to a completion that arrived at the deadline
                slot = self.result.lock().map_err(|_| error::internal("Task lock poisoned"))?;
                continue;
            }
            let step = poll.min(timeout - elapsed);
            let (guard, wait) = cond
                .wait_timeout(slot, step)
                .map_err(|_| error::internal("Task lock poisoned"))?;
            slot = guard;
            if wait.timed_out() && slot.is_none() {
                drop(slot);
                pump();
                slot = self.result.lock().map_err(|_| error::internal("Task lock poisoned"))?;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use futures::executor::block_on;

    use crate::{
        error::{ConnectionReason, Error, SocketReason},
        protocol::{Command, RespValue},
    };

    use super::Task;

    #[test]
    fn test_first_transition_wins() {
        let task = Task::blocking(Command::new("PING"));
        assert!(task.complete(RespValue::SimpleString("PONG".into())));
        assert!(!task.cancel());
        assert!(!task.fail(Error::UncompleteTransaction));
        let status = task.status();
        assert!(status.is_completed());
        assert!(!status.is_canceled());
        assert!(!status.is_failed());
    }

    #[test]
    fn test_result_before_completion() {
        let task = Task::detached(Command::new("PING"));
        match task.result() {
            Err(Error::UncompleteTransaction) => (),
            other => panic!("Unexpected: {:?}", other),
        }
        task.complete(RespValue::Integer(1));
        assert_eq!(task.result().unwrap(), RespValue::Integer(1));
    }

    #[test]
    fn test_wait_times_out_and_pumps() {
        let task = Task::blocking(Command::new("BLPOP"));
        let pumped = AtomicUsize::new(0);
        let res = task.wait(Duration::from_millis(60), Duration::from_millis(10), || {
            pumped.fetch_add(1, Ordering::SeqCst);
        });
        match res {
            Err(Error::Socket(SocketReason::Timeout)) => (),
            other => panic!("Unexpected: {:?}", other),
        }
        assert!(pumped.load(Ordering::SeqCst) >= 2);
        assert!(task.status().is_canceled());
        // A late reply is swallowed
        assert!(!task.complete(RespValue::Nil));
    }

    #[test]
    fn test_wait_woken_by_completion() {
        let task = Arc::new(Task::blocking(Command::new("GET")));
        let completer = task.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(RespValue::BulkString(b"v".to_vec()))
        });
        let res = task.wait(Duration::from_secs(5), Duration::from_millis(500), || ());
        assert_eq!(res.unwrap(), RespValue::BulkString(b"v".to_vec()));
        assert!(handle.join().unwrap());
        // Waiting leaves the result in place
        assert_eq!(task.result().unwrap(), RespValue::BulkString(b"v".to_vec()));
    }

    #[test]
    fn test_wait_returns_failure_and_keeps_it() {
        let task = Task::blocking(Command::new("GET"));
        task.fail(Error::Connection(ConnectionReason::NotConnected));
        match task.wait(Duration::from_secs(1), Duration::from_millis(100), || ()) {
            Err(Error::Connection(ConnectionReason::NotConnected)) => (),
            other => panic!("Unexpected: {:?}", other),
        }
        assert!(task.status().is_failed());
        match task.result() {
            Err(Error::Internal(msg)) => {
                assert_eq!(msg, Error::Connection(ConnectionReason::NotConnected).to_string())
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_future_receives_cancellation() {
        let (task, rx) = Task::future(Command::new("GET"));
        assert!(task.take_retry());
        assert!(!task.take_retry());
        assert!(task.cancel());
        match block_on(rx).unwrap() {
            Err(Error::Canceled(status)) => assert!(status.is_canceled()),
            other => panic!("Unexpected: {:?}", other),
        }
    }
}
