/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{protocol::Priority, task::Task};

#[derive(Default)]
struct Lanes {
    high: VecDeque<Arc<Task>>,
    normal: VecDeque<Arc<Task>>,
}

impl Lanes {
    fn push(&mut self, task: Arc<Task>) {
        match task.command().get_priority() {
            Priority::High => self.high.push_back(task),
            Priority::Normal => self.normal.push_back(task),
        }
    }

    fn pop(&mut self) -> Option<Arc<Task>> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }
}

/// Commands waiting to be written.  Two FIFOs; the high-priority one is always drained first.
///
/// Every enqueued task leaves exactly once, either through `dequeue*` or `cancel_all`.
#[derive(Default)]
pub(crate) struct CommandQueue {
    lanes: Mutex<Lanes>,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        CommandQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        match self.lanes.lock() {
            Ok(lanes) => lanes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        self.lock().push(task);
    }

    /// Enqueue several tasks so nothing else lands between them
    pub(crate) fn enqueue_all(&self, tasks: impl IntoIterator<Item = Arc<Task>>) {
        let mut lanes = self.lock();
        for task in tasks {
            lanes.push(task);
        }
    }

    /// Put tasks back at the head of their lane, ahead of anything queued since
    pub(crate) fn requeue_front(&self, tasks: Vec<Arc<Task>>) {
        let mut lanes = self.lock();
        for task in tasks.into_iter().rev() {
            match task.command().get_priority() {
                Priority::High => lanes.high.push_front(task),
                Priority::Normal => lanes.normal.push_front(task),
            }
        }
    }

    pub(crate) fn dequeue(&self) -> Option<Arc<Task>> {
        self.lock().pop()
    }

    /// Up to `max` tasks, high priority first.  Tasks already finished (e.g. a caller timed out
    /// before they were written) are dropped here rather than sent.
    pub(crate) fn dequeue_batch(&self, max: usize) -> Vec<Arc<Task>> {
        let mut lanes = self.lock();
        let mut batch = Vec::with_capacity(max.min(lanes.high.len() + lanes.normal.len()));
        while batch.len() < max {
            match lanes.pop() {
                Some(task) if task.status().is_pending() => batch.push(task),
                Some(_) => (),
                None => break,
            }
        }
        batch
    }

    /// Cancel everything still queued.  Returns how many tasks this call canceled.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<Arc<Task>> = {
            let mut lanes = self.lock();
            let mut drained: Vec<_> = lanes.high.drain(..).collect();
            drained.extend(lanes.normal.drain(..));
            drained
        };
        cancel_tasks(&drained)
    }

    pub(crate) fn len(&self) -> usize {
        let lanes = self.lock();
        lanes.high.len() + lanes.normal.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancel each task that has not already finished, returning how many were canceled
pub(crate) fn cancel_tasks(tasks: &[Arc<Task>]) -> usize {
    tasks.iter().filter(|task| task.cancel()).count()
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{
        protocol::{Command, Priority, RespValue},
        task::Task,
    };

    use super::{cancel_tasks, CommandQueue};

    fn task(name: &str, priority: Priority) -> Arc<Task> {
        Arc::new(Task::detached(Command::new(name).priority(priority)))
    }

    fn names(tasks: &[Arc<Task>]) -> Vec<String> {
        tasks
            .iter()
            .map(|t| String::from_utf8_lossy(t.command().name()).into_owned())
            .collect()
    }

    #[test]
    fn test_fifo_with_high_priority_first() {
        let queue = CommandQueue::new();
        for i in 0..5 {
            queue.enqueue(task(&format!("N{}", i), Priority::Normal));
        }
        queue.enqueue(task("H0", Priority::High));

        let first = queue.dequeue().unwrap();
        assert_eq!(first.command().name(), b"H0");
        let rest = queue.dequeue_batch(10);
        assert_eq!(names(&rest), vec!["N0", "N1", "N2", "N3", "N4"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_batch_respects_cap_and_skips_finished() {
        let queue = CommandQueue::new();
        let done = task("DONE", Priority::Normal);
        done.complete(RespValue::Nil);
        queue.enqueue(done);
        queue.enqueue_all((0..4).map(|i| task(&format!("N{}", i), Priority::Normal)));

        assert_eq!(names(&queue.dequeue_batch(2)), vec!["N0", "N1"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let queue = CommandQueue::new();
        queue.enqueue(task("LATER", Priority::Normal));
        queue.requeue_front(vec![task("A", Priority::Normal), task("B", Priority::Normal)]);
        assert_eq!(names(&queue.dequeue_batch(3)), vec!["A", "B", "LATER"]);
    }

    #[test]
    fn test_cancel_exactly_once() {
        let queue = CommandQueue::new();
        let tasks: Vec<_> = (0..6).map(|i| task(&format!("N{}", i), Priority::Normal)).collect();
        queue.enqueue_all(tasks.iter().cloned());

        // Half the batch is in flight when the transport fails; one reply made it back first
        let in_flight = queue.dequeue_batch(3);
        assert!(in_flight[0].complete(RespValue::SimpleString("OK".into())));

        assert_eq!(cancel_tasks(&in_flight) + queue.cancel_all(), 5);
        assert_eq!(cancel_tasks(&tasks), 0);
        assert_eq!(queue.cancel_all(), 0);

        for task in &tasks {
            let status = task.status();
            assert!(status.is_completed() != status.is_canceled());
        }
    }
}
