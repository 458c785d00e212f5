/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Strategies for draining a client's queue onto its socket.  Both run the same send pass; they
//! differ only in which thread runs it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;

use crate::{client::async_client::ClientInner, config::SendStrategy};

pub(crate) trait SendExecutor: Send + Sync {
    /// Make sure a send pass runs soon for `client`
    fn schedule(&self, client: &Arc<ClientInner>);

    fn shutdown(&self);
}

pub(crate) fn for_strategy(strategy: SendStrategy) -> Box<dyn SendExecutor> {
    match strategy {
        SendStrategy::Pool => Box::new(PoolExecutor),
        SendStrategy::Dedicated => Box::new(DedicatedExecutor::new()),
    }
}

/// Spawns a send pass on the client's runtime.  At most one pass runs at a time; a schedule
/// request arriving during a pass is picked up by that pass before it finishes.
pub(crate) struct PoolExecutor;

impl SendExecutor for PoolExecutor {
    fn schedule(&self, client: &Arc<ClientInner>) {
        spawn_pass(client);
    }

    fn shutdown(&self) {}
}

fn spawn_pass(client: &Arc<ClientInner>) {
    if !client.begin_send() {
        return;
    }
    let client = client.clone();
    client.handle().clone().spawn(async move {
        loop {
            client.send_pass().await;
            if !client.end_send() {
                break;
            }
        }
    });
}

#[derive(Default)]
struct Wake {
    pending: bool,
    stopped: bool,
}

/// One long-lived thread per client, sleeping on a condition variable between passes
pub(crate) struct DedicatedExecutor {
    wake: Arc<(Mutex<Wake>, Condvar)>,
    started: AtomicBool,
}

impl DedicatedExecutor {
    fn new() -> Self {
        DedicatedExecutor {
            wake: Arc::new((Mutex::new(Wake::default()), Condvar::new())),
            started: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Wake> {
        lock_wake(&self.wake.0)
    }

    fn start(&self, client: Weak<ClientInner>, handle: tokio::runtime::Handle) -> bool {
        let wake = self.wake.clone();
        let spawned = thread::Builder::new()
            .name("redis-sender".into())
            .spawn(move || loop {
                {
                    let (lock, cond) = &*wake;
                    let mut state = lock_wake(lock);
                    while !state.pending && !state.stopped {
                        state = match cond.wait(state) {
                            Ok(state) => state,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }
                    if state.stopped {
                        return;
                    }
                    state.pending = false;
                }
                match client.upgrade() {
                    Some(client) => handle.block_on(client.send_pass()),
                    None => return,
                }
            });
        match spawned {
            Ok(_) => true,
            Err(e) => {
                log::error!("Cannot start sender thread, falling back to the runtime: {}", e);
                false
            }
        }
    }
}

fn lock_wake(lock: &Mutex<Wake>) -> MutexGuard<'_, Wake> {
    match lock.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SendExecutor for DedicatedExecutor {
    fn schedule(&self, client: &Arc<ClientInner>) {
        if !self.started.swap(true, Ordering::AcqRel)
            && !self.start(Arc::downgrade(client), client.handle().clone())
        {
            self.started.store(false, Ordering::Release);
            spawn_pass(client);
            return;
        }
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        state.pending = true;
        self.wake.1.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        state.stopped = true;
        self.wake.1.notify_all();
    }
}

/// The thread only holds a weak reference to its client, so it must be told to stop when the
/// client goes away without being disposed
impl Drop for DedicatedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Weak};
    use std::thread;
    use std::time::Duration;

    use super::DedicatedExecutor;

    fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_thread_exits_when_executor_dropped() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let executor = DedicatedExecutor::new();
        let wake = Arc::downgrade(&executor.wake);
        assert!(executor.start(Weak::new(), rt.handle().clone()));
        // The sender thread keeps its own reference while it runs
        assert!(wait_for(|| wake.strong_count() == 2));

        drop(executor);
        assert!(wait_for(|| wake.strong_count() == 0));
    }
}
