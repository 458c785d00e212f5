/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Out-of-band health probing.
//!
//! A `HeartbeatService` is created once and shared by everything that wants probing.  Probes are
//! held weakly, so dropping a node is enough to stop probing it.  Each sweep pulses every probe
//! whose interval has elapsed, unless its previous pulse is still running.
//!
//! `due_pulses` takes the current instant as a parameter so sweeps can be driven by hand, with
//! synthetic instants, rather than by the timer `start` spawns.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub type PulseFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

pub trait HeartbeatProbe: Send + Sync {
    /// Check health once; `true` means healthy
    fn pulse(&self) -> PulseFuture<'_>;

    /// Called after every pulse with its outcome and the number of failures in a row, including
    /// this one (zero after a success)
    fn pulse_result(&self, healthy: bool, consecutive_failures: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

struct Registration {
    id: ProbeId,
    probe: Weak<dyn HeartbeatProbe>,
    interval: Duration,
    next_due: Instant,
    running: Arc<AtomicBool>,
    failures: Arc<AtomicU32>,
}

struct ServiceInner {
    probes: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    pulse_timeout: Duration,
    stop: CancellationToken,
}

/// The shared probe scheduler.  Cloning shares the same registrations.
#[derive(Clone)]
pub struct HeartbeatService {
    inner: Arc<ServiceInner>,
}

impl HeartbeatService {
    /// A pulse not finished within `pulse_timeout` counts as a failure
    pub fn new(pulse_timeout: Duration) -> Self {
        HeartbeatService {
            inner: Arc::new(ServiceInner {
                probes: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                pulse_timeout,
                stop: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        match self.inner.probes.lock() {
            Ok(probes) => probes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Sweep every `tick` on `handle` until `stop` is called
    pub fn start(&self, handle: &Handle, tick: Duration) {
        let service = self.clone();
        let stop = self.inner.stop.clone();
        handle.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => (),
                    _ = stop.cancelled() => break,
                }
                for pulse in service.due_pulses(Instant::now()) {
                    tokio::spawn(pulse.run());
                }
            }
            log::debug!("Heartbeat sweeps stopped");
        });
    }

    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Probe `probe` every `interval`, the first time one interval from now
    pub fn register(&self, probe: Weak<dyn HeartbeatProbe>, interval: Duration) -> ProbeId {
        self.register_at(probe, interval, Instant::now())
    }

    pub fn register_at(
        &self,
        probe: Weak<dyn HeartbeatProbe>,
        interval: Duration,
        now: Instant,
    ) -> ProbeId {
        let id = ProbeId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Registration {
            id,
            probe,
            interval,
            next_due: now + interval,
            running: Arc::new(AtomicBool::new(false)),
            failures: Arc::new(AtomicU32::new(0)),
        });
        id
    }

    pub fn unregister(&self, id: ProbeId) -> bool {
        let mut probes = self.lock();
        let before = probes.len();
        probes.retain(|reg| reg.id != id);
        probes.len() != before
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        let mut probes = self.lock();
        probes.retain(|reg| reg.probe.strong_count() > 0);
        probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect the pulses due at `now`, marking each as running.  Registrations whose probe has
    /// been dropped are discarded.
    pub fn due_pulses(&self, now: Instant) -> Vec<PendingPulse> {
        let mut probes = self.lock();
        probes.retain(|reg| reg.probe.strong_count() > 0);
        let mut due = Vec::new();
        for reg in probes.iter_mut() {
            if reg.next_due > now {
                continue;
            }
            let probe = match reg.probe.upgrade() {
                Some(probe) => probe,
                None => continue,
            };
            if reg.running.swap(true, Ordering::AcqRel) {
                log::debug!("Previous pulse of probe {:?} still running, skipped", reg.id);
                continue;
            }
            reg.next_due = now + reg.interval;
            due.push(PendingPulse {
                probe,
                running: RunningGuard(reg.running.clone()),
                failures: reg.failures.clone(),
                timeout: self.inner.pulse_timeout,
            });
        }
        due
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One pulse, ready to run.  Dropping it without running releases the probe for the next sweep.
pub struct PendingPulse {
    probe: Arc<dyn HeartbeatProbe>,
    running: RunningGuard,
    failures: Arc<AtomicU32>,
    timeout: Duration,
}

impl PendingPulse {
    /// Pulse the probe and report the outcome to it
    pub async fn run(self) -> bool {
        let healthy = tokio::time::timeout(self.timeout, self.probe.pulse())
            .await
            .unwrap_or(false);
        let failures = if healthy {
            self.failures.store(0, Ordering::Release);
            0
        } else {
            self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1)
        };
        self.probe.pulse_result(healthy, failures);
        drop(self.running);
        healthy
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, Weak};
    use std::time::{Duration, Instant};

    use super::{HeartbeatProbe, HeartbeatService, PulseFuture};

    #[derive(Default)]
    struct FakeProbe {
        healthy: AtomicBool,
        slow: AtomicBool,
        pulses: AtomicUsize,
        results: Mutex<Vec<(bool, u32)>>,
    }

    impl HeartbeatProbe for FakeProbe {
        fn pulse(&self) -> PulseFuture<'_> {
            self.pulses.fetch_add(1, Ordering::SeqCst);
            let healthy = self.healthy.load(Ordering::SeqCst);
            let slow = self.slow.load(Ordering::SeqCst);
            Box::pin(async move {
                if slow {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                healthy
            })
        }

        fn pulse_result(&self, healthy: bool, consecutive_failures: u32) {
            self.results
                .lock()
                .unwrap()
                .push((healthy, consecutive_failures));
        }
    }

    fn weak(probe: &Arc<FakeProbe>) -> Weak<dyn HeartbeatProbe> {
        let probe: Arc<dyn HeartbeatProbe> = probe.clone();
        Arc::downgrade(&probe)
    }

    #[tokio::test]
    async fn test_pulses_once_per_interval() {
        let service = HeartbeatService::new(Duration::from_secs(1));
        let probe = Arc::new(FakeProbe::default());
        let start = Instant::now();
        service.register_at(weak(&probe), Duration::from_secs(2), start);

        assert!(service.due_pulses(start).is_empty());
        assert!(service.due_pulses(start + Duration::from_secs(1)).is_empty());

        let due = service.due_pulses(start + Duration::from_secs(2));
        assert_eq!(due.len(), 1);
        for pulse in due {
            assert!(!pulse.run().await);
        }
        assert!(service.due_pulses(start + Duration::from_secs(3)).is_empty());
        for pulse in service.due_pulses(start + Duration::from_secs(4)) {
            pulse.run().await;
        }
        probe.healthy.store(true, Ordering::SeqCst);
        for pulse in service.due_pulses(start + Duration::from_secs(6)) {
            pulse.run().await;
        }

        assert_eq!(
            *probe.results.lock().unwrap(),
            vec![(false, 1), (false, 2), (true, 0)]
        );
    }

    #[tokio::test]
    async fn test_no_reentrant_pulse() {
        let service = HeartbeatService::new(Duration::from_secs(120));
        let probe = Arc::new(FakeProbe::default());
        probe.slow.store(true, Ordering::SeqCst);
        let start = Instant::now();
        service.register_at(weak(&probe), Duration::from_secs(1), start);

        let mut first = service.due_pulses(start + Duration::from_secs(1));
        assert_eq!(first.len(), 1);
        let running = tokio::spawn(first.remove(0).run());
        while probe.pulses.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Still running at the next due time
        assert!(service.due_pulses(start + Duration::from_secs(2)).is_empty());
        running.abort();
        let _ = running.await;
        assert_eq!(service.due_pulses(start + Duration::from_secs(3)).len(), 1);
        assert_eq!(probe.pulses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_pulse_is_failure() {
        let service = HeartbeatService::new(Duration::from_millis(100));
        let probe = Arc::new(FakeProbe::default());
        probe.healthy.store(true, Ordering::SeqCst);
        probe.slow.store(true, Ordering::SeqCst);
        let start = Instant::now();
        service.register_at(weak(&probe), Duration::from_secs(1), start);

        for pulse in service.due_pulses(start + Duration::from_secs(1)) {
            assert!(!pulse.run().await);
        }
        assert_eq!(*probe.results.lock().unwrap(), vec![(false, 1)]);
    }

    #[test]
    fn test_dropped_probes_are_forgotten() {
        let service = HeartbeatService::new(Duration::from_secs(1));
        let kept = Arc::new(FakeProbe::default());
        let dropped = Arc::new(FakeProbe::default());
        let id = service.register(weak(&kept), Duration::from_secs(1));
        service.register(weak(&dropped), Duration::from_secs(1));
        assert_eq!(service.len(), 2);

        drop(dropped);
        assert_eq!(service.len(), 1);
        assert!(service.unregister(id));
        assert!(service.is_empty());
    }
}
