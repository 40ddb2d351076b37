//! Periodic liveness events for a running job.
//!
//! The emitter is its own Tokio task. It shares nothing with the job runner
//! except the log file: pages completed since the previous tick are counted by
//! tailing the log for `page_completed` lines, and each tick appends one
//! `heartbeat` event. Because the task never waits on page work, a page stuck
//! on a slow model call still produces heartbeats.

use crate::event_log::{EventLog, EventTail};
use crate::events::Event;
use chrono::Utc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// CPU and resident memory of this process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_mb: u64,
}

/// Samples the current process through `sysinfo`.
///
/// CPU usage is relative to the previous refresh, so one sampler is kept for
/// the lifetime of the emitter.
pub struct ProcessSampler {
    sys: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        let mut sys = System::new();
        if let Some(pid) = pid {
            sys.refresh_process(pid);
        }
        Self { sys, pid }
    }

    pub fn sample(&mut self) -> ResourceSample {
        let Some(pid) = self.pid else {
            return ResourceSample::default();
        };
        if !self.sys.refresh_process(pid) {
            return ResourceSample::default();
        }
        match self.sys.process(pid) {
            Some(proc) => ResourceSample {
                cpu_percent: proc.cpu_usage(),
                memory_mb: proc.memory() / 1024 / 1024,
            },
            None => ResourceSample::default(),
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Running heartbeat task.
///
/// Call [`HeartbeatHandle::stop`] when the job finishes. Dropping the handle
/// without stopping aborts the task.
pub struct HeartbeatHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Signal the task and wait until it has exited; no heartbeat is written
    /// after this returns.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Heartbeat task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start appending heartbeats to `log` every `interval`.
///
/// The first heartbeat is written one full interval after the call.
pub fn spawn_heartbeat(log: EventLog, interval: Duration) -> HeartbeatHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let mut tail = EventTail::from_end(log.path());

    let task = tokio::spawn(async move {
        let mut sampler = ProcessSampler::new();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let pages_since_last = match tail.poll() {
                        Ok(events) => events
                            .iter()
                            .filter(|e| matches!(e, Event::PageCompleted { .. }))
                            .count(),
                        Err(e) => {
                            warn!("Heartbeat could not read {}: {}", log.path().display(), e);
                            0
                        }
                    };
                    let sample = sampler.sample();
                    let event = Event::Heartbeat {
                        job_id: log.job_id().to_string(),
                        cpu_percent: sample.cpu_percent,
                        memory_mb: sample.memory_mb,
                        pages_since_last,
                        emitted_at: Utc::now(),
                    };
                    if let Err(e) = log.append(&event) {
                        warn!("Failed to write heartbeat: {}", e);
                    }
                }
            }
        }
        debug!("Heartbeat for '{}' stopped", log.job_id());
    });

    HeartbeatHandle {
        stop_tx: Some(stop_tx),
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::read_events;

    fn heartbeats(log: &EventLog) -> Vec<Event> {
        read_events(log.path())
            .unwrap()
            .map(|r| r.filter(|e| matches!(e, Event::Heartbeat { .. })).collect())
            .unwrap_or_default()
    }

    #[test]
    fn sampler_reports_this_process() {
        let mut sampler = ProcessSampler::new();
        let sample = sampler.sample();
        assert!(sample.memory_mb > 0, "got {sample:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emits_while_page_work_blocks_and_stops_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::at("job", tmp.path().join("job.jsonl"));
        let hb = spawn_heartbeat(log.clone(), Duration::from_millis(20));

        // A page stuck in a blocking call.
        tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(150)))
            .await
            .unwrap();

        hb.stop().await;
        let written = heartbeats(&log).len();
        assert!(written >= 2, "only {written} heartbeats");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(heartbeats(&log).len(), written, "heartbeat written after stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn counts_pages_completed_between_ticks() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::at("job", tmp.path().join("job.jsonl"));
        let hb = spawn_heartbeat(log.clone(), Duration::from_millis(30));

        for page in 0..3 {
            log.append(&Event::PageCompleted {
                job_id: "job".into(),
                page_index: page,
                duration_ms: 1,
                hallucination_detected: false,
                fallback_used: false,
                verification_error: None,
            })
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        hb.stop().await;

        let total: usize = heartbeats(&log)
            .iter()
            .map(|e| match e {
                Event::Heartbeat { pages_since_last, .. } => *pages_since_last,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 3);
    }
}
