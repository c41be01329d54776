//! Thread-safe metrics collection
//!
//! Atomic counters for task, agent, event and control-loop activity plus a
//! bounded window of task turnaround times. One collector is created at the
//! composition root and shared as `Arc<MetricsCollector>`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_TURNAROUND_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and a mutex-protected window
pub struct MetricsCollector {
    tasks_submitted: AtomicU64,
    tasks_rejected: AtomicU64,
    tasks_assigned: AtomicU64,
    handoff_failures: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    stale_reports: AtomicU64,

    agents_started: AtomicU64,
    agents_stopped: AtomicU64,
    agent_errors: AtomicU64,
    heartbeats_received: AtomicU64,

    events_published: AtomicU64,
    events_dropped: AtomicU64,

    scheduling_passes: AtomicU64,
    health_sweeps: AtomicU64,
    last_tick_ms: AtomicU64,

    turnaround_times: Mutex<Vec<u64>>,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_rejected: AtomicU64::new(0),
            tasks_assigned: AtomicU64::new(0),
            handoff_failures: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            stale_reports: AtomicU64::new(0),
            agents_started: AtomicU64::new(0),
            agents_stopped: AtomicU64::new(0),
            agent_errors: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            scheduling_passes: AtomicU64::new(0),
            health_sweeps: AtomicU64::new(0),
            last_tick_ms: AtomicU64::new(0),
            turnaround_times: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp_ms()),
        }
    }

    // Task lifecycle
    pub fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_rejected(&self) {
        self.tasks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_assigned(&self) {
        self.tasks_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handoff_failed(&self) {
        self.handoff_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// `turnaround` is the time from assignment to the completion report
    pub fn task_completed(&self, turnaround: Option<Duration>) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if let Some(turnaround) = turnaround {
            self.record_turnaround(turnaround);
        }
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_report(&self) {
        self.stale_reports.fetch_add(1, Ordering::Relaxed);
    }

    fn record_turnaround(&self, turnaround: Duration) {
        if let Ok(mut times) = self.turnaround_times.lock() {
            times.push(turnaround.as_millis() as u64);
            if times.len() > MAX_TURNAROUND_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Agents
    pub fn agent_started(&self) {
        self.agents_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn agent_stopped(&self) {
        self.agents_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn agent_error(&self) {
        self.agent_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    // Event bus
    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Control loop
    pub fn scheduling_pass(&self) {
        self.scheduling_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health_sweep(&self) {
        self.health_sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn loop_ticked(&self) {
        self.last_tick_ms
            .store(current_timestamp_ms(), Ordering::Relaxed);
    }

    /// Time since the control loop last completed a tick, None if it never has
    pub fn last_tick_age(&self) -> Option<Duration> {
        match self.last_tick_ms.load(Ordering::Relaxed) {
            0 => None,
            last => Some(Duration::from_millis(
                current_timestamp_ms().saturating_sub(last),
            )),
        }
    }

    /// Turnaround statistics (avg, p50, p95, p99) in milliseconds
    fn calculate_turnaround_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.turnaround_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp_ms();
        let (avg, p50, p95, p99) = self.calculate_turnaround_statistics();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            tasks: TaskMetrics {
                submitted: load(&self.tasks_submitted),
                rejected: load(&self.tasks_rejected),
                assigned: load(&self.tasks_assigned),
                handoff_failures: load(&self.handoff_failures),
                completed: load(&self.tasks_completed),
                failed: load(&self.tasks_failed),
                retried: load(&self.tasks_retried),
                stale_reports: load(&self.stale_reports),
                avg_turnaround_ms: avg,
                turnaround_p50_ms: p50,
                turnaround_p95_ms: p95,
                turnaround_p99_ms: p99,
            },
            agents: AgentMetrics {
                started: load(&self.agents_started),
                stopped: load(&self.agents_stopped),
                errors: load(&self.agent_errors),
                heartbeats_received: load(&self.heartbeats_received),
            },
            events: EventMetrics {
                published: load(&self.events_published),
                dropped: load(&self.events_dropped),
            },
            control_loop: ControlLoopMetrics {
                scheduling_passes: load(&self.scheduling_passes),
                health_sweeps: load(&self.health_sweeps),
                last_tick_age_ms: self.last_tick_age().map(|age| age.as_millis() as u64),
            },
            uptime_seconds: now.saturating_sub(load(&self.uptime_start)) / 1000,
            timestamp: now / 1000,
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.tasks_submitted,
            &self.tasks_rejected,
            &self.tasks_assigned,
            &self.handoff_failures,
            &self.tasks_completed,
            &self.tasks_failed,
            &self.tasks_retried,
            &self.stale_reports,
            &self.agents_started,
            &self.agents_stopped,
            &self.agent_errors,
            &self.heartbeats_received,
            &self.events_published,
            &self.events_dropped,
            &self.scheduling_passes,
            &self.health_sweeps,
            &self.last_tick_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut times) = self.turnaround_times.lock() {
            times.clear();
        }
        self.uptime_start
            .store(current_timestamp_ms(), Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub tasks: TaskMetrics,
    pub agents: AgentMetrics,
    pub events: EventMetrics,
    pub control_loop: ControlLoopMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskMetrics {
    pub submitted: u64,
    pub rejected: u64,
    pub assigned: u64,
    pub handoff_failures: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stale_reports: u64,
    pub avg_turnaround_ms: f64,
    pub turnaround_p50_ms: f64,
    pub turnaround_p95_ms: f64,
    pub turnaround_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct AgentMetrics {
    pub started: u64,
    pub stopped: u64,
    pub errors: u64,
    pub heartbeats_received: u64,
}

#[derive(Debug, Serialize)]
pub struct EventMetrics {
    pub published: u64,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct ControlLoopMetrics {
    pub scheduling_passes: u64,
    pub health_sweeps: u64,
    pub last_tick_age_ms: Option<u64>,
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
