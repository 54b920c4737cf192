//! Long-lived background workers.
//!
//! Every worker is a named thread driving a tick function on its own
//! interval. Shutdown drops the wakeup channel, which interrupts every
//! worker's sleep; the shared running flag then stops the loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{info, warn};

use crate::chunk_manager::BgChunkTask;
use crate::proxy::Proxy;
use crate::tools::RunningFlag;

mod bg_writer;
mod journal_check;
mod repair_scan;
mod repair_worker;
mod task_check;
mod writeback;

/// Progress of the running background tasks, reported to clients on
/// request.
#[derive(Default)]
pub struct BgTaskProgress {
    tasks: Mutex<HashMap<String, (usize, usize)>>,
}

impl BgTaskProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(&self, name: &str, total: usize) {
        self.tasks
            .lock()
            .unwrap()
            .insert(name.to_string(), (0, total.max(1)));
    }

    pub fn advance(&self, name: &str) {
        if let Some((done, _)) = self.tasks.lock().unwrap().get_mut(name) {
            *done += 1;
        }
    }

    pub fn finish(&self, name: &str) {
        self.tasks.lock().unwrap().remove(name);
    }

    /// Task names with their percent progress.
    pub fn snapshot(&self) -> Vec<(String, i32)> {
        let tasks = self.tasks.lock().unwrap();
        let mut out: Vec<(String, i32)> = tasks
            .iter()
            .map(|(name, (done, total))| (name.clone(), (done * 100 / total) as i32))
            .collect();
        out.sort();
        out
    }
}

/// Spawn a worker thread ticking every `interval` until shutdown.
fn spawn_worker<F>(
    name: &'static str,
    interval: Duration,
    running: RunningFlag,
    wakeup: Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            info!("{name} worker started (interval {}s)", interval.as_secs());
            while running.is_running() {
                tick();
                match wakeup.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    // the sender is dropped on shutdown
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("{name} worker stopped");
        })
        .expect("unable to spawn worker thread")
}

/// Run one repair-scanner pass right now (also used by tests and manual
/// maintenance).
pub fn trigger_repair_scan(proxy: Arc<Proxy>, handle: tokio::runtime::Handle) {
    let mut tick = repair_scan::tick_fn(proxy, handle);
    tick();
}

/// Run one repair-worker pass right now.
pub fn trigger_repair(proxy: Arc<Proxy>, handle: tokio::runtime::Handle) {
    let mut tick = repair_worker::tick_fn(proxy, handle);
    tick();
}

/// Run one deferred-commit check pass right now.
pub fn trigger_task_check(proxy: Arc<Proxy>, handle: tokio::runtime::Handle) {
    let mut tick = task_check::tick_fn(proxy, handle);
    tick();
}

/// Run one journal-reconciler pass right now.
pub fn trigger_journal_check(proxy: Arc<Proxy>, handle: tokio::runtime::Handle) {
    let mut tick = journal_check::tick_fn(proxy, handle);
    tick();
}

/// Run one staging-writeback pass right now.
pub fn trigger_writeback(proxy: Arc<Proxy>, handle: tokio::runtime::Handle) {
    let mut tick = writeback::tick_fn(proxy, handle);
    tick();
}

/// Synchronously settle queued background chunk tasks, without the worker
/// thread.
pub fn drain_bg_tasks(
    proxy: &Arc<Proxy>,
    handle: &tokio::runtime::Handle,
    bg_tasks: &Receiver<BgChunkTask>,
    progress: &BgTaskProgress,
) {
    while let Ok(task) = bg_tasks.try_recv() {
        bg_writer::process_task(proxy, handle, progress, task);
    }
}

/// All background workers of a proxy instance.
pub struct Workers {
    running: RunningFlag,
    wakeup_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Start every worker the configuration enables.
    pub fn start(
        proxy: Arc<Proxy>,
        handle: tokio::runtime::Handle,
        bg_tasks: Receiver<BgChunkTask>,
        progress: Arc<BgTaskProgress>,
        running: RunningFlag,
    ) -> Self {
        let config = proxy.config().clone();
        let (wakeup_tx, wakeup_rx) = crossbeam_channel::bounded::<()>(0);
        let mut threads = Vec::new();

        // deferred background chunk commitment
        threads.push(bg_writer::spawn(
            proxy.clone(),
            handle.clone(),
            bg_tasks,
            progress.clone(),
            running.clone(),
        ));

        // proactive agent liveness polling
        {
            let monitor_proxy = proxy.clone();
            let monitor_handle = handle.clone();
            threads.push(spawn_worker(
                "agent-monitor",
                Duration::from_secs(config.misc.liveness_cache_time.max(1)),
                running.clone(),
                wakeup_rx.clone(),
                move || {
                    monitor_handle.block_on(monitor_proxy.coordinator().update_agent_status());
                },
            ));
        }

        if config.recovery.trigger_enabled && config.recovery.scan_interval > 0 {
            threads.push(spawn_worker(
                "repair-scan",
                Duration::from_secs(config.recovery.scan_interval),
                running.clone(),
                wakeup_rx.clone(),
                repair_scan::tick_fn(proxy.clone(), handle.clone()),
            ));
        }

        if config.recovery.trigger_enabled {
            threads.push(spawn_worker(
                "repair",
                Duration::from_secs(config.recovery.trigger_start_interval.max(1)),
                running.clone(),
                wakeup_rx.clone(),
                repair_worker::tick_fn(proxy.clone(), handle.clone()),
            ));
        }

        if config.background_write.background_task_check_interval > 0 {
            threads.push(spawn_worker(
                "task-check",
                Duration::from_secs(config.background_write.background_task_check_interval),
                running.clone(),
                wakeup_rx.clone(),
                task_check::tick_fn(proxy.clone(), handle.clone()),
            ));
        }

        if config.misc.journal_check_interval > 0 {
            threads.push(spawn_worker(
                "journal-check",
                Duration::from_secs(config.misc.journal_check_interval),
                running.clone(),
                wakeup_rx.clone(),
                journal_check::tick_fn(proxy.clone(), handle.clone()),
            ));
        }

        if config.staging.enabled && config.staging.bgwrite_policy != "none" {
            threads.push(spawn_worker(
                "staging-writeback",
                Duration::from_secs(config.staging.bgwrite_scan_interval.max(1)),
                running.clone(),
                wakeup_rx.clone(),
                writeback::tick_fn(proxy.clone(), handle.clone()),
            ));
        }

        if config.staging.enabled && config.staging.autoclean_policy != "none" {
            let autoclean_proxy = proxy.clone();
            let expire = config.staging.autoclean_num_days_expire;
            threads.push(spawn_worker(
                "staging-autoclean",
                Duration::from_secs(config.staging.autoclean_scan_interval.max(1)),
                running.clone(),
                wakeup_rx.clone(),
                move || {
                    if let Some(staging) = autoclean_proxy.staging() {
                        let removed = staging.autoclean(expire);
                        if removed > 0 {
                            info!("staging autoclean removed {removed} expired files");
                        }
                    }
                },
            ));
        }

        Self {
            running,
            wakeup_tx: Some(wakeup_tx),
            threads,
        }
    }

    /// Signal every worker, wake it from its sleep and join it.
    pub fn shutdown(mut self) {
        self.running.shutdown();
        drop(self.wakeup_tx.take());
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            if thread.join().is_err() {
                warn!("{name} worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn progress_snapshot_reports_percent() {
        let progress = BgTaskProgress::new();
        progress.begin("task-a", 4);
        progress.advance("task-a");
        progress.advance("task-a");
        assert_eq!(progress.snapshot(), vec![("task-a".to_string(), 50)]);
        progress.finish("task-a");
        assert!(progress.snapshot().is_empty());
    }

    #[test]
    fn worker_stops_on_shutdown() {
        let running = RunningFlag::new();
        let (wakeup_tx, wakeup_rx) = crossbeam_channel::bounded::<()>(0);
        let (tick_tx, tick_rx) = crossbeam_channel::unbounded();
        let handle = spawn_worker(
            "test",
            Duration::from_secs(3600),
            running.clone(),
            wakeup_rx,
            move || {
                let _ = tick_tx.send(());
            },
        );
        // wait for the first tick, then interrupt the hour-long sleep
        tick_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("worker never ticked");
        running.shutdown();
        drop(wakeup_tx);
        handle.join().unwrap();
    }
}
