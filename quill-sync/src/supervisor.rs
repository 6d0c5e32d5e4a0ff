//! Process supervisor: keeps N worker processes alive.
//!
//! Each slot runs its own restart loop. A worker that exits for any reason
//! is replaced after `restart_delay`; a slot that burns through
//! `max_restarts` within `restart_window` waits a full window before the
//! next attempt. The supervisor never gives up on a slot.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::SupervisorConfig;
use crate::error::{Result, SyncError};

/// Environment variable carrying a worker's slot index.
pub const SLOT_ENV: &str = "QUILL_WORKER_SLOT";

/// Starts one worker for a slot.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, slot: usize) -> Result<Box<dyn WorkerHandle>>;
}

/// A running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Wait for the worker to exit; returns a description of how it ended.
    async fn wait(&mut self) -> Result<String>;

    async fn kill(&mut self);
}

/// Launches workers as child processes of `program`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-execute the running binary with `args`.
    pub fn current_exe(args: impl IntoIterator<Item = impl Into<OsString>>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

struct ChildHandle(tokio::process::Child);

#[async_trait]
impl WorkerHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> Result<String> {
        Ok(self.0.wait().await?.to_string())
    }

    async fn kill(&mut self) {
        if let Err(e) = self.0.kill().await {
            log::debug!("Kill failed: {e}");
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, slot: usize) -> Result<Box<dyn WorkerHandle>> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env(SLOT_ENV, slot.to_string())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ChildHandle(child)))
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    restarts: Arc<AtomicU64>,
    running: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config,
            launcher,
            restarts: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total replacements across all slots.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Workers currently alive.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Run every slot until `shutdown` resolves, then kill the workers.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) {
        let workers = self.config.workers.max(1);
        log::info!("Supervisor starting {workers} workers");

        let (stop_tx, stop_rx) = watch::channel(false);
        let slots: Vec<_> = (0..workers)
            .map(|slot| {
                let ctx = SlotContext {
                    slot,
                    config: self.config.clone(),
                    launcher: self.launcher.clone(),
                    restarts: self.restarts.clone(),
                    running: self.running.clone(),
                    stop: stop_rx.clone(),
                };
                tokio::spawn(ctx.run())
            })
            .collect();

        shutdown.await;
        log::info!("Supervisor shutting down");
        let _ = stop_tx.send(true);
        for slot in slots {
            let _ = slot.await;
        }
    }
}

struct SlotContext {
    slot: usize,
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    restarts: Arc<AtomicU64>,
    running: Arc<AtomicUsize>,
    stop: watch::Receiver<bool>,
}

impl SlotContext {
    async fn run(mut self) {
        let mut recent: VecDeque<Instant> = VecDeque::new();
        let mut first = true;

        while !*self.stop.borrow() {
            let mut handle = match self.launcher.launch(self.slot).await {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("Worker {} failed to start: {e}", self.slot);
                    if !self.pause(self.config.restart_delay).await {
                        break;
                    }
                    continue;
                }
            };

            if !first {
                self.restarts.fetch_add(1, Ordering::SeqCst);
            }
            first = false;
            self.running.fetch_add(1, Ordering::SeqCst);
            log::info!("Worker {} started (pid {:?})", self.slot, handle.id());

            let exited = tokio::select! {
                status = handle.wait() => Some(status),
                _ = self.stop.changed() => None,
            };
            self.running.fetch_sub(1, Ordering::SeqCst);

            let status = match exited {
                Some(status) => status.unwrap_or_else(|e| e.to_string()),
                None => {
                    handle.kill().await;
                    log::debug!("Worker {} stopped", self.slot);
                    break;
                }
            };
            log::warn!(
                "{}; restarting",
                SyncError::WorkerCrash {
                    slot: self.slot,
                    status,
                }
            );

            let now = Instant::now();
            recent.push_back(now);
            while recent
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.config.restart_window)
            {
                recent.pop_front();
            }
            let delay = if recent.len() > self.config.max_restarts {
                log::error!(
                    "Worker {} restarted {} times in {:?}; backing off",
                    self.slot,
                    recent.len(),
                    self.config.restart_window
                );
                self.config.restart_window
            } else {
                self.config.restart_delay
            };
            if !self.pause(delay).await {
                break;
            }
        }
    }

    /// Sleep unless shutdown comes first. Returns `false` on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.stop.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Workers that exit after `lifetime`, or never when `None`.
    struct FakeLauncher {
        lifetime: Option<Duration>,
        launches: Mutex<Vec<usize>>,
        kills: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        fn new(lifetime: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                lifetime,
                launches: Mutex::new(Vec::new()),
                kills: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn launches_for(&self, slot: usize) -> usize {
            self.launches.lock().unwrap().iter().filter(|s| **s == slot).count()
        }
    }

    struct FakeHandle {
        lifetime: Option<Duration>,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> Result<String> {
            match self.lifetime {
                Some(d) => {
                    tokio::time::sleep(d).await;
                    Ok("exit status: 1".into())
                }
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self, slot: usize) -> Result<Box<dyn WorkerHandle>> {
            self.launches.lock().unwrap().push(slot);
            Ok(Box::new(FakeHandle {
                lifetime: self.lifetime,
                kills: self.kills.clone(),
            }))
        }
    }

    fn config(workers: usize) -> SupervisorConfig {
        SupervisorConfig {
            workers,
            restart_delay: Duration::from_millis(5),
            max_restarts: 100,
            restart_window: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_crashed_workers_are_replaced() {
        let launcher = FakeLauncher::new(Some(Duration::from_millis(10)));
        let supervisor = Supervisor::new(config(2), launcher.clone());

        supervisor
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await;

        assert!(launcher.launches_for(0) > 1);
        assert!(launcher.launches_for(1) > 1);
        assert!(supervisor.restarts() >= 2);
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_kills_live_workers() {
        let launcher = FakeLauncher::new(None);
        let supervisor = Supervisor::new(config(3), launcher.clone());

        supervisor
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(launcher.kills.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.restarts(), 0);
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_crash_loop_slows_restarts() {
        let launcher = FakeLauncher::new(Some(Duration::from_millis(1)));
        let mut config = config(1);
        config.max_restarts = 2;
        config.restart_window = Duration::from_secs(5);
        let supervisor = Supervisor::new(config, launcher.clone());

        supervisor
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await;

        // Three quick exits, then a window-long pause.
        assert_eq!(launcher.launches_for(0), 3);
    }

    #[tokio::test]
    async fn test_zero_workers_runs_one() {
        let launcher = FakeLauncher::new(None);
        let supervisor = Supervisor::new(config(0), launcher.clone());
        supervisor.run(tokio::time::sleep(Duration::from_millis(20))).await;
        assert_eq!(launcher.launches_for(0), 1);
    }
}
