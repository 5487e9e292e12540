use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::error::ToolError;
use crate::process::{locate_executable, ExifToolProcess, ProcessState};

const POOL_RESTART_PAUSE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub pool_size: usize,
    /// Explicit tool executable; resolved via PATH and well-known install
    /// locations when absent.
    pub executable: Option<PathBuf>,
    pub checkout_timeout: Duration,
    /// Upper bound on waiting for outstanding checkouts during a restart.
    pub drain_timeout: Duration,
    pub stop_wait: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            executable: None,
            checkout_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(60),
            stop_wait: Duration::from_secs(2),
        }
    }
}

/// Fixed-size set of long-lived tool sessions.
///
/// Idle processes sit in a bounded channel of the pool's capacity; a checkout
/// receives one and the guard returns it on drop, so
/// `available + checked_out == pool_size` holds on every exit path while the
/// pool is neither draining nor shut down.
pub struct ExifToolPool {
    executable: PathBuf,
    slots: Sender<ExifToolProcess>,
    available: Receiver<ExifToolProcess>,
    pool_size: usize,
    checkout_timeout: Duration,
    drain_timeout: Duration,
    shutdown: AtomicBool,
    draining: AtomicBool,
    restarts: AtomicU64,
    maintenance: Mutex<()>,
}

impl ExifToolPool {
    /// Resolves the executable and starts `pool_size` sessions eagerly so a
    /// missing or broken tool surfaces here rather than mid-batch.
    pub fn new(options: PoolOptions) -> Result<Self, ToolError> {
        let executable = locate_executable(options.executable.as_deref())?;
        let pool_size = options.pool_size.max(1);
        let (slots, available) = crossbeam_channel::bounded(pool_size);
        let pool = Self {
            executable,
            slots,
            available,
            pool_size,
            checkout_timeout: options.checkout_timeout,
            drain_timeout: options.drain_timeout,
            shutdown: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
            maintenance: Mutex::new(()),
        };

        for _ in 0..pool_size {
            let mut process =
                ExifToolProcess::new(pool.executable.clone()).with_stop_wait(options.stop_wait);
            process.start()?;
            pool.slots
                .send(process)
                .map_err(|_| ToolError::PoolClosed)?;
        }

        info!(pool_size, executable = %pool.executable.display(), "tool pool ready");
        Ok(pool)
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Completed full-pool restarts.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn available_now(&self) -> usize {
        self.available.len()
    }

    pub fn checked_out_now(&self) -> usize {
        self.pool_size.saturating_sub(self.available.len())
    }

    /// Blocks up to the configured checkout timeout for an idle session.
    pub fn checkout(&self) -> Result<PooledProcess<'_>, ToolError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ToolError::PoolClosed);
        }
        if self.draining.load(Ordering::SeqCst) {
            return Err(ToolError::PoolDraining);
        }
        match self.available.recv_timeout(self.checkout_timeout) {
            Ok(process) => Ok(PooledProcess {
                pool: self,
                process: Some(process),
            }),
            Err(RecvTimeoutError::Timeout) => Err(ToolError::PoolExhausted {
                timeout: self.checkout_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ToolError::PoolClosed),
        }
    }

    /// Replaces every process with a fresh one. Long tool sessions accumulate
    /// handles and memory that only a full process replacement releases.
    ///
    /// New checkouts are refused while draining and the restart waits for
    /// outstanding checkouts to come home; it never kills a session that may
    /// have a command in flight. The wait is bounded by `drain_timeout`.
    pub fn restart_pool(&self) -> Result<(), ToolError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ToolError::PoolClosed);
        }
        let _maintenance = lock_maintenance(&self.maintenance);
        self.draining.store(true, Ordering::SeqCst);
        let result = self.rebuild();
        self.draining.store(false, Ordering::SeqCst);
        if result.is_ok() {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            info!(pool_size = self.pool_size, "tool pool restarted");
        }
        result
    }

    fn rebuild(&self) -> Result<(), ToolError> {
        let mut drained = Vec::with_capacity(self.pool_size);
        let deadline = Instant::now() + self.drain_timeout;
        while drained.len() < self.pool_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("pool restart abandoned; outstanding checkouts did not return in time");
                for process in drained {
                    let _ = self.slots.send(process);
                }
                return Err(ToolError::Timeout {
                    timeout: self.drain_timeout,
                });
            }
            match self.available.recv_timeout(remaining) {
                Ok(process) => drained.push(process),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ToolError::PoolClosed),
            }
        }

        for process in &mut drained {
            process.stop();
        }
        thread::sleep(POOL_RESTART_PAUSE);

        let mut first_error: Option<ToolError> = None;
        for mut process in drained {
            if first_error.is_none() {
                if let Err(error) = process.start() {
                    warn!(%error, "session failed to start during pool restart");
                    first_error = Some(error);
                }
            }
            // Requeue even on failure so capacity is preserved; a stopped
            // session starts lazily on its next command.
            if self.slots.send(process).is_err() {
                break;
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Idempotent: stops every idle process and marks the pool closed.
    /// Outstanding checkouts stop their process on release instead of
    /// requeueing it. Safe to call again from an exit handler.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _maintenance = lock_maintenance(&self.maintenance);
        info!("shutting down tool pool");
        while let Ok(mut process) = self.available.try_recv() {
            process.stop();
        }
    }

    /// Partitions `paths` into chunks and runs `work` once per chunk, each
    /// worker holding one checked-out session for the chunk's duration.
    /// Concurrency is bounded by pool capacity; extra workers queue on
    /// checkout. Output slots line up with `paths` so input order survives
    /// worker scheduling; a slot left `None` means no session reached it.
    pub fn dispatch_chunks<T, F>(
        &self,
        paths: &[PathBuf],
        chunk_size: usize,
        work: F,
    ) -> Vec<Option<T>>
    where
        T: Send,
        F: Fn(&mut ExifToolProcess, &[PathBuf], &mut [Option<T>]) + Sync,
    {
        let chunk_size = chunk_size.max(1);
        let mut results: Vec<Option<T>> = Vec::with_capacity(paths.len());
        results.resize_with(paths.len(), || None);
        let work = &work;
        thread::scope(|scope| {
            for (chunk, out) in paths.chunks(chunk_size).zip(results.chunks_mut(chunk_size)) {
                scope.spawn(move || match self.checkout() {
                    Ok(mut process) => work(&mut process, chunk, out),
                    Err(error) => {
                        warn!(%error, files = chunk.len(), "chunk skipped; no session available");
                    }
                });
            }
        });
        results
    }

    fn release(&self, mut process: ExifToolProcess) {
        if self.shutdown.load(Ordering::SeqCst) {
            process.stop();
            return;
        }
        if process.state() == ProcessState::Dead {
            if let Err(error) = process.restart() {
                warn!(%error, "session restart on release failed; it will retry on next use");
            }
        }
        if self.slots.send(process).is_err() {
            // Shutdown raced the release; the dropped process stops itself.
        }
    }
}

impl Drop for ExifToolPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Checked-out session. Dropping it returns the process to the pool on every
/// exit path, restarting it first if the command left it Dead.
pub struct PooledProcess<'a> {
    pool: &'a ExifToolPool,
    process: Option<ExifToolProcess>,
}

impl fmt::Debug for PooledProcess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledProcess").finish_non_exhaustive()
    }
}

impl Deref for PooledProcess<'_> {
    type Target = ExifToolProcess;

    fn deref(&self) -> &Self::Target {
        self.process.as_ref().expect("process held until drop")
    }
}

impl DerefMut for PooledProcess<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.process.as_mut().expect("process held until drop")
    }
}

impl Drop for PooledProcess<'_> {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            self.pool.release(process);
        }
    }
}

fn lock_maintenance(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    // The guard protects no data, so a poisoned lock is still usable.
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
