use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crawlserver_types::{RenderJob, RenderResult, Situation, State};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::error::PoolError;
use crate::state_reporter::StateReporter;

/// Below this age a worker's exit is treated as a disaster rather than a
/// routine stale-wasm restart or intentional kill.
const DISASTER_THRESHOLD: Duration = Duration::from_millis(5_000);
/// Back-off applied before respawning after a disaster exit.
const DISASTER_BACKOFF: Duration = Duration::from_secs(10);

/// A worker's pipes, each individually lockable. Keeping these out from
/// under the pool-wide structural lock means a render in flight on worker A
/// never blocks dispatch to worker B, nor the crash-monitor's scan.
struct WorkerIo {
    stdin: AsyncMutex<ChildStdin>,
    reply_rx: AsyncMutex<mpsc::UnboundedReceiver<Result<RenderResult, PoolError>>>,
}

struct Worker {
    child: Child,
    io: Arc<WorkerIo>,
    spawned_at: Instant,
    /// set right before a deliberate kill, so the exit-monitor does not
    /// misclassify it as a disaster.
    intentional: Arc<AtomicBool>,
}

/// Supervises a fixed-size set of isolated worker processes, each running
/// the `crawlserver-worker` binary and speaking newline-delimited JSON over
/// its stdin/stdout.
///
/// The `workers` lock guards only structural changes (spawn, replace,
/// crash-scan) and is held only long enough to clone out an `Arc<WorkerIo>`
/// or swap a slot — never across the network-free but potentially
/// multi-hundred-millisecond wait for a worker's render reply. That wait is
/// instead synchronized per-worker, via `WorkerIo`'s own mutexes, so
/// concurrent renders on distinct workers make true parallel progress.
pub struct WorkerPool {
    worker_binary: PathBuf,
    workers: AsyncMutex<Vec<Option<Worker>>>,
    idle_tx: mpsc::UnboundedSender<usize>,
    idle_rx: AsyncMutex<mpsc::UnboundedReceiver<usize>>,
    /// Tracked alongside the idle channel (rather than derived from it) so
    /// `/health` can report occupancy without consuming from the channel
    /// itself.
    idle_count: Arc<AtomicUsize>,
    reporter: StateReporter,
}

impl WorkerPool {
    pub async fn spawn(
        worker_binary: PathBuf,
        count: usize,
        reporter: StateReporter,
    ) -> Result<Self, PoolError> {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let worker = spawn_one(id, &worker_binary).await?;
            workers.push(Some(worker));
            idle_tx.send(id).expect("idle_rx held by self");
        }
        Ok(Self {
            worker_binary,
            workers: AsyncMutex::new(workers),
            idle_tx,
            idle_rx: AsyncMutex::new(idle_rx),
            idle_count: Arc::new(AtomicUsize::new(count)),
            reporter,
        })
    }

    /// Suspends until an idle worker id is available. Locking `idle_rx`
    /// only for the duration of one `recv` (rather than for the whole
    /// pool) still gives FIFO ordering across concurrent waiters, since
    /// tokio's mutex queues fairly, without entangling this wait with any
    /// other pool operation.
    pub async fn acquire(&self) -> usize {
        let id = self.idle_rx.lock().await.recv().await.expect("idle_tx held by self");
        self.idle_count.fetch_sub(1, Ordering::SeqCst);
        id
    }

    pub fn release(&self, id: usize) {
        if self.idle_tx.send(id).is_ok() {
            self.idle_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Snapshot of how many workers are currently idle, for `/health`.
    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::SeqCst)
    }

    /// Sends one render job to `id` and awaits its reply. Never returns
    /// `Ok(RenderResult::Restart { .. })` without first replacing the dead
    /// worker in place: the caller should dispatch its retry to the same
    /// `id`, which now refers to the freshly spawned replacement.
    pub async fn dispatch(&self, id: usize, job: &RenderJob) -> Result<RenderResult, PoolError> {
        let io = {
            let guard = self.workers.lock().await;
            guard[id].as_ref().ok_or(PoolError::WorkerGone)?.io.clone()
        };

        let line = {
            let mut s = serde_json::to_string(job)?;
            s.push('\n');
            s
        };

        {
            let mut stdin = io.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await.map_err(PoolError::Write)?;
            stdin.flush().await.map_err(PoolError::Write)?;
        }

        let reply = {
            let mut reply_rx = io.reply_rx.lock().await;
            reply_rx.recv().await.ok_or(PoolError::WorkerGone)??
        };

        if reply.is_restart() {
            self.replace_stale(id).await?;
        }

        Ok(reply)
    }

    /// Called after a `restart` reply (worker exits intentionally because
    /// its loaded Wasm mtime went stale). Spawns a replacement immediately,
    /// with no back-off — this is a planned exit, not a crash.
    async fn replace_stale(&self, id: usize) -> Result<(), PoolError> {
        {
            let guard = self.workers.lock().await;
            if let Some(worker) = guard[id].as_ref() {
                worker.intentional.store(true, Ordering::SeqCst);
            }
        }
        self.reporter.emit(
            State::Operating,
            Situation::StoppedChildProcess,
            format!("worker {id} stopped: stale wasm"),
        );
        let fresh = spawn_one(id, &self.worker_binary).await?;
        self.workers.lock().await[id] = Some(fresh);
        Ok(())
    }

    /// Kills and replaces `id`'s worker outright, without handing the
    /// replacement to any in-flight retry — used when the parent-side
    /// render timeout expires on a dispatch (spec.md §5: "mark it for kill").
    /// The caller must not release its `Lease` normally afterward (see
    /// `Lease::abandon`): the worker that was mid-render when the timeout
    /// fired may still write a late reply into the now-dead channel, and
    /// since `id`'s slot is replaced wholesale here — new child, new
    /// `WorkerIo`, new `reply_rx` — that stale reply has nowhere left to be
    /// read from. The replacement, unlike `replace_stale`'s, goes straight
    /// back to the idle pool since nothing is waiting to reuse it directly.
    pub async fn kill_and_replace(&self, id: usize) -> Result<(), PoolError> {
        {
            let mut guard = self.workers.lock().await;
            if let Some(worker) = guard[id].as_mut() {
                worker.intentional.store(true, Ordering::SeqCst);
                let _ = worker.child.start_kill();
            }
        }
        self.reporter.emit(
            State::Operating,
            Situation::StoppedChildProcess,
            format!("worker {id} killed: render timeout"),
        );
        let fresh = spawn_one(id, &self.worker_binary).await?;
        self.workers.lock().await[id] = Some(fresh);
        self.release(id);
        Ok(())
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Scans for a worker whose child has exited without ever having been
    /// replaced in place by [`Self::replace_stale`]. Takes the structural
    /// lock only for the scan itself, never across a sleep.
    async fn poll_exited(&self) -> Option<(usize, Instant, bool)> {
        let guard = self.workers.lock().await;
        for (id, slot) in guard.iter().enumerate() {
            if let Some(worker) = slot {
                // try_wait is non-blocking; safe to call under the lock.
                if let Ok(Some(_status)) = worker.child.try_wait() {
                    return Some((id, worker.spawned_at, worker.intentional.load(Ordering::SeqCst)));
                }
            }
        }
        None
    }

    /// Respawns `id` in place. The caller is responsible for having already
    /// emitted `DisasterlyCrashed` (and applied the back-off) before calling
    /// this when `disaster` is set; this only emits the recovery event.
    async fn respawn_in_place(&self, id: usize, disaster: bool) {
        match spawn_one(id, &self.worker_binary).await {
            Ok(fresh) => {
                self.workers.lock().await[id] = Some(fresh);
                if disaster {
                    self.reporter.emit(
                        State::Operating,
                        Situation::RespawnedAfterDisaster,
                        format!("worker {id} respawned after disaster"),
                    );
                }
            }
            Err(err) => {
                tracing::error!(%err, id, "failed to respawn worker");
            }
        }
    }
}

async fn spawn_one(id: usize, worker_binary: &std::path::Path) -> Result<Worker, PoolError> {
    let mut child = Command::new(worker_binary)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(PoolError::Spawn)?;

    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");

    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_replies(stdout, reply_tx));

    Ok(Worker {
        child,
        io: Arc::new(WorkerIo {
            stdin: AsyncMutex::new(stdin),
            reply_rx: AsyncMutex::new(reply_rx),
        }),
        spawned_at: Instant::now(),
        intentional: Arc::new(AtomicBool::new(false)),
    })
}

async fn read_replies(
    stdout: tokio::process::ChildStdout,
    reply_tx: mpsc::UnboundedSender<Result<RenderResult, PoolError>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let parsed = serde_json::from_str::<RenderResult>(&line).map_err(PoolError::from);
                if reply_tx.send(parsed).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = reply_tx.send(Err(PoolError::WorkerGone));
                break;
            }
            Err(_) => {
                let _ = reply_tx.send(Err(PoolError::WorkerGone));
                break;
            }
        }
    }
}

/// Background crash-monitor loop: polls every worker's child for unexpected
/// exit and respawns it in place, applying the disaster back-off when the
/// process died within [`DISASTER_THRESHOLD`] of being spawned. Runs
/// alongside normal dispatch traffic without contending for it, since
/// `poll_exited` only ever holds the pool's structural lock for a
/// non-blocking scan.
pub async fn supervise(pool: Arc<WorkerPool>, mut kill: tokio::sync::broadcast::Receiver<()>) {
    loop {
        let Some((id, spawned_at, intentional)) = pool.poll_exited().await else {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                _ = kill.recv() => return,
            }
        };

        if intentional {
            // already replaced inline by `replace_stale`; nothing to do.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                _ = kill.recv() => return,
            }
        }

        let disaster = spawned_at.elapsed() < DISASTER_THRESHOLD;
        if disaster {
            pool.reporter.emit(
                State::Failing,
                Situation::DisasterlyCrashed,
                format!("worker {id} exited within the disaster window"),
            );
            tokio::select! {
                _ = tokio::time::sleep(DISASTER_BACKOFF) => {}
                _ = kill.recv() => return,
            }
        }

        pool.respawn_in_place(id, disaster).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a pool with zero real worker processes so these tests can
    /// exercise `acquire`/`release` ordering without spawning anything.
    fn empty_pool() -> WorkerPool {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        WorkerPool {
            worker_binary: PathBuf::from("/bin/true"),
            workers: AsyncMutex::new(Vec::new()),
            idle_tx,
            idle_rx: AsyncMutex::new(idle_rx),
            idle_count: Arc::new(AtomicUsize::new(0)),
            reporter: StateReporter::new(),
        }
    }

    #[tokio::test]
    async fn acquire_returns_released_ids_fifo() {
        let pool = empty_pool();
        pool.release(0);
        pool.release(1);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.acquire().await, 0);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.acquire().await, 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_do_not_deadlock_on_release() {
        // Regression test for a prior design where `acquire` held the
        // whole pool's mutex across the suspend point waiting for an idle
        // id, which made a concurrent `release` (which itself needed that
        // same mutex) unable to ever complete — a guaranteed deadlock
        // under contention (the queue-saturation scenario the dispatch
        // queue exists to handle). Here two `acquire` calls race a
        // `release` and the whole thing must resolve promptly.
        let pool = Arc::new(empty_pool());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;
        pool.release(7);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire must not deadlock waiting on a concurrent release")
            .unwrap();
        assert_eq!(got, 7);
    }

    #[test]
    fn disaster_window_constant_matches_spec() {
        assert_eq!(DISASTER_THRESHOLD, Duration::from_millis(5_000));
        assert_eq!(DISASTER_BACKOFF, Duration::from_secs(10));
    }
}
