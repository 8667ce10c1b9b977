//! Pool of worker processes for process and stream routes.
//!
//! Workers are copies of a program (by default the running executable)
//! started with [`WORKER_ADDR_ENV`] set. Each connects back over loopback
//! TCP, introduces itself with a `Hello` frame and must answer a `Ping`
//! before it is used. A worker serves one job at a time.

use crate::{
    limits::PoolLimits,
    pool::{
        wire::{
            read_frame, write_frame, CancelMeta, Frame, Hello, JobMeta, Outcome, Tag, WireError,
        },
        worker::{WORKER_ADDR_ENV, WORKER_ID_ENV},
    },
};
use crossbeam::queue::SegQueue;
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    process::{Child, Command},
    sync::{mpsc, oneshot, Mutex, Notify, Semaphore},
    time::timeout,
};

#[derive(Debug, Error)]
pub(crate) enum PoolError {
    #[error("worker process: {0}")]
    Io(#[from] io::Error),

    #[error("worker {0} did not connect back in time")]
    StartupTimeout(usize),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no worker processes are available")]
    Unavailable,
}

/// Cancellation signal shared by a streaming connection and the task
/// feeding it.
///
/// ```
/// use pixie_web::CancelToken;
///
/// let token = CancelToken::new();
/// let seen_by_worker = token.clone();
///
/// token.cancel();
/// assert!(seen_by_worker.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.0.cancelled.swap(true, Ordering::AcqRel) {
            self.0.notify.notify_waiters();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Completes once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// How a stream job started.
pub(crate) enum StreamStart {
    /// The handler produced an iterator; its chunks arrive here.
    Chunks(mpsc::Receiver<Vec<u8>>),
    /// The handler failed or answered early; an `Outcome` frame.
    Outcome(Frame),
}

struct Worker {
    id: usize,
    stream: TcpStream,
    child: Child,
}

struct Launcher {
    listener: TcpListener,
    addr: SocketAddr,
    next_id: usize,
}

pub(crate) struct ProcessPool {
    idle: SegQueue<Worker>,
    available: Semaphore,
    live: AtomicUsize,
    closed: AtomicBool,
    next_job: AtomicU64,

    launcher: Mutex<Launcher>,
    limits: PoolLimits,
}

impl ProcessPool {
    /// Starts `count` workers. Fails as a whole if any worker fails.
    pub(crate) async fn start(limits: &PoolLimits, count: usize) -> Result<Arc<Self>, PoolError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let pool = ProcessPool {
            idle: SegQueue::new(),
            available: Semaphore::new(0),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_job: AtomicU64::new(0),

            launcher: Mutex::new(Launcher {
                listener,
                addr,
                next_id: 0,
            }),
            limits: limits.clone(),
        };

        for _ in 0..count {
            let worker = pool.launcher.lock().await.launch(&pool.limits).await?;
            pool.live.fetch_add(1, Ordering::AcqRel);
            pool.checkin(worker);
        }

        tracing::info!(workers = count, %addr, "process pool started");
        Ok(Arc::new(pool))
    }

    #[inline]
    pub(crate) fn next_job_id(&self) -> u64 {
        self.next_job.fetch_add(1, Ordering::Relaxed)
    }

    /// Live workers, busy or idle.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Runs a batch job and returns its `Outcome` frame.
    pub(crate) async fn run(self: &Arc<Self>, job: JobMeta, request: Vec<u8>) -> Result<Frame, PoolError> {
        let mut worker = self.checkout().await?;

        let exchange = async {
            write_frame(&mut worker.stream, &Frame::with_meta(Tag::Job, &job, request)?).await?;
            read_frame(&mut worker.stream).await?.expect(Tag::Outcome)
        };

        match exchange.await {
            Ok(frame) => {
                self.checkin(worker);
                Ok(frame)
            }
            Err(err) => {
                self.replace(worker, &err);
                Err(err.into())
            }
        }
    }

    /// Starts a stream job.
    ///
    /// On success a driver task forwards every chunk into a channel of
    /// `capacity` slots, so a slow client pauses the worker. When `cancel`
    /// fires the worker is told to stop; the driver then drains the worker's
    /// remaining frames before returning it to the pool.
    pub(crate) async fn stream(
        self: &Arc<Self>,
        job: JobMeta,
        request: Vec<u8>,
        capacity: usize,
        cancel: CancelToken,
    ) -> Result<StreamStart, PoolError> {
        let mut worker = self.checkout().await?;
        let job_id = job.id;

        let exchange = async {
            write_frame(&mut worker.stream, &Frame::with_meta(Tag::Job, &job, request)?).await?;
            read_frame(&mut worker.stream).await?.expect(Tag::Outcome)
        };

        let frame = match exchange.await {
            Ok(frame) => frame,
            Err(err) => {
                self.replace(worker, &err);
                return Err(err.into());
            }
        };

        match frame.meta::<Outcome>() {
            Ok(Outcome::Streaming) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tokio::task::spawn_local(self.clone().drive(worker, job_id, tx, cancel));
                Ok(StreamStart::Chunks(rx))
            }
            Ok(_) => {
                self.checkin(worker);
                Ok(StreamStart::Outcome(frame))
            }
            Err(err) => {
                self.replace(worker, &err);
                Err(err.into())
            }
        }
    }

    async fn drive(
        self: Arc<Self>,
        worker: Worker,
        job_id: u64,
        tx: mpsc::Sender<Vec<u8>>,
        cancel: CancelToken,
    ) {
        let Worker { id, stream, child } = worker;
        let (mut reader, mut writer) = stream.into_split();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let signal = cancel.clone();
        let canceller = tokio::task::spawn_local(async move {
            tokio::select! {
                _ = signal.cancelled() => {
                    let frame = Frame::with_meta(Tag::Cancel, &CancelMeta { job: job_id }, Vec::new());
                    if let Ok(frame) = frame {
                        let _ = write_frame(&mut writer, &frame).await;
                    }
                }
                _ = done_rx => {}
            }
            writer
        });

        let result: Result<(), WireError> = async {
            loop {
                let frame = read_frame(&mut reader).await?;
                match frame.tag {
                    Tag::Chunk if !cancel.is_cancelled() => {
                        if tx.send(frame.data).await.is_err() {
                            // Connection gone.
                            cancel.cancel();
                        }
                    }
                    Tag::Chunk => {}
                    Tag::End => return Ok(()),
                    got => {
                        return Err(WireError::Unexpected {
                            expected: Tag::Chunk,
                            got,
                        })
                    }
                }
            }
        }
        .await;
        drop(tx);

        let _ = done_tx.send(());
        let writer = match canceller.await {
            Ok(writer) => writer,
            Err(_) => {
                tracing::error!(worker = id, "stream cancel task failed");
                self.retire_lost(child);
                return;
            }
        };

        let worker = match reader.reunite(writer) {
            Ok(stream) => Worker { id, stream, child },
            Err(_) => {
                self.retire_lost(child);
                return;
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!(worker = id, job = job_id, cancelled = cancel.is_cancelled(), "stream finished");
                self.checkin(worker);
            }
            Err(err) => self.replace(worker, &err),
        }
    }

    async fn checkout(&self) -> Result<Worker, PoolError> {
        loop {
            if self.live.load(Ordering::Acquire) == 0 {
                return Err(PoolError::Unavailable);
            }

            let permit = self
                .available
                .acquire()
                .await
                .map_err(|_| PoolError::Unavailable)?;
            permit.forget();

            if let Some(worker) = self.idle.pop() {
                return Ok(worker);
            }
        }
    }

    fn checkin(&self, worker: Worker) {
        if self.closed.load(Ordering::Acquire) {
            self.live.fetch_sub(1, Ordering::AcqRel);
            tokio::task::spawn_local(retire(worker, self.limits.worker_exit_grace));
            return;
        }

        self.idle.push(worker);
        self.available.add_permits(1);
    }

    /// Drops a worker whose channel broke and starts a new one in the
    /// background.
    fn replace(self: &Arc<Self>, mut worker: Worker, cause: &WireError) {
        tracing::warn!(worker = worker.id, error = %cause, "worker process failed, replacing it");
        let _ = worker.child.start_kill();
        drop(worker);

        if self.closed.load(Ordering::Acquire) {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let pool = self.clone();
        tokio::task::spawn_local(async move {
            let launched = pool.launcher.lock().await.launch(&pool.limits).await;

            match launched {
                Ok(worker) => pool.checkin(worker),
                Err(err) => {
                    tracing::error!(error = %err, "could not replace worker process");
                    if pool.live.fetch_sub(1, Ordering::AcqRel) == 1 {
                        tracing::error!("no worker processes left, process routes now answer 503");
                        pool.available.close();
                    }
                }
            }
        });
    }

    fn retire_lost(&self, mut child: Child) {
        let _ = child.start_kill();
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Closes every idle worker's socket and reaps the children. Workers busy
    /// with a stream are retired when their stream ends.
    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.close();

        let mut reaped = 0;
        while let Some(worker) = self.idle.pop() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            retire(worker, self.limits.worker_exit_grace).await;
            reaped += 1;
        }

        tracing::info!(reaped, "process pool stopped");
    }
}

/// Closes the worker's socket, gives it `grace` to exit and kills it after.
async fn retire(worker: Worker, grace: Duration) {
    let Worker {
        id,
        stream,
        mut child,
    } = worker;
    drop(stream);

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(worker = id, %status, "worker process exited"),
        Ok(Err(err)) => tracing::warn!(worker = id, error = %err, "could not reap worker process"),
        Err(_) => {
            tracing::warn!(worker = id, "worker process ignored shutdown, killing it");
            let _ = child.kill().await;
        }
    }
}

impl Launcher {
    async fn launch(&mut self, limits: &PoolLimits) -> Result<Worker, PoolError> {
        let id = self.next_id;
        self.next_id += 1;

        let program = match &limits.worker_command.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        let child = Command::new(&program)
            .args(&limits.worker_command.args)
            .env(WORKER_ADDR_ENV, self.addr.to_string())
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        tracing::debug!(worker = id, program = %program.display(), pid = child.id(), "worker process spawned");

        let stream = match timeout(limits.worker_startup_timeout, self.handshake(id)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(PoolError::StartupTimeout(id)),
        };

        Ok(Worker { id, stream, child })
    }

    async fn handshake(&self, id: usize) -> Result<TcpStream, PoolError> {
        loop {
            let (mut stream, _) = self.listener.accept().await?;
            stream.set_nodelay(true)?;

            let hello: Hello = read_frame(&mut stream).await?.expect(Tag::Hello)?.meta()?;
            if hello.worker != id {
                // A late worker from an earlier, abandoned launch.
                tracing::debug!(expected = id, got = hello.worker, "ignoring stray worker connection");
                continue;
            }

            write_frame(&mut stream, &Frame::bare(Tag::Ping)).await?;
            read_frame(&mut stream).await?.expect(Tag::Pong)?;

            tracing::debug!(worker = id, pid = hello.pid, "worker process ready");
            return Ok(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::WorkerCommand;

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());

        token.cancel();
        token.cancel();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // Already cancelled: returns at once.
        timeout(Duration::from_millis(50), token.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn broken_worker_command_fails_startup() {
        let limits = PoolLimits {
            worker_command: WorkerCommand {
                program: Some("/nonexistent/pixie-worker".into()),
                args: Vec::new(),
            },
            ..PoolLimits::default()
        };

        let err = ProcessPool::start(&limits, 1).await.err().unwrap();
        assert!(matches!(err, PoolError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let limits = PoolLimits {
            worker_command: WorkerCommand {
                program: Some("sleep".into()),
                args: vec!["5".into()],
            },
            worker_startup_timeout: Duration::from_millis(200),
            ..PoolLimits::default()
        };

        let err = ProcessPool::start(&limits, 1).await.err().unwrap();
        assert!(matches!(err, PoolError::StartupTimeout(0)), "{err}");
    }
}
