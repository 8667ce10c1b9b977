//! Runs a resolved route with its strategy.

use crate::{
    errors::{DispatchError, HandlerError},
    http::{request::Request, response::Response},
    limits::PoolLimits,
    pool::{
        process::{CancelToken, PoolError, ProcessPool, StreamStart},
        threads::{panic_trace, ThreadPool},
        wire::{Frame, JobMeta, JobMode, Outcome},
        worker::{current_process, ProcessKind},
    },
    router::{Captures, HandlerResult, Resolved, Route, Strategy},
};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, time::timeout};

/// What the connection writes back.
#[derive(Debug)]
pub(crate) enum Reply {
    Response(Response),
    /// A response serialized by a worker process.
    Wire { bytes: Vec<u8>, keep_alive: bool },
    /// Chunks from a streaming worker, written as they arrive.
    Stream {
        chunks: mpsc::Receiver<Vec<u8>>,
        cancel: CancelToken,
    },
}

/// Result of a handler that did not fail.
#[derive(Debug)]
pub(crate) enum Flow {
    Continue(Reply),
    /// The handler stopped early with [`HandlerError::Respond`].
    ShortCircuit(Reply),
}

impl Flow {
    #[inline]
    pub(crate) fn into_reply(self) -> Reply {
        match self {
            Flow::Continue(reply) | Flow::ShortCircuit(reply) => reply,
        }
    }
}

/// Owns the worker pools and applies the handler timeout.
pub(crate) struct Executor {
    threads: ThreadPool,
    processes: Option<Arc<ProcessPool>>,
    handler_timeout: Duration,
    stream_capacity: usize,
}

impl Executor {
    /// Starts the thread pool and, when configured, the process pool.
    ///
    /// A process pool that fails to start leaves the executor without one;
    /// process and stream routes then answer `503`.
    pub(crate) async fn start(limits: &PoolLimits) -> io::Result<Self> {
        let threads = ThreadPool::new(limits.thread_count())?;

        let processes = match limits.processes.count() {
            0 => None,
            _ if current_process() == ProcessKind::Worker => {
                tracing::warn!("running inside a pool worker, not starting a nested process pool");
                None
            }
            count => match ProcessPool::start(limits, count).await {
                Ok(pool) => Some(pool),
                Err(err) => {
                    tracing::warn!(error = %err, "process pool unavailable, process routes will answer 503");
                    None
                }
            },
        };

        Ok(Self {
            threads,
            processes,
            handler_timeout: limits.handler_timeout,
            stream_capacity: limits.stream_capacity,
        })
    }

    /// Dispatches `request` to the route's handler.
    ///
    /// `keep_alive` is what the connection intends to do after this
    /// response; worker processes need it to serialize the response.
    pub(crate) async fn execute(
        &self,
        resolved: Resolved,
        request: Request,
        keep_alive: bool,
    ) -> Result<Flow, DispatchError> {
        let Resolved { route, captures } = resolved;

        match route.strategy() {
            Strategy::Inline(handler) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&request, &captures)));
                settle(result.unwrap_or_else(|payload| Err(HandlerError::Fault(panic_trace(&*payload)))))
            }

            Strategy::Thread(handler) => {
                let handler = handler.clone();
                let done = self.threads.spawn(move || handler(&request, &captures));

                match timeout(self.handler_timeout, done).await {
                    Err(_) => Err(DispatchError::Timeout(self.handler_timeout)),
                    Ok(Err(_)) => Err(DispatchError::Fault("thread pool is shutting down".to_owned())),
                    Ok(Ok(Err(payload))) => Err(DispatchError::Fault(panic_trace(&*payload))),
                    Ok(Ok(Ok(result))) => settle(result),
                }
            }

            Strategy::Local(handler) => {
                let future = panic::catch_unwind(AssertUnwindSafe(|| handler(request, captures)))
                    .map_err(|payload| DispatchError::Fault(panic_trace(&*payload)))?;
                let mut task = tokio::task::spawn_local(future);

                match timeout(self.handler_timeout, &mut task).await {
                    Err(_) => {
                        task.abort();
                        Err(DispatchError::Timeout(self.handler_timeout))
                    }
                    Ok(Err(err)) if err.is_panic() => {
                        Err(DispatchError::Fault(panic_trace(&*err.into_panic())))
                    }
                    Ok(Err(err)) => Err(DispatchError::Fault(err.to_string())),
                    Ok(Ok(result)) => settle(result),
                }
            }

            Strategy::Process(_) => {
                let pool = self.processes.clone().ok_or(DispatchError::PoolUnavailable)?;
                let job = job(&pool, JobMode::Batch, &route, captures, keep_alive);
                let raw = request.into_raw();

                // Detached so the worker goes back to the pool even after a timeout.
                let mut task = tokio::task::spawn_local(async move { pool.run(job, raw).await });

                match timeout(self.handler_timeout, &mut task).await {
                    Err(_) => Err(DispatchError::Timeout(self.handler_timeout)),
                    Ok(Err(err)) => Err(DispatchError::Fault(err.to_string())),
                    Ok(Ok(Err(err))) => Err(pool_failure(err)),
                    Ok(Ok(Ok(frame))) => outcome(frame),
                }
            }

            Strategy::Stream(_) => {
                let pool = self.processes.as_ref().ok_or(DispatchError::PoolUnavailable)?;
                let job = job(pool, JobMode::Stream, &route, captures, keep_alive);
                let cancel = CancelToken::new();

                let started = pool
                    .stream(job, request.into_raw(), self.stream_capacity, cancel.clone())
                    .await
                    .map_err(pool_failure)?;

                match started {
                    StreamStart::Chunks(chunks) => Ok(Flow::Continue(Reply::Stream { chunks, cancel })),
                    StreamStart::Outcome(frame) => outcome(frame),
                }
            }
        }
    }

    /// Stops the process pool. The thread pool stops when the executor is
    /// dropped.
    pub(crate) async fn shutdown(&self) {
        if let Some(pool) = &self.processes {
            pool.shutdown().await;
        }
    }

    #[inline]
    pub(crate) fn has_process_pool(&self) -> bool {
        self.processes.as_ref().is_some_and(|pool| pool.size() > 0)
    }
}

#[inline]
fn job(pool: &ProcessPool, mode: JobMode, route: &Route, captures: Captures, keep_alive: bool) -> JobMeta {
    JobMeta {
        id: pool.next_job_id(),
        mode,
        route: route.key(),
        captures: captures.values().to_vec(),
        keep_alive,
    }
}

#[inline]
fn settle(result: HandlerResult) -> Result<Flow, DispatchError> {
    match result {
        Ok(response) => Ok(Flow::Continue(Reply::Response(response))),
        Err(err) => err
            .into_dispatch()
            .map(|response| Flow::ShortCircuit(Reply::Response(response))),
    }
}

fn outcome(frame: Frame) -> Result<Flow, DispatchError> {
    let outcome = frame
        .meta::<Outcome>()
        .map_err(|err| DispatchError::Fault(err.to_string()))?;

    match outcome {
        Outcome::Reply { keep_alive } => Ok(Flow::Continue(Reply::Wire {
            bytes: frame.data,
            keep_alive,
        })),
        Outcome::Early { keep_alive } => Ok(Flow::ShortCircuit(Reply::Wire {
            bytes: frame.data,
            keep_alive,
        })),
        Outcome::NotFound { message } => Err(DispatchError::NotFound(message)),
        Outcome::Fault { message } => Err(DispatchError::Fault(message)),
        Outcome::Streaming => Err(DispatchError::Fault("worker started a stream for a batch job".to_owned())),
    }
}

#[inline]
fn pool_failure(err: PoolError) -> DispatchError {
    match err {
        PoolError::Unavailable => DispatchError::PoolUnavailable,
        other => DispatchError::Fault(other.to_string()),
    }
}
