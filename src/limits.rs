//! Server configuration limits and timeouts
//!
//! Every knob of the server lives in one of these plain structs. Each one has
//! a documented [`Default`] and is handed to the [`ServerBuilder`](crate::ServerBuilder)
//! with the usual `..Default::default()` spread.
//!
//! # Examples
//!
//! ```no_run
//! use pixie_web::{Router, Server, limits::{ConnLimits, PoolLimits, ReqLimits, WorkerProcesses}};
//! use std::time::Duration;
//!
//! let server = Server::builder()
//!     .bind("127.0.0.1:8080".parse().unwrap())
//!     .unwrap()
//!     .router(Router::new())
//!     .connection_limits(ConnLimits {
//!         socket_read_timeout: Duration::from_secs(5),
//!         ..ConnLimits::default()
//!     })
//!     .request_limits(ReqLimits {
//!         max_request_size: 16 * 1024 * 1024,
//!         ..ReqLimits::default()
//!     })
//!     .pool_limits(PoolLimits {
//!         processes: WorkerProcesses::Auto,
//!         ..PoolLimits::default()
//!     })
//!     .build();
//! ```

use std::{ffi::OsString, path::PathBuf, thread, time::Duration};

/// Controls connection admission and error reporting.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Room in queue? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \/
/// [-------------------]
/// [ Connection task   ]  (one of `max_connections`, polls with `wait_strategy`)
/// [-------------------]
/// ```
///
/// Connection tasks are created once at launch on the local task set and
/// serve one connection at a time, so `max_connections` bounds how many
/// sockets are being read from concurrently.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of connections served concurrently (default: `100`).
    pub max_connections: usize,

    /// Maximum number of accepted connections waiting for a connection task
    /// (default: `250`). Beyond that new connections get an immediate `503`.
    pub max_pending_connections: usize,

    /// How idle connection tasks wait for the admission queue
    /// (default: `Sleep(200μs)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated tasks answering `503` on queue overflow (default: `1`).
    ///
    /// Set to 0 to silently close overflowing connections instead.
    pub count_503_handlers: usize,

    /// Include the failure trace in `500` pages (default: `false`).
    pub debug: bool,

    /// Listen backlog used by [`ServerBuilder::bind`](crate::ServerBuilder::bind)
    /// (default: `1024`).
    pub backlog: i32,

    /// Time a shutdown waits for open connections to finish before dropping
    /// them (default: `5s`).
    pub shutdown_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(200)),
            count_503_handlers: 1,
            debug: false,
            backlog: 1024,
            shutdown_timeout: Duration::from_secs(5),

            _priv: (),
        }
    }
}

/// Strategy for connection-task waiting when the admission queue is empty
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]. Burns a core.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

impl WaitStrategy {
    #[inline]
    pub(crate) async fn wait(&self) {
        match self {
            WaitStrategy::Yield => tokio::task::yield_now().await,
            WaitStrategy::Sleep(time) => tokio::time::sleep(*time).await,
        }
    }
}

/// Per-connection timeouts and reuse limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Idle time allowed while waiting for request bytes (default: `30s`).
    ///
    /// Expiry closes the connection quietly.
    pub socket_read_timeout: Duration,

    /// Time allowed for a single socket write (default: `10s`).
    ///
    /// Streaming responses apply it to every chunk, not to the whole stream.
    pub socket_write_timeout: Duration,

    /// Requests served on one keep-alive connection before it is closed
    /// (default: `1000`).
    pub max_requests_per_connection: usize,

    /// Age after which a keep-alive connection is closed once its current
    /// request is answered (default: `600s`).
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(10),
            max_requests_per_connection: 1000,
            connection_lifetime: Duration::from_secs(600),

            _priv: (),
        }
    }
}

/// Request framing limits.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Hard ceiling on the bytes of one request, head plus body
    /// (default: `4 MiB`).
    ///
    /// A request that would exceed it is answered with `413` and the
    /// connection is closed without reading the rest.
    pub max_request_size: usize,

    /// Maximum number of header lines (default: `100`).
    pub header_count: usize,

    /// Size of a single socket read (default: `8 KiB`).
    pub read_chunk_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_request_size: 4 * 1024 * 1024,
            header_count: 100,
            read_chunk_size: 8 * 1024,

            _priv: (),
        }
    }
}

/// Response defaults.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of the serialization buffer (default: `1024`).
    pub default_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,

            _priv: (),
        }
    }
}

/// Worker pool sizing and handler timeouts.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Worker threads for thread-offloaded routes (default: `0`, meaning
    /// one per available core).
    pub threads: usize,

    /// Worker processes for process routes (default: [`WorkerProcesses::Disabled`]).
    pub processes: WorkerProcesses,

    /// How a worker process is launched (default: the current executable
    /// with no extra arguments).
    pub worker_command: WorkerCommand,

    /// Wait limit for thread, local and process-batch handlers
    /// (default: `15s`). Expiry answers `503`.
    pub handler_timeout: Duration,

    /// Chunks buffered between a streaming worker and its connection
    /// (default: `16`). A full buffer pauses the worker.
    pub stream_capacity: usize,

    /// Time a new worker process gets to connect back and answer the ping
    /// (default: `10s`).
    pub worker_startup_timeout: Duration,

    /// Time shutdown waits for worker processes to exit before killing them
    /// (default: `2s`).
    pub worker_exit_grace: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            threads: 0,
            processes: WorkerProcesses::Disabled,
            worker_command: WorkerCommand::default(),
            handler_timeout: Duration::from_secs(15),
            stream_capacity: 16,
            worker_startup_timeout: Duration::from_secs(10),
            worker_exit_grace: Duration::from_secs(2),

            _priv: (),
        }
    }
}

impl PoolLimits {
    #[inline]
    pub(crate) fn thread_count(&self) -> usize {
        match self.threads {
            0 => hardware_concurrency(),
            n => n,
        }
    }
}

/// Size of the worker process pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProcesses {
    /// No process pool; process and stream routes answer `503`.
    Disabled,
    /// One worker per available core.
    Auto,
    /// Exactly this many workers.
    Fixed(usize),
}

impl WorkerProcesses {
    #[inline]
    pub(crate) fn count(&self) -> usize {
        match self {
            WorkerProcesses::Disabled => 0,
            WorkerProcesses::Auto => hardware_concurrency(),
            WorkerProcesses::Fixed(n) => *n,
        }
    }
}

/// Program and arguments used to start a worker process.
///
/// The child must call [`worker::serve_from_env`](crate::worker::serve_from_env)
/// with a router registering the same process routes as the parent.
#[derive(Debug, Clone, Default)]
pub struct WorkerCommand {
    /// Executable to run; `None` re-runs the current executable.
    pub program: Option<PathBuf>,
    /// Arguments passed to the worker.
    pub args: Vec<OsString>,
}

#[inline]
fn hardware_concurrency() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let req = ReqLimits::default();
        assert_eq!(req.max_request_size, 4 * 1024 * 1024);

        let pool = PoolLimits::default();
        assert_eq!(pool.handler_timeout, Duration::from_secs(15));
        assert_eq!(pool.processes, WorkerProcesses::Disabled);
        assert!(pool.thread_count() >= 1);
    }

    #[test]
    fn worker_counts() {
        #[rustfmt::skip]
        let cases = [
            (WorkerProcesses::Disabled, Some(0)),
            (WorkerProcesses::Fixed(3), Some(3)),
            (WorkerProcesses::Auto,     None),
        ];

        for (mode, expected) in cases {
            match expected {
                Some(n) => assert_eq!(mode.count(), n),
                None => assert!(mode.count() >= 1),
            }
        }
    }
}
