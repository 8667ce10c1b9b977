//! Entry point of a worker process.
//!
//! A program that registers process or stream routes calls
//! [`serve_from_env`] first thing in `main`, with a router holding the same
//! routes it gives the server:
//!
//! ```no_run
//! use pixie_web::{worker, Method, Response, Router, Server, Strategy};
//!
//! fn routes() -> Router {
//!     let mut router = Router::new();
//!     router.register(Method::Get, "/report", Strategy::process(|_, _| Ok(Response::new("done"))));
//!     router
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     if let Some(result) = worker::serve_from_env(&routes()) {
//!         return result;
//!     }
//!
//!     Server::builder()
//!         .bind("127.0.0.1:8080".parse().unwrap())?
//!         .router(routes())
//!         .build()
//!         .run()
//! }
//! ```

use crate::{
    errors::HandlerError,
    http::{request::Request, response::Response},
    pool::{
        threads::{capture_panics, panic_trace},
        wire::{
            read_frame_blocking, write_frame_blocking, CancelMeta, End, Frame, Hello, JobMeta,
            JobMode, Outcome, Tag, WireError,
        },
    },
    router::{Router, Strategy},
};
use crossbeam::channel;
use std::{
    env, io,
    net::TcpStream,
    panic::{self, AssertUnwindSafe},
    process,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

/// Environment variable holding the address a worker connects back to.
pub const WORKER_ADDR_ENV: &str = "PIXIE_WORKER_ADDR";

/// Environment variable holding the worker's index in its pool.
pub const WORKER_ID_ENV: &str = "PIXIE_WORKER_ID";

/// Which side of the process pool the current process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Main,
    Worker,
}

/// Tells handlers whether they run in the server process or in a pool
/// worker.
pub fn current_process() -> ProcessKind {
    match env::var_os(WORKER_ADDR_ENV) {
        Some(_) => ProcessKind::Worker,
        None => ProcessKind::Main,
    }
}

/// Serves jobs from the parent server when this process was started as a
/// pool worker.
///
/// Returns `None` in the main process. In a worker it blocks until the
/// parent closes the connection and returns `Some` with the outcome; the
/// caller should then exit.
pub fn serve_from_env(router: &Router) -> Option<io::Result<()>> {
    let addr = env::var(WORKER_ADDR_ENV).ok()?;
    let id = env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|id| id.parse().ok())
        .unwrap_or(0);

    Some(serve(router, &addr, id))
}

struct JobState {
    current: AtomicU64,
    cancelled: AtomicBool,
}

fn serve(router: &Router, addr: &str, id: usize) -> io::Result<()> {
    capture_panics();
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;

    let mut writer = stream.try_clone()?;
    let mut reader = stream;

    let hello = Hello {
        worker: id,
        pid: process::id(),
    };
    write_frame_blocking(&mut writer, &Frame::with_meta(Tag::Hello, &hello, Vec::new())?)?;

    let state = Arc::new(JobState {
        current: AtomicU64::new(u64::MAX),
        cancelled: AtomicBool::new(false),
    });
    let (jobs_tx, jobs_rx) = channel::unbounded::<Frame>();

    let listener = {
        let state = state.clone();
        thread::Builder::new()
            .name("pixie-worker-reader".to_owned())
            .spawn(move || read_loop(&mut reader, &jobs_tx, &state))?
    };

    let mut result = Ok(());
    for frame in jobs_rx {
        let outcome = match frame.tag {
            Tag::Ping => write_frame_blocking(&mut writer, &Frame::bare(Tag::Pong)),
            Tag::Job => run_job(router, &mut writer, frame, &state.cancelled),
            _ => Ok(()),
        };

        if let Err(err) = outcome {
            result = Err(err.into());
            break;
        }
    }

    drop(writer);
    let _ = listener.join();
    result
}

/// Forwards pings and jobs; applies cancellations as they arrive.
fn read_loop(reader: &mut TcpStream, jobs: &channel::Sender<Frame>, state: &JobState) {
    loop {
        let frame = match read_frame_blocking(reader) {
            Ok(frame) => frame,
            // Parent gone or shutting down.
            Err(_) => return,
        };

        match frame.tag {
            Tag::Cancel => {
                if let Ok(CancelMeta { job }) = frame.meta() {
                    if state.current.load(Ordering::Acquire) == job {
                        state.cancelled.store(true, Ordering::Release);
                    }
                }
            }
            Tag::Job => {
                if let Ok(meta) = frame.meta::<JobMeta>() {
                    state.current.store(meta.id, Ordering::Release);
                    state.cancelled.store(false, Ordering::Release);
                }
                if jobs.send(frame).is_err() {
                    return;
                }
            }
            _ => {
                if jobs.send(frame).is_err() {
                    return;
                }
            }
        }
    }
}

fn run_job(
    router: &Router,
    writer: &mut TcpStream,
    frame: Frame,
    cancelled: &AtomicBool,
) -> Result<(), WireError> {
    let meta: JobMeta = frame.meta()?;

    let prepared = router
        .find_key(&meta.route)
        .ok_or_else(|| format!("route `{}` is not registered in the worker", meta.route))
        .and_then(|route| {
            let request = Request::parse(frame.data).map_err(|e| e.to_string())?;
            Ok((route, request))
        });

    let (route, request) = match prepared {
        Ok(prepared) => prepared,
        Err(message) => return send_outcome(writer, &Outcome::Fault { message }, Vec::new()),
    };
    let captures = route.captures(meta.captures);

    match (meta.mode, route.strategy()) {
        (JobMode::Batch, Strategy::Process(handler)) => {
            let result = guarded(|| handler(&request, &captures));
            let (outcome, data) = settle(result, meta.keep_alive, &request);
            send_outcome(writer, &outcome, data)
        }
        (JobMode::Stream, Strategy::Stream(handler)) => {
            let chunks = match guarded(|| handler(&request, &captures)) {
                Ok(chunks) => chunks,
                Err(err) => {
                    let (outcome, data) = settle(Err(err), meta.keep_alive, &request);
                    return send_outcome(writer, &outcome, data);
                }
            };

            send_outcome(writer, &Outcome::Streaming, Vec::new())?;
            let cancelled = stream_chunks(writer, chunks, cancelled)?;
            write_frame_blocking(writer, &Frame::with_meta(Tag::End, &End { cancelled }, Vec::new())?)
        }
        (mode, strategy) => {
            let message = format!("{strategy:?} route cannot run a {mode:?} job");
            send_outcome(writer, &Outcome::Fault { message }, Vec::new())
        }
    }
}

/// Writes chunks until the iterator ends or the job is cancelled. Returns
/// whether it was cancelled.
fn stream_chunks<I>(writer: &mut TcpStream, mut chunks: I, cancelled: &AtomicBool) -> Result<bool, WireError>
where
    I: Iterator<Item = Vec<u8>>,
{
    loop {
        if cancelled.load(Ordering::Acquire) {
            return Ok(true);
        }

        match panic::catch_unwind(AssertUnwindSafe(|| chunks.next())) {
            Ok(Some(chunk)) => match write_frame_blocking(writer, &Frame::data(Tag::Chunk, chunk)) {
                Err(WireError::TooLarge(size)) => {
                    tracing::error!(pid = process::id(), size, "stream chunk too large, ending the stream");
                    return Ok(false);
                }
                other => other?,
            },
            Ok(None) => return Ok(false),
            Err(payload) => {
                tracing::error!(pid = process::id(), panic = %panic_trace(&*payload), "stream handler panicked");
                return Ok(false);
            }
        }
    }
}

#[inline]
fn guarded<T>(f: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(HandlerError::Fault(panic_trace(&*payload))))
}

fn settle(result: Result<Response, HandlerError>, keep_alive: bool, request: &Request) -> (Outcome, Vec<u8>) {
    let wire = |response: Response| {
        let keep_alive = keep_alive && !response.forces_close();
        (keep_alive, response.to_wire(request.version(), keep_alive))
    };

    match result {
        Ok(response) => {
            let (keep_alive, data) = wire(response);
            (Outcome::Reply { keep_alive }, data)
        }
        Err(HandlerError::Respond(response)) => {
            let (keep_alive, data) = wire(response);
            (Outcome::Early { keep_alive }, data)
        }
        Err(HandlerError::NotFound(message)) => (Outcome::NotFound { message }, Vec::new()),
        Err(HandlerError::Fault(message)) => (Outcome::Fault { message }, Vec::new()),
    }
}

/// Sends `outcome`. A response too large for one frame is replaced by a
/// fault; nothing of it reaches the socket.
fn send_outcome(writer: &mut TcpStream, outcome: &Outcome, data: Vec<u8>) -> Result<(), WireError> {
    match write_frame_blocking(writer, &Frame::with_meta(Tag::Outcome, outcome, data)?) {
        Err(WireError::TooLarge(size)) => {
            let message = format!("response of {size} bytes exceeds the worker frame limit");
            tracing::error!(pid = process::id(), size, "response too large for the worker socket");
            write_frame_blocking(writer, &Frame::with_meta(Tag::Outcome, &Outcome::Fault { message }, Vec::new())?)
        }
        other => other,
    }
}
