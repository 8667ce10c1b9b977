//! Fixed-size pool of OS threads for thread-offloaded routes.

use crossbeam::channel::{self, Receiver, Sender};
use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    cell::RefCell,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Once,
    thread::{self, JoinHandle},
};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Threads pulling jobs off a shared channel.
///
/// Dropping the pool closes the channel. Workers finish the jobs already
/// queued and are then joined.
pub(crate) struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();

        let workers = (0..size)
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("pixie-worker-{id}"))
                    .spawn(move || work(id, receiver))
            })
            .collect::<io::Result<Vec<_>>>()?;

        tracing::debug!(threads = size, "thread pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queues `job` and returns a receiver for its outcome.
    ///
    /// A panic in the job is caught and delivered as the `Err` payload. The
    /// receiver errors only when the pool is shutting down.
    pub(crate) fn spawn<F, T>(&self, job: F) -> oneshot::Receiver<thread::Result<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        if let Some(sender) = &self.sender {
            let job: Job = Box::new(move || {
                // The trace is recorded on this thread, so it is resolved here.
                let result = panic::catch_unwind(AssertUnwindSafe(job))
                    .map_err(|payload| Box::new(panic_trace(&*payload)) as Box<dyn Any + Send>);
                // The caller may have timed out and dropped the receiver.
                let _ = tx.send(result);
            });
            let _ = sender.send(job);
        }

        rx
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("thread pool worker exited with a panic");
            }
        }

        tracing::debug!("thread pool stopped");
    }
}

fn work(id: usize, receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        job();
    }
    tracing::trace!(worker = id, "thread pool worker exiting");
}

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Installs a process-wide panic hook that records where each panic was
/// raised, plus a backtrace when `RUST_BACKTRACE` enables one. The hook that
/// was installed before still runs afterwards.
pub(crate) fn capture_panics() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let mut trace = match info.location() {
                Some(at) => format!("at {}:{}:{}", at.file(), at.line(), at.column()),
                None => String::new(),
            };
            let backtrace = Backtrace::capture();
            if backtrace.status() == BacktraceStatus::Captured {
                trace.push_str(&format!("\n\n{backtrace}"));
            }

            let _ = LAST_PANIC.try_with(|last| *last.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// [`panic_message`] followed by the location recorded for the latest panic
/// on this thread, if [`capture_panics`] is active.
pub(crate) fn panic_trace(payload: &(dyn Any + Send)) -> String {
    let message = panic_message(payload);
    match LAST_PANIC.with(|last| last.borrow_mut().take()) {
        Some(trace) if !trace.is_empty() => format!("{message}\n{trace}"),
        _ => message,
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[test]
    fn results_and_panics() {
        let pool = ThreadPool::new(2).unwrap();
        assert_eq!(pool.size(), 2);

        let ok = pool.spawn(|| 6 * 7);
        let bad = pool.spawn(|| -> u8 { panic!("boom") });

        assert_eq!(ok.blocking_recv().unwrap().unwrap(), 42);
        let payload = bad.blocking_recv().unwrap().unwrap_err();
        assert!(panic_message(&*payload).starts_with("boom"));
    }

    #[test]
    fn drop_drains_queued_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(1).unwrap();

        for _ in 0..8 {
            let done = done.clone();
            let _ = pool.spawn(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);

        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn jobs_run_in_parallel() {
        let pool = ThreadPool::new(4).unwrap();
        let started = std::time::Instant::now();

        let receivers: Vec<_> = (0..4)
            .map(|_| pool.spawn(|| thread::sleep(Duration::from_millis(200))))
            .collect();
        for rx in receivers {
            rx.blocking_recv().unwrap().unwrap();
        }

        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[test]
    fn panic_messages() {
        let text: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(&*text), "static");
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*other), "handler panicked");
    }

    #[test]
    fn traces_name_the_panic_site() {
        capture_panics();

        #[rustfmt::skip]
        let cases: [(fn(), &str); 2] = [
            (|| panic!("plain"),                "plain\nat "),
            (|| panic!("{} formatted", "also"), "also formatted\nat "),
        ];

        for (raise, prefix) in cases {
            let payload = panic::catch_unwind(raise).unwrap_err();
            let trace = panic_trace(&*payload);
            assert!(trace.starts_with(prefix), "{trace}");
            assert!(trace.contains(file!()), "{trace}");
        }

        // Consumed by the first read.
        let payload: Box<dyn Any + Send> = Box::new("quiet");
        assert_eq!(panic_trace(&*payload), "quiet");

        let pool = ThreadPool::new(1).unwrap();
        let payload = pool.spawn(|| -> u8 { panic!("pooled") }).blocking_recv().unwrap().unwrap_err();
        let trace = panic_message(&*payload);
        assert!(trace.starts_with("pooled\nat "), "{trace}");
        assert!(trace.contains(file!()), "{trace}");
    }
}
