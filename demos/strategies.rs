//! Every execution strategy side by side.
//!
//! ```text
//! curl localhost:8080/                 # inline
//! curl localhost:8080/hello/alice      # thread pool
//! curl localhost:8080/wait/300         # local async task
//! curl localhost:8080/sum/100000000    # worker process
//! curl -N localhost:8080/count/5       # worker process, streamed
//! curl localhost:8080/static/hello_world.rs
//! curl localhost:8080/quit
//! ```

use pixie_web::{
    limits::{PoolLimits, ServerLimits, WorkerProcesses},
    static_file, stream_head, worker, Captures, Chunks, HandlerError, HandlerResult,
    Request, Response, Router, Server, ServerHandle, StatusCode, Strategy,
};
use std::{thread, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn number(caps: &Captures) -> Result<u64, HandlerError> {
    caps.get(0).and_then(|n| n.parse().ok()).ok_or_else(|| {
        Response::text("expected a number")
            .status(StatusCode::BadRequest)
            .into()
    })
}

async fn wait(_: Request, caps: Captures) -> HandlerResult {
    let ms = number(&caps)?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(Response::text(format!("waited {ms}ms\n")))
}

fn sum(_: &Request, caps: &Captures) -> HandlerResult {
    let n = number(caps)?;
    let total: u64 = (1..=n).fold(0u64, |acc, x| acc.wrapping_add(x));
    Ok(Response::text(format!("sum(1..={n}) = {total} (pid {})\n", std::process::id())))
}

fn count(_: &Request, caps: &Captures) -> Result<Chunks, HandlerError> {
    let n = number(caps)?;
    let head = stream_head(StatusCode::Ok, "text/plain; charset=utf-8");
    let lines = (1..=n).map(|i| {
        thread::sleep(Duration::from_millis(500));
        format!("{i}\n").into_bytes()
    });
    Ok(Chunks::new(std::iter::once(head).chain(lines)))
}

fn routes(handle: ServerHandle) -> Router {
    let mut router = Router::new();
    router
        .get("/", Strategy::inline(|_, _| Ok(Response::new("Hello from the loop thread!\n"))))
        .get(
            "/hello/<name>",
            Strategy::thread(|_, caps| {
                let name = caps.named("name").unwrap_or("stranger");
                let worker = thread::current().name().unwrap_or("?").to_owned();
                Ok(Response::text(format!("Hello, {name}! ({worker})\n")))
            }),
        )
        .get("/wait/<ms>", Strategy::local(wait))
        .get("/sum/<n>", Strategy::process(sum))
        .get("/count/<n>", Strategy::stream(count))
        .get(
            "/static/<file>",
            Strategy::thread(|req, caps| {
                static_file(
                    caps.get(0).unwrap_or_default(),
                    "demos",
                    req.header("If-Modified-Since"),
                    60,
                )
            }),
        )
        .get(
            "/quit",
            Strategy::inline(move |_, _| {
                handle.shutdown();
                Ok(Response::text("bye\n"))
            }),
        );
    router
}

fn main() -> std::io::Result<()> {
    if let Some(result) = worker::serve_from_env(&routes(ServerHandle::new())) {
        return result;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pixie_web=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let handle = ServerHandle::new();

    Server::builder()
        .bind("127.0.0.1:8080".parse().unwrap())?
        .router(routes(handle.clone()))
        .handle(handle)
        .server_limits(ServerLimits {
            debug: true,
            ..ServerLimits::default()
        })
        .pool_limits(PoolLimits {
            threads: 4,
            processes: WorkerProcesses::Fixed(2),
            ..PoolLimits::default()
        })
        .build()
        .run()
}
