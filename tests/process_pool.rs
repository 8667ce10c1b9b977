//! Worker processes are this test binary started again with a filter that
//! runs only `worker_entry`.

use pixie_web::{
    limits::{PoolLimits, WorkerCommand, WorkerProcesses},
    stream_head, worker, Captures, Chunks, HandlerError, HandlerResult, Request, Response, Router,
    Server, StatusCode, Strategy,
};
use std::{
    io::{Read, Write},
    iter,
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

fn square(_: &Request, caps: &Captures) -> HandlerResult {
    let n: u64 = caps.values()[0].parse().map_err(HandlerError::fault)?;
    Ok(Response::text((n * n).to_string()))
}

fn pid(_: &Request, _: &Captures) -> HandlerResult {
    Ok(Response::text(std::process::id().to_string()))
}

fn boom(_: &Request, _: &Captures) -> HandlerResult {
    panic!("worker went wrong")
}

fn teapot(_: &Request, _: &Captures) -> HandlerResult {
    Err(Response::text("short and stout").status(StatusCode::Forbidden).into())
}

fn huge(_: &Request, _: &Captures) -> HandlerResult {
    Ok(Response::new(vec![b'x'; 65 * 1024 * 1024]))
}

fn forever(_: &Request, _: &Captures) -> Result<Chunks, HandlerError> {
    let head = stream_head(StatusCode::Ok, "text/plain");
    let ticks = iter::repeat_with(|| {
        thread::sleep(Duration::from_millis(5));
        b"tick\n".to_vec()
    });
    Ok(Chunks::new(iter::once(head).chain(ticks)))
}

fn letters(_: &Request, _: &Captures) -> Result<Chunks, HandlerError> {
    let head = stream_head(StatusCode::Ok, "text/plain");
    Ok(Chunks::new([head, b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]))
}

fn routes() -> Router {
    let mut router = Router::new();
    router
        .get("/square/<n>", Strategy::process(square))
        .get("/pid", Strategy::process(pid))
        .get("/boom", Strategy::process(boom))
        .get("/teapot", Strategy::process(teapot))
        .get("/huge", Strategy::process(huge))
        .get("/letters", Strategy::stream(letters))
        .get("/forever", Strategy::stream(forever));
    router
}

#[test]
fn worker_entry() {
    if let Some(result) = worker::serve_from_env(&routes()) {
        result.unwrap();
    }
}

fn worker_pool(processes: WorkerProcesses) -> PoolLimits {
    PoolLimits {
        processes,
        worker_command: WorkerCommand {
            program: None,
            args: ["worker_entry", "--exact", "--nocapture", "--test-threads=1"]
                .into_iter()
                .map(Into::into)
                .collect(),
        },
        worker_startup_timeout: Duration::from_secs(30),
        ..PoolLimits::default()
    }
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, body)| body)
}

fn with_server(pool: PoolLimits, test: impl FnOnce(SocketAddr, &dyn Fn(&str) -> String)) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Server::builder().listener(listener).router(routes()).pool_limits(pool).build();
    let handle = server.handle();
    let thread = thread::spawn(move || server.run());

    let get = |path: &str| {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
        write!(stream, "GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").unwrap();

        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    };
    test(addr, &get);

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn batch_jobs_run_in_workers() {
    with_server(worker_pool(WorkerProcesses::Fixed(2)), |_, get| {
        #[rustfmt::skip]
        let cases = [
            ("/square/7",   "HTTP/1.1 200 OK",                    Some("49")),
            ("/square/x",   "HTTP/1.1 500 Internal Server Error", None),
            ("/boom",       "HTTP/1.1 500 Internal Server Error", None),
            ("/teapot",     "HTTP/1.1 403 Forbidden",             Some("short and stout")),
            ("/missing",    "HTTP/1.1 404 Not Found",             None),
        ];

        for (path, status, body) in cases {
            let response = get(path);
            assert!(response.starts_with(status), "{path} -> {response}");
            if let Some(body) = body {
                assert!(response.ends_with(body), "{path} -> {response}");
            }
        }

        let response = get("/pid");
        assert_ne!(body(&response), std::process::id().to_string());

        // A panic in a worker leaves the pool serving.
        assert!(get("/square/3").ends_with("9"));
    });
}

#[test]
fn stream_chunks_then_close() {
    with_server(worker_pool(WorkerProcesses::Fixed(1)), |_, get| {
        let response = get("/letters");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n"));
        assert!(response.ends_with("\r\n\r\nabc"), "{response}");

        // The single worker is free again afterwards.
        assert!(get("/square/4").ends_with("16"));
    });
}

#[test]
fn client_leaving_a_stream_frees_the_worker() {
    let pool = PoolLimits {
        handler_timeout: Duration::from_secs(10),
        ..worker_pool(WorkerProcesses::Fixed(1))
    };

    with_server(pool, |addr, get| {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
        write!(stream, "GET /forever HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();

        let mut head = Vec::new();
        let mut buf = [0; 256];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).unwrap();
            assert_ne!(n, 0, "connection closed before the stream head");
            head.extend_from_slice(&buf[..n]);
        }
        assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
        drop(stream);

        // The only worker is busy until the endless stream is cancelled.
        let started = Instant::now();
        let response = get("/square/4");
        assert!(response.ends_with("16"), "{response}");
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    });
}

#[test]
fn oversized_process_response_keeps_the_worker() {
    with_server(worker_pool(WorkerProcesses::Fixed(1)), |_, get| {
        let before = get("/pid");

        let response = get("/huge");
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error"), "{}", &response[..response.len().min(200)]);

        let after = get("/pid");
        assert_eq!(body(&after), body(&before));
        assert!(get("/square/5").ends_with("25"));
    });
}

#[test]
fn process_routes_without_a_pool() {
    with_server(PoolLimits::default(), |_, get| {
        for path in ["/square/2", "/letters"] {
            let response = get(path);
            assert!(response.starts_with("HTTP/1.1 503 Service Unavailable"), "{path} -> {response}");
        }
    });
}
