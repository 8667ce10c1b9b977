use crate::{
    errors::{DispatchError, ErrorKind},
    executor::Reply,
    http::{
        request::{Parser, Request},
        response::{Body, Response},
        types::Version,
    },
    limits::ConnLimits,
    pool::threads::panic_trace,
    server::server_impl::Shared,
};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

/// Serves the requests of one client connection, in order.
pub(crate) struct HttpConnection {
    shared: Arc<Shared>,
    connection: Connection,
    parser: Parser,
}

impl HttpConnection {
    #[inline]
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            connection: Connection::new(),
            parser: Parser::new(),
        }
    }

    /// Runs the connection until the client leaves, keep-alive ends or an
    /// error closes it. Request errors are answered with their canned page.
    pub(crate) async fn run<S>(&mut self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.connection.reset();
        self.parser = Parser::new();

        match self.impl_run(stream).await {
            Ok(()) => Ok(()),
            Err(ErrorKind::Io(e)) => Err(e.0),
            Err(err) => {
                tracing::debug!(error = %err, "rejecting request");
                self.write_bytes(stream, err.as_http()).await
            }
        }
    }

    async fn impl_run<S>(&mut self, stream: &mut S) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let shared = self.shared.clone();

        loop {
            let request = self
                .parser
                .read_request(stream, &shared.req_limits, shared.conn_limits.socket_read_timeout)
                .await?;
            let Some(request) = request else {
                break;
            };

            self.connection.request_count += 1;
            let keep_alive = request.is_keep_alive() && !self.connection.is_expired(&shared.conn_limits);

            if !self.serve(stream, request, keep_alive).await? {
                break;
            }
        }

        Ok(())
    }

    /// Dispatches one request and writes the reply. Returns whether the
    /// connection stays open.
    async fn serve<S>(&mut self, stream: &mut S, request: Request, keep_alive: bool) -> Result<bool, ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let shared = self.shared.clone();
        let method = request.method();
        let version = request.version();
        let path = request.path().to_owned();

        let flow = match shared.router.resolve(method, &path) {
            Some(resolved) => {
                tracing::debug!(%method, path = %path, strategy = ?resolved.route.strategy().kind(), "dispatching");
                shared.executor.execute(resolved, request, keep_alive).await
            }
            None => Err(DispatchError::NotFound(path.clone())),
        };

        let reply = match flow {
            Ok(flow) => flow.into_reply(),
            Err(err) => {
                match &err {
                    DispatchError::NotFound(_) => tracing::debug!(%method, path = %path, "not found"),
                    DispatchError::Timeout(after) => tracing::warn!(%method, path = %path, ?after, "handler timed out"),
                    DispatchError::Fault(trace) => tracing::error!(%method, path = %path, trace = %trace, "handler failed"),
                    DispatchError::PoolUnavailable => tracing::warn!(%method, path = %path, "no worker processes"),
                }
                Reply::Response(err.into_response(&path, shared.server_limits.debug))
            }
        };

        self.write_reply(stream, reply, version, keep_alive).await
    }

    async fn write_reply<S>(
        &mut self,
        stream: &mut S,
        reply: Reply,
        version: Version,
        keep_alive: bool,
    ) -> Result<bool, ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match reply {
            Reply::Response(response) => self.write_response(stream, response, version, keep_alive).await,

            Reply::Wire { bytes, keep_alive: worker_keep_alive } => {
                self.write_bytes(stream, &bytes).await?;
                Ok(keep_alive && worker_keep_alive)
            }

            Reply::Stream { mut chunks, cancel } => {
                while let Some(chunk) = chunks.recv().await {
                    if let Err(err) = self.write_bytes(stream, &chunk).await {
                        tracing::debug!(error = %err, "client left during a stream, cancelling it");
                        cancel.cancel();
                        return Err(err.into());
                    }
                }
                Ok(false)
            }
        }
    }

    async fn write_response<S>(
        &mut self,
        stream: &mut S,
        response: Response,
        version: Version,
        keep_alive: bool,
    ) -> Result<bool, ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keep_alive = keep_alive && !response.forces_close();
        let (head, body) = response.into_parts(version, keep_alive);

        match body {
            Body::Empty => self.write_bytes(stream, &head).await?,
            Body::Bytes(bytes) => {
                let capacity = self.shared.resp_limits.default_capacity.max(head.len() + bytes.len());
                let mut buffer = Vec::with_capacity(capacity);
                buffer.extend_from_slice(&head);
                buffer.extend_from_slice(&bytes);
                self.write_bytes(stream, &buffer).await?;
            }
            Body::Chunks(mut chunks) => {
                self.write_bytes(stream, &head).await?;
                loop {
                    match panic::catch_unwind(AssertUnwindSafe(|| chunks.next())) {
                        Ok(Some(chunk)) => self.write_bytes(stream, &chunk).await?,
                        Ok(None) => break,
                        Err(payload) => {
                            tracing::error!(panic = %panic_trace(&*payload), "chunked body panicked");
                            break;
                        }
                    }
                }
            }
        }

        Ok(keep_alive)
    }

    #[inline]
    async fn write_bytes<S>(&self, stream: &mut S, bytes: &[u8]) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        timeout(self.shared.conn_limits.socket_write_timeout, stream.write_all(bytes)).await?
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }

    /// Whether the request being served must be the last one.
    #[inline(always)]
    fn is_expired(&self, limits: &ConnLimits) -> bool {
        self.request_count >= limits.max_requests_per_connection
            || self.created.elapsed() > limits.connection_lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::Executor,
        http::types::StatusCode,
        limits::{PoolLimits, ReqLimits, RespLimits, ServerLimits},
        router::{Router, Strategy},
    };
    use tokio::io::{duplex, AsyncReadExt};

    async fn shared(conn_limits: ConnLimits, req_limits: ReqLimits) -> Arc<Shared> {
        let mut router = Router::new();
        router
            .get("/", Strategy::inline(|_, _| Ok(Response::new("home"))))
            .post("/echo", Strategy::inline(|req, _| Ok(Response::text(req.body().to_vec()))))
            .get("/bye", Strategy::inline(|_, _| Ok(Response::new("bye").close())))
            .get("/count", Strategy::inline(|_, _| Ok(Response::chunks(["1", "2", "3"]))))
            .get("/early", Strategy::inline(|_, _| {
                Err(Response::new("stop").status(StatusCode::Forbidden).into())
            }))
            .get("/boom", Strategy::inline(|_, _| panic!("kaboom")))
            .get("/process", Strategy::process(|_, _| Ok(Response::new("never"))));

        let executor = Executor::start(&PoolLimits {
            threads: 1,
            ..PoolLimits::default()
        })
        .await
        .unwrap();

        Arc::new(Shared {
            router,
            executor,
            server_limits: ServerLimits::default(),
            conn_limits,
            req_limits,
            resp_limits: RespLimits::default(),
        })
    }

    async fn exchange(shared: Arc<Shared>, input: &[u8]) -> String {
        let (mut client, mut server) = duplex(1 << 16);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let _ = HttpConnection::new(shared).run(&mut server).await;
        drop(server);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn replies() {
        let shared = shared(ConnLimits::default(), ReqLimits::default()).await;

        #[rustfmt::skip]
        let cases: [(&[u8], &str, &str); 7] = [
            (b"GET / HTTP/1.1\r\n\r\n",                        "HTTP/1.1 200 OK\r\n",                    "home"),
            (b"GET /nope HTTP/1.1\r\n\r\n",                    "HTTP/1.1 404 Not Found\r\n",             "Path or file not found: /nope</h1>"),
            (b"GET /early HTTP/1.1\r\n\r\n",                   "HTTP/1.1 403 Forbidden\r\n",             "stop"),
            (b"GET /boom HTTP/1.1\r\n\r\n",                    "HTTP/1.1 500 Internal Server Error\r\n", "<h1>Server error in /boom</h1>"),
            (b"GET /process HTTP/1.1\r\n\r\n",                 "HTTP/1.1 503 Service Unavailable\r\n",   "</h1>"),
            (b"GET /count HTTP/1.1\r\n\r\n",                   "HTTP/1.1 200 OK\r\n",                    "Connection: close\r\n\r\n123"),
            (b"BREW / HTTP/1.1\r\n\r\n",                       "HTTP/1.1 400 Bad Request\r\n",           "</h1>"),
        ];

        for (input, head, tail) in cases {
            let out = exchange(shared.clone(), input).await;
            assert!(out.starts_with(head), "{out}");
            assert!(out.ends_with(tail), "{out}");
        }
    }

    #[tokio::test]
    async fn keep_alive_and_pipelining() {
        let shared = shared(ConnLimits::default(), ReqLimits::default()).await;

        let out = exchange(
            shared.clone(),
            b"GET / HTTP/1.1\r\n\r\nPOST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nping",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.ends_with("\r\n\r\nping"));

        // `close()` ends the connection; the second request is never read.
        let out = exchange(shared.clone(), b"GET /bye HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n").await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
        assert!(out.contains("Connection: close\r\n"));

        // HTTP/1.0 closes unless asked otherwise.
        let out = exchange(shared.clone(), b"GET / HTTP/1.0\r\n\r\nGET / HTTP/1.0\r\n\r\n").await;
        assert_eq!(out.matches("200 OK").count(), 1);

        let out = exchange(
            shared,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\nGET / HTTP/1.0\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("200 OK").count(), 2);
        assert!(out.contains("Connection: keep-alive\r\n"));
    }

    #[tokio::test]
    async fn request_cap_closes_connection() {
        let limits = ConnLimits {
            max_requests_per_connection: 2,
            ..ConnLimits::default()
        };
        let shared = shared(limits, ReqLimits::default()).await;

        let out = exchange(shared, &b"GET / HTTP/1.1\r\n\r\n".repeat(3)).await;
        assert_eq!(out.matches("200 OK").count(), 2);
        assert!(out.ends_with("Connection: close\r\n\r\nhome"));
    }

    #[tokio::test]
    async fn oversized_requests() {
        let limits = ReqLimits {
            max_request_size: 64,
            ..ReqLimits::default()
        };
        let shared = shared(ConnLimits::default(), limits).await;

        #[rustfmt::skip]
        let cases: [&[u8]; 2] = [
            b"POST /echo HTTP/1.1\r\nContent-Length: 1000\r\n\r\nabc",
            b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n",
        ];

        for input in cases {
            let out = exchange(shared.clone(), input).await;
            assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");
            assert!(out.contains("Connection: close\r\n"));
        }
    }

    #[test]
    fn expiry() {
        let limits = ConnLimits {
            max_requests_per_connection: 3,
            connection_lifetime: std::time::Duration::from_secs(60),
            ..ConnLimits::default()
        };
        let mut conn = Connection::new();

        #[rustfmt::skip]
        let cases = [(1, false), (2, false), (3, true), (4, true)];
        for (count, expired) in cases {
            conn.request_count = count;
            assert_eq!(conn.is_expired(&limits), expired, "{count}");
        }

        conn.reset();
        assert!(!conn.is_expired(&limits));
    }
}
