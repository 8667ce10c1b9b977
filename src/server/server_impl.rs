use crate::{
    errors::ErrorKind,
    executor::Executor,
    limits::{ConnLimits, PoolLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    pool::threads::capture_panics,
    router::Router,
    server::connection::HttpConnection,
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{JoinHandle, LocalSet},
    time::{sleep, timeout},
};

/// Everything a connection needs, shared by all connection tasks.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) executor: Executor,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
}

/// An HTTP server dispatching requests through a [`Router`].
///
/// The server runs on one thread: connections are served by a fixed set of
/// tasks on a [`LocalSet`], and handlers leave that thread only when their
/// route says so ([`Strategy::Thread`](crate::Strategy::Thread) and the
/// process strategies).
///
/// # Examples
///
/// ```no_run
/// use pixie_web::{Method, Response, Router, Server, Strategy};
///
/// let mut router = Router::new();
/// router.register(Method::Get, "/", Strategy::inline(|_, _| Ok(Response::new("Hello world!"))));
///
/// Server::builder()
///     .bind("127.0.0.1:8080".parse().unwrap())
///     .unwrap()
///     .router(router)
///     .build()
///     .run()
///     .unwrap();
/// ```
pub struct Server {
    listener: std::net::TcpListener,
    router: Router,
    handle: ServerHandle,
    limits: AllLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            router: None,
            handle: None,

            server_limits: None,
            connection_limits: None,
            request_limits: None,
            response_limits: None,
            pool_limits: None,
        }
    }

    /// Returns a handle that stops this server.
    #[inline]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the server on a new single-threaded runtime until it is shut
    /// down through its [`ServerHandle`].
    pub fn run(self) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        LocalSet::new().block_on(&runtime, self.launch())
    }

    /// Serves connections until shut down.
    ///
    /// Must be awaited inside a [`LocalSet`]; [`run`](Self::run) sets one
    /// up.
    pub async fn launch(self) -> io::Result<()> {
        let Server {
            listener,
            router,
            handle,
            limits: (server_limits, conn_limits, req_limits, resp_limits, pool_limits),
        } = self;

        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let addr = listener.local_addr()?;

        if server_limits.debug {
            capture_panics();
        }
        let executor = Executor::start(&pool_limits).await?;
        let shared = Arc::new(Shared {
            router,
            executor,
            server_limits,
            conn_limits,
            req_limits,
            resp_limits,
        });
        let limits = &shared.server_limits;

        let stream_queue: TcpQueue = Arc::new(SegQueue::new());
        let error_queue: TcpQueue = Arc::new(SegQueue::new());
        let active = Arc::new(AtomicUsize::new(0));

        let mut tasks: Vec<_> = (0..limits.max_connections.max(1))
            .map(|_| Self::spawn_worker(&stream_queue, &shared, &active))
            .collect();
        match limits.count_503_handlers {
            0 => tasks.push(Self::spawn_quiet_alarmist(&error_queue, limits)),
            n => tasks.extend((0..n).map(|_| Self::spawn_alarmist(&error_queue, &shared))),
        }

        tracing::info!(
            %addr,
            routes = shared.router.len(),
            connections = limits.max_connections,
            processes = shared.executor.has_process_pool(),
            "server listening"
        );

        let mut shutdown = handle.subscribe();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(value) => match stream_queue.len() < limits.max_pending_connections {
                        true => stream_queue.push(value),
                        false => error_queue.push(value),
                    },
                    Err(err) => tracing::debug!(error = %err, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        drop(listener);

        tracing::info!("shutting down, waiting for open connections");
        let deadline = Instant::now() + limits.shutdown_timeout;
        while (active.load(Ordering::Acquire) > 0 || !stream_queue.is_empty()) && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }

        for task in tasks {
            task.abort();
        }
        shared.executor.shutdown().await;

        tracing::info!(%addr, "server stopped");
        Ok(())
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }
            wait.wait().await;
        }
    }

    fn spawn_worker(queue: &TcpQueue, shared: &Arc<Shared>, active: &Arc<AtomicUsize>) -> JoinHandle<()> {
        let queue = queue.clone();
        let active = active.clone();
        let wait = shared.server_limits.wait_strategy.clone();
        let mut conn = HttpConnection::new(shared.clone());

        tokio::task::spawn_local(async move {
            loop {
                let (mut stream, addr) = Server::get_stream(&queue, &wait).await;
                active.fetch_add(1, Ordering::AcqRel);

                if let Err(err) = conn.run(&mut stream).await {
                    // Client went away; nothing to answer.
                    tracing::trace!(%addr, error = %err, "connection dropped");
                }

                active.fetch_sub(1, Ordering::AcqRel);
            }
        })
    }

    fn spawn_alarmist(queue: &TcpQueue, shared: &Arc<Shared>) -> JoinHandle<()> {
        let queue = queue.clone();
        let wait = shared.server_limits.wait_strategy.clone();
        let write_timeout = shared.conn_limits.socket_write_timeout;

        tokio::task::spawn_local(async move {
            loop {
                let (mut stream, addr) = Server::get_stream(&queue, &wait).await;
                tracing::debug!(%addr, "admission queue full, answering 503");

                let busy = ErrorKind::ServiceUnavailable.as_http();
                let _ = timeout(write_timeout, stream.write_all(busy)).await;
            }
        })
    }

    fn spawn_quiet_alarmist(queue: &TcpQueue, limits: &ServerLimits) -> JoinHandle<()> {
        let queue = queue.clone();
        let wait = limits.wait_strategy.clone();

        tokio::task::spawn_local(async move {
            loop {
                let (stream, _) = Server::get_stream(&queue, &wait).await;
                drop(stream);
            }
        })
    }
}

/// Stops a running [`Server`].
///
/// Clones share the same signal. A shutdown stops accepting, lets open
/// connections finish for up to
/// [`ServerLimits::shutdown_timeout`](crate::limits::ServerLimits::shutdown_timeout)
/// and then stops the worker pools.
///
/// ```
/// use pixie_web::ServerHandle;
///
/// let handle = ServerHandle::new();
/// let for_route = handle.clone();
///
/// for_route.shutdown();
/// assert!(handle.is_shutdown());
/// ```
#[derive(Debug, Clone)]
pub struct ServerHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self { stop: Arc::new(stop) }
    }

    /// Asks the server to stop. Safe to call from a handler.
    #[inline]
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        *self.stop.borrow()
    }

    #[inline]
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

impl Default for ServerHandle {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<std::net::TcpListener>,
    router: Option<Router>,
    handle: Option<ServerHandle>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    pool_limits: Option<PoolLimits>,
}

impl ServerBuilder {
    /// Uses an already bound listener.
    ///
    /// **This, or [`bind`](Self::bind), is required.**
    #[inline(always)]
    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Binds a listener to `addr` with `SO_REUSEADDR` and the backlog from
    /// [`ServerLimits::backlog`]. Call [`server_limits`](Self::server_limits)
    /// first to change the backlog.
    pub fn bind(mut self, addr: SocketAddr) -> io::Result<Self> {
        let backlog = self
            .server_limits
            .as_ref()
            .map_or_else(|| ServerLimits::default().backlog, |limits| limits.backlog);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        self.listener = Some(socket.into());
        Ok(self)
    }

    /// Sets the route table. It cannot change once the server is built.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Uses `handle` as the server's stop signal, so routes registered
    /// before the server exists can stop it.
    #[inline(always)]
    pub fn handle(mut self, handle: ServerHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Configures the thread pool, the process pool and handler timeouts.
    #[inline(always)]
    pub fn pool_limits(mut self, limits: PoolLimits) -> Self {
        self.pool_limits = Some(limits);
        self
    }

    /// Finalizes the builder.
    ///
    /// Pools are started when the server launches, not here.
    ///
    /// # Panics
    ///
    /// Panics when no listener was given (``The `listener` or `bind` method
    /// must be called to create``) or no router was set (``The `router`
    /// method must be called to create``).
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        Server {
            listener: self
                .listener
                .expect("The `listener` or `bind` method must be called to create"),
            router: self
                .router
                .expect("The `router` method must be called to create"),
            handle: self.handle.unwrap_or_default(),
            limits: (
                self.server_limits.unwrap_or_default(),
                self.connection_limits.unwrap_or_default(),
                self.request_limits.unwrap_or_default(),
                self.response_limits.unwrap_or_default(),
                self.pool_limits.unwrap_or_default(),
            ),
        }
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
pub(crate) type AllLimits = (ServerLimits, ConnLimits, ReqLimits, RespLimits, PoolLimits);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "The `router` method must be called to create")]
    fn build_requires_router() {
        let _ = Server::builder().bind("127.0.0.1:0".parse().unwrap()).unwrap().build();
    }

    #[test]
    #[should_panic(expected = "The `listener` or `bind` method must be called to create")]
    fn build_requires_listener() {
        let _ = Server::builder().router(Router::new()).build();
    }

    #[test]
    fn shutdown_before_launch_returns() {
        let handle = ServerHandle::new();
        let server = Server::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .router(Router::new())
            .handle(handle.clone())
            .build();

        assert!(server.local_addr().unwrap().port() != 0);
        handle.shutdown();
        server.run().unwrap();
        assert!(handle.is_shutdown());
    }
}
