//! pixie_web - small HTTP/1.1 server where every route picks how it runs
//!
//! Requests are parsed and answered on a single-threaded event loop. Each
//! route is registered with a [`Strategy`] deciding where its handler
//! executes:
//!
//! - [`Strategy::Inline`] - right on the loop thread; blocks every other
//!   connection while it runs
//! - [`Strategy::Thread`] - on a pool of OS threads; the loop keeps serving
//! - [`Strategy::Local`] - an `async` handler polled on the loop thread
//! - [`Strategy::Process`] - in a pool of worker processes
//! - [`Strategy::Stream`] - in a worker process, with chunks written to the
//!   client as they are produced
//!
//! Thread, local and process handlers are bounded by a timeout (`503` on
//! expiry). Panics and handler errors never take the server down: they
//! become `500` pages, with the trace shown only in debug mode.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use pixie_web::{Method, Response, Router, Server, Strategy};
//!
//! let mut router = Router::new();
//! router
//!     .register(Method::Get, "/", Strategy::inline(|_, _| Ok(Response::new("Hello World!"))))
//!     .register(Method::Get, "/hello/<name>", Strategy::thread(|_, caps| {
//!         Ok(Response::text(format!("Hello, {}!", caps.named("name").unwrap_or("stranger"))))
//!     }));
//!
//! Server::builder()
//!     .bind("127.0.0.1:8080".parse().unwrap())
//!     .unwrap()
//!     .router(router)
//!     .build()
//!     .run()
//!     .unwrap();
//! ```
//! Worker processes and streaming:
//! ```no_run
//! use pixie_web::{
//!     limits::{PoolLimits, WorkerProcesses},
//!     stream_head, worker, Chunks, Method, Response, Router, Server, StatusCode, Strategy,
//! };
//!
//! fn routes() -> Router {
//!     let mut router = Router::new();
//!     router
//!         .register(Method::Get, "/heavy", Strategy::process(|_, _| {
//!             let sum: u64 = (0..50_000_000u64).sum();
//!             Ok(Response::text(sum.to_string()))
//!         }))
//!         .register(Method::Get, "/count", Strategy::stream(|_, _| {
//!             let head = stream_head(StatusCode::Ok, "text/plain");
//!             Ok(Chunks::new(std::iter::once(head).chain((1..=3).map(|n| format!("{n}\n").into_bytes()))))
//!         }));
//!     router
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     // In a worker process this serves jobs and returns when the server exits.
//!     if let Some(result) = worker::serve_from_env(&routes()) {
//!         return result;
//!     }
//!
//!     Server::builder()
//!         .bind("127.0.0.1:8080".parse().unwrap())?
//!         .router(routes())
//!         .pool_limits(PoolLimits {
//!             processes: WorkerProcesses::Fixed(4),
//!             ..PoolLimits::default()
//!         })
//!         .build()
//!         .run()
//! }
//! ```

pub(crate) mod http {
    pub mod form;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod static_file;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub(crate) mod pool {
    pub(crate) mod process;
    pub(crate) mod threads;
    pub(crate) mod wire;
    pub mod worker;
}
pub(crate) mod errors;
pub(crate) mod executor;
pub mod limits;
pub mod router;

pub use crate::{
    errors::{ErrorKind, HandlerError},
    http::{
        form::{FormData, UploadedFile},
        query::{self, QueryParams},
        request::Request,
        response::{stream_head, Body, Chunks, Response},
        static_file::{format_http_date, parse_http_date, static_file},
        types::{normalize_header_name, Method, StatusCode, Version},
    },
    pool::{process::CancelToken, worker},
    router::{Captures, HandlerResult, Router, Strategy, StrategyKind},
    server::server_impl::{Server, ServerBuilder, ServerHandle},
};
