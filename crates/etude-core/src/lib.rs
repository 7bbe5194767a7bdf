// src/lib.rs
//! Connection core of a synchronous, epoll-driven HTTP/1.1 static file server.
//!
//! One dispatch thread owns every socket and does all reads and writes.
//! Parsing and response building run on a bounded worker pool, each task
//! holding a backend handle for its duration.
//!
//! Linux only: readiness comes from epoll.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod docroot;
pub mod error;
pub mod http;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod server;
pub mod slab;
pub mod sync;
pub mod syscalls;

// Re-exports for users
pub use backend::{BackendGuard, BackendPool, FixedPool, NoBackend};
pub use config::{ServerConfig, Trigger, TriggerMode};
pub use conn::HttpConnection;
pub use docroot::{ContentTypePolicy, DocRoot};
pub use error::{EtudeError, EtudeResult};
pub use http::{HttpCode, Method, Next, Request};
pub use metrics::{Stats, StatsSnapshot};
pub use pool::{Job, PoolConfig, Processable, RejectReason, Rejected, ThreadPool};
pub use server::{Dispatcher, Server};
