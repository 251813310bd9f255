//! # strand
//!
//! An event-driven HTTP serving core.
//!
//! strand multiplexes sockets, timers and deferred work on one
//! cooperative [`Scheduler`](executor::Scheduler) per worker thread,
//! speaks HTTP/1.x, HTTP/2 and FastCGI through a shared
//! [`HttpChannel`](channel::HttpChannel) abstraction, and dispatches
//! every request through a pluggable, atomically reloadable handler
//! program.
//!
//! The crate is a core, not a daemon: configuration loading, logging
//! sinks and the CLI belong to the embedding application. Logging is
//! emitted through [`tracing`]; install whatever subscriber fits.
//!
//! ## Example
//!
//! ```no_run
//! use strand::net::ConnectorConfig;
//!
//! fn main() -> strand::Result<()> {
//!     let mut server = strand::Server::builder()
//!         .worker_count(4)
//!         .handler(|channel| {
//!             let body = bytes::Bytes::from_static(b"hello, strand\n");
//!             let _ = channel.respond(http::StatusCode::OK, body);
//!         })
//!         .build()?;
//!     server.listen(
//!         "main",
//!         "127.0.0.1:8080".parse().unwrap(),
//!         ConnectorConfig::default(),
//!         "http/1.1",
//!     )?;
//!     server.run()
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;

pub mod channel;
pub mod executor;
pub mod fileinfo;
pub mod handler;
pub mod headers;
pub mod listener;
pub mod net;
pub mod proto;
pub mod request;
pub mod response;
pub mod server;
pub mod shaper;
pub mod worker;

pub use crate::channel::HttpChannel;
pub use crate::error::{Error, Result, ShaperError};
pub use crate::executor::{Scheduler, SchedulerHandle};
pub use crate::headers::{HeaderField, HeaderFieldList};
pub use crate::request::HttpRequestInfo;
pub use crate::response::HttpResponse;
pub use crate::server::{Server, ServerBuilder, ServerConfig, ServerControl};
pub use crate::shaper::TokenShaper;
pub use crate::worker::{Worker, WorkerHandle};
