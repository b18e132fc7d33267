#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # hearth
//!
//! hearth is a small, correct HTTP/1.1 server runtime for cooperative
//! single-threaded schedulers, with a routing framework on top.
//!
//! The runtime accepts connections on one or more non-blocking listeners,
//! parses requests, and hands each one to an application callback through a
//! three-value gateway interface — a [`Scope`] plus non-blocking
//! [`ReceiveHandle`] / [`SendHandle`] pairs that signal `Pending` instead of
//! blocking and expose `subscribe` to bridge into any awaiting primitive.
//! Keep-alive, chunked transfer encoding, back-pressure and idle eviction
//! are handled per connection.
//!
//! The engine is runtime-agnostic behind the [`rt::Executor`] contract. Two
//! bindings ship in [`rt`]: a mio-driven [`EventLoop`](rt::EventLoop) with
//! native readiness callbacks, and a [`TokioExecutor`](rt::TokioExecutor)
//! for tokio current-thread runtimes.
//!
//! The framework layer in [`web`] matches request paths against templates
//! like `/hello/{name:string}`, converts captured arguments to declared
//! types, and runs endpoints grouped in blueprints with per-endpoint
//! pre-invoke hooks and error-handler chains, with cookies and signed
//! sessions carried through the request.
//!
//! ```no_run
//! use hearth::rt::EventLoop;
//! use hearth::web::{endpoint, App, Blueprint, Response};
//! use hearth::Server;
//!
//! fn main() -> hearth::Result<()> {
//!     let app = App::with_secret("correct horse battery staple");
//!     app.add_blueprint(Blueprint::new("hello").endpoint(endpoint(
//!         "/hello/{name:string}",
//!         |_req, args| async move {
//!             Ok(Response::text(format!("hello, {}!", args[0])))
//!         },
//!     )));
//!
//!     let el = EventLoop::new().map_err(hearth::Error::new_handler)?;
//!     let server = Server::builder(el.clone())
//!         .listen_on(["127.0.0.1:8080"])
//!         .serve(app.sgi());
//!     server.start()?;
//!     el.block_on(server.run_forever());
//!     Ok(())
//! }
//! ```

pub mod error;
mod proto;
pub mod rt;
pub mod server;
pub mod sgi;
pub mod web;

pub use crate::error::{Error, Result};
pub use crate::server::Server;
pub use crate::sgi::{ReceiveHandle, Scope, SendHandle, SgiPoll};
