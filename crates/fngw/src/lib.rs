//! Core of the fngw serving plane.
//!
//! The gateway binary accepts HTTP requests, resolves them against the
//! [`table::RouteTable`] (kept fresh by [`sync::Syncer`]), picks a worker via
//! [`scheduler::Scheduler`], and hands the accepted connection over with
//! [`handoff`]. The worker binary receives the handoff, runs the function in
//! a piped child process, and answers the client directly. Uploads flow
//! through [`upload::UploadPipeline`] into [`compiler::CompileDriver`], which
//! records registry rows the syncer later picks up.

pub mod compiler;
pub mod config;
pub mod descriptor;
pub mod handoff;
pub mod http;
pub mod registry;
pub mod scheduler;
pub mod sync;
pub mod table;
pub mod telemetry;
pub mod upload;

pub use config::Config;
pub use descriptor::{FunctionDescriptor, Runtime, route_key};
pub use table::RouteTable;
