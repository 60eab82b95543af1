//! Passive PostgreSQL wire protocol tracer.
//!
//! Captured client/server TCP payloads go in; query records come out: the
//! statement text, its bound parameters, the command tag or error the server
//! answered with, and the time in between. Nothing is ever sent to the server.

pub mod capture;
pub mod config;
pub mod protocol;
pub mod store;
pub mod tracer;

pub use capture::{CaptureDriver, CaptureError, CaptureStats};
pub use config::{ConfigError, TraceConfig};
pub use store::{RecordStore, StoreError};
pub use tracer::{CompletedQuery, ResponseMode, Tracer};
