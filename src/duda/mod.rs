//! Duda web services
//!
//! Services are modules bound to a virtual host and addressed by the first
//! segment of the request path:
//!
//! ```text
//! /<app_name>/<interface>/<method>[/<param>]*
//! ```
//!
//! - [`registry`] loads each configured module once at startup and binds
//!   its declared methods into a read-only [`ServiceTable`]
//! - [`dispatch`] resolves the service for a request, invokes the bound
//!   method with a fresh [`DudaRequest`] and sends what it buffered
//! - [`event`] keeps the requests whose body is flushed across several
//!   write-ready notifications, one [`EventQueue`] per worker

pub mod api;
pub mod dispatch;
pub mod dylib;
pub mod event;
pub mod registry;
pub mod request;
pub mod router;

pub use api::DudaApi;
pub use dispatch::{service_end, Duda, RequestEnd, Stage};
pub use dylib::DylibLoader;
pub use event::{EventQueue, EventStatus, Unregistered};
pub use registry::{
    Handler, ModuleLoader, ServiceDescriptor, ServiceModule, ServiceTable, StaticLoader,
    StaticModule,
};
pub use request::{DudaRequest, Events, RequestId};
pub use router::{parse_path, RoutedPath};

use crate::http::Status;

/// Result type for Duda operations
pub type Result<T> = std::result::Result<T, Error>;

/// Duda errors
///
/// A path that names no configured service is not an error: the stage
/// reports [`Stage::NotMine`] and other handlers get the request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed service path: {0}")]
    MalformedPath(String),

    #[error("Too many path parameters (max={max})")]
    ParamOverflow { max: usize },

    #[error("Method not found: {app}/{interface}/{method}")]
    MethodNotFound {
        app: String,
        interface: String,
        method: String,
    },

    #[error("Could not load service '{app}': {reason}")]
    ModuleLoad { app: String, reason: String },

    #[error("Service initialization returned {status}")]
    ModuleInit { status: i32 },

    #[error("Callback '{symbol}' for {app}: {interface}/{method} not found")]
    SymbolBind {
        app: String,
        interface: String,
        method: String,
        symbol: String,
    },

    #[error("Handler for {app}/{interface}/{method} panicked")]
    HandlerPanicked {
        app: String,
        interface: String,
        method: String,
    },

    #[error("Response write failed: {0}")]
    Write(#[from] crate::http::Error),
}

impl Error {
    /// Status code to answer the client with
    pub fn status(&self) -> Status {
        match self {
            Error::ParamOverflow { .. } => Status::BAD_REQUEST,
            Error::MalformedPath(_) | Error::MethodNotFound { .. } => Status::NOT_FOUND,
            Error::ModuleLoad { .. }
            | Error::ModuleInit { .. }
            | Error::SymbolBind { .. }
            | Error::HandlerPanicked { .. }
            | Error::Write(_) => Status::INTERNAL_SERVER_ERROR,
        }
    }
}
