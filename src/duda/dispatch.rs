//! Request dispatch to web services
//!
//! A request moves through `parsed -> routed -> invoked` inside
//! [`Duda::stage`]. From there it either completes right away or, when the
//! service asked for body-flush continuation, is parked in the worker's
//! [`EventQueue`] and completes later from
//! [`EventQueue::on_write_ready`].

use super::api;
use super::event::EventQueue;
use super::registry::{ModuleLoader, ServiceDescriptor, ServiceTable};
use super::request::{DudaRequest, Events, RequestId};
use super::router::{parse_path, service_segment};
use super::{Error, Result};
use crate::config::{HostId, ServerConfig};
use crate::http::{
    Error as HttpError, HttpSession, Method, ParsedRequest, PollEvents, SessionOps,
};
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Notified by the Duda layer when a request on a socket has finished
pub trait RequestEnd {
    fn request_end(&mut self, socket: RawFd);
}

impl RequestEnd for Vec<RawFd> {
    fn request_end(&mut self, socket: RawFd) {
        self.push(socket);
    }
}

/// Outcome of the Duda stage for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// No enabled service claims the path; other handlers may take it
    NotMine,
    /// The response went out and the request completed
    Completed,
    /// The body is flushed from the event queue on write-ready
    AwaitingWrite(RequestId),
}

/// Run a request to completion
///
/// The service's end callback runs first, then the connection layer is
/// told the request finished. The context is released afterwards.
pub fn service_end(mut dr: DudaRequest, hooks: &mut dyn RequestEnd) {
    if let Some(end) = dr.take_end_callback() {
        end(&mut dr);
    }
    hooks.request_end(dr.socket());
    trace!(request = %dr.id(), writes = dr.body_writes(), "Request completed");
}

// Completion for requests torn down by a failure: the end callback still
// runs, the connection layer is about to close anyway.
fn abandon(mut dr: DudaRequest) {
    if let Some(end) = dr.take_end_callback() {
        end(&mut dr);
    }
}

/// The Duda stage of the request pipeline
#[derive(Debug)]
pub struct Duda {
    services: ServiceTable,
    max_params: usize,
}

impl Duda {
    pub fn new(services: ServiceTable, max_params: usize) -> Self {
        Duda {
            services,
            max_params,
        }
    }

    /// Load every configured service through `loader`
    pub fn load(config: &ServerConfig, loader: &dyn ModuleLoader) -> Self {
        let services = ServiceTable::load(config, loader, api::master());
        Self::new(services, config.max_params)
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    pub fn max_params(&self) -> usize {
        self.max_params
    }

    /// The enabled service of `host` claiming `uri`, if any
    pub fn resolve(&self, host: HostId, uri: &str) -> Option<&ServiceDescriptor> {
        let app_name = service_segment(uri)?;
        let service = self.services.vhost(host)?.find(app_name)?;
        service.is_enabled().then_some(service)
    }

    /// Route `request` to its service method and send the response
    ///
    /// The handler runs synchronously on the calling worker. When it
    /// registered [`Events::BODY_FLUSH`] and left body pending, only the
    /// response head is written here and the request moves into `events`.
    pub fn stage<S: SessionOps>(
        &self,
        host: Option<HostId>,
        request: &Arc<ParsedRequest>,
        session: &mut HttpSession<S>,
        events: &mut EventQueue,
        hooks: &mut dyn RequestEnd,
    ) -> Result<Stage> {
        let Some(uri) = request.uri_processed() else {
            return Ok(Stage::NotMine);
        };
        if uri.len() <= 1 {
            return Ok(Stage::NotMine);
        }
        let Some(service) = host.and_then(|host| self.resolve(host, uri)) else {
            trace!(uri = %uri, "No web service for path");
            return Ok(Stage::NotMine);
        };

        let path = parse_path(uri, self.max_params)?;

        let Some(method) = service.find_method(path.interface(), path.method()) else {
            debug!(
                app = %path.app_name(),
                interface = %path.interface(),
                method = %path.method(),
                "Callback not found"
            );
            return Err(Error::MethodNotFound {
                app: path.app_name().to_string(),
                interface: path.interface().to_string(),
                method: path.method().to_string(),
            });
        };
        let handler = Arc::clone(method.handler());

        let mut dr = DudaRequest::new(session.socket(), Arc::clone(request), path);
        trace!(
            request = %dr.id(),
            app = %dr.app_name(),
            interface = %dr.interface(),
            method = %dr.method(),
            "Invoking web service"
        );

        if catch_unwind(AssertUnwindSafe(|| handler.call(&mut dr))).is_err() {
            warn!(
                app = %dr.app_name(),
                interface = %dr.interface(),
                method = %dr.method(),
                "Web service handler panicked"
            );
            let err = Error::HandlerPanicked {
                app: dr.app_name().to_string(),
                interface: dr.interface().to_string(),
                method: dr.method().to_string(),
            };
            abandon(dr);
            return Err(err);
        }

        if let Err(e) = session.write_all(&dr.response_head().to_wire()) {
            abandon(dr);
            return Err(e.into());
        }
        dr.mark_headers_sent();

        if request.method() == Method::Head {
            dr.discard_body();
        }

        if dr.pending_body() > 0 && dr.event_is_registered_write(Events::BODY_FLUSH) {
            let id = events.register(dr, Events::BODY_FLUSH);
            return Ok(Stage::AwaitingWrite(id));
        }

        if let Err(e) = flush_body(&mut dr, session) {
            abandon(dr);
            return Err(e.into());
        }
        service_end(dr, hooks);
        Ok(Stage::Completed)
    }
}

fn flush_body<S: SessionOps>(
    dr: &mut DudaRequest,
    session: &mut HttpSession<S>,
) -> std::result::Result<(), HttpError> {
    while dr.pending_body() > 0 {
        if !session.get_ref().poll(PollEvents::Write, session.timeout())? {
            return Err(HttpError::Timeout);
        }
        dr.body_flush(session.get_mut())?;
    }
    Ok(())
}
