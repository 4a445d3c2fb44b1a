//! Write-continuation events
//!
//! A service that buffers more body than one write can take registers the
//! body-flush event. The dispatcher then parks its request here instead of
//! blocking, and every write-ready notification for the socket flushes a
//! bit more until the body is out and the request completes.
//!
//! Each worker owns one queue, created when the worker starts and never
//! shared with other workers.

use super::dispatch::{service_end, RequestEnd};
use super::request::{DudaRequest, Events, RequestId};
use crate::http::SessionOps;
use std::os::fd::RawFd;
use tracing::{debug, trace};

/// Result of a write-ready notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// A request on the socket still has body pending; keep it scheduled
    Owned,
    /// Nothing is pending on the socket anymore
    Continue,
}

/// Result of [`EventQueue::unregister`]
#[derive(Debug)]
pub enum Unregistered {
    /// The request is not queued or the event was not set
    NotFound,
    /// The event was cleared, other events keep the request queued
    Cleared,
    /// The last event was cleared and the request left the queue
    Released(DudaRequest),
}

/// Requests waiting on write-ready notifications, in registration order
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: Vec<DudaRequest>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `dr` with `event` set
    pub fn register(&mut self, mut dr: DudaRequest, event: Events) -> RequestId {
        dr.event_register_write(event);
        let id = dr.id();
        trace!(
            request = %id,
            socket = dr.socket(),
            events = event.bits(),
            "Write event registered"
        );
        self.pending.push(dr);
        id
    }

    /// Set `event` on a queued request
    ///
    /// Returns `Some(false)` when the event was already set and `None` when
    /// the request is not queued.
    pub fn register_event(&mut self, id: RequestId, event: Events) -> Option<bool> {
        let dr = self.pending.iter_mut().find(|dr| dr.id() == id)?;
        if dr.event_is_registered_write(event) {
            return Some(false);
        }
        dr.event_register_write(event);
        Some(true)
    }

    /// Clear `event` on a queued request
    pub fn unregister(&mut self, id: RequestId, event: Events) -> Unregistered {
        let Some(pos) = self.pending.iter().position(|dr| dr.id() == id) else {
            return Unregistered::NotFound;
        };
        if !self.pending[pos].event_unregister_write(event) {
            return Unregistered::NotFound;
        }
        if self.pending[pos].events().is_empty() {
            Unregistered::Released(self.pending.remove(pos))
        } else {
            Unregistered::Cleared
        }
    }

    pub fn is_registered(&self, id: RequestId, event: Events) -> bool {
        self.pending
            .iter()
            .any(|dr| dr.id() == id && dr.event_is_registered_write(event))
    }

    /// Whether any request on `socket` is queued
    pub fn has_socket(&self, socket: RawFd) -> bool {
        self.pending.iter().any(|dr| dr.socket() == socket)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drive the requests of `socket` after it became writable
    ///
    /// Requests are visited in registration order. The first one with body
    /// still pending after its flush keeps the event owned; fully flushed
    /// requests complete and leave the queue.
    pub fn on_write_ready<S: SessionOps>(
        &mut self,
        socket: RawFd,
        session: &mut S,
        hooks: &mut dyn RequestEnd,
    ) -> EventStatus {
        let mut i = 0;
        while i < self.pending.len() {
            let dr = &mut self.pending[i];
            if dr.socket() != socket || !dr.event_is_registered_write(Events::BODY_FLUSH) {
                i += 1;
                continue;
            }

            match dr.body_flush(session) {
                Ok(remaining) if remaining > 0 => {
                    trace!(request = %dr.id(), remaining, "Body flush partial");
                    return EventStatus::Owned;
                }
                Ok(_) => {
                    let dr = self.pending.remove(i);
                    trace!(request = %dr.id(), writes = dr.body_writes(), "Body flushed");
                    service_end(dr, hooks);
                }
                Err(e) => {
                    let dr = self.pending.remove(i);
                    debug!(request = %dr.id(), socket, error = %e, "Body flush failed");
                    service_end(dr, hooks);
                }
            }
        }

        EventStatus::Continue
    }

    /// Tear down every request of a finished connection
    ///
    /// End callbacks still run; the connection layer is not notified since
    /// it is the one closing. Returns the number of requests dropped.
    pub fn close_socket(&mut self, socket: RawFd) -> usize {
        let mut closed = 0;
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].socket() != socket {
                i += 1;
                continue;
            }
            let mut dr = self.pending.remove(i);
            debug!(
                request = %dr.id(),
                socket,
                pending = dr.pending_body(),
                "Write continuation dropped"
            );
            if let Some(end) = dr.take_end_callback() {
                end(&mut dr);
            }
            closed += 1;
        }
        closed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::duda::request::tests::request_for;
    use crate::http::{Error as HttpError, PollEvents, Result as HttpResult};
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    /// In-memory session accepting a scripted number of bytes per write
    pub(crate) struct ScriptedSession {
        pub(crate) socket: RawFd,
        pub(crate) budgets: VecDeque<usize>,
        pub(crate) written: Vec<u8>,
    }

    impl ScriptedSession {
        pub(crate) fn new(socket: RawFd) -> Self {
            ScriptedSession {
                socket,
                budgets: VecDeque::new(),
                written: Vec::new(),
            }
        }
    }

    impl SessionOps for ScriptedSession {
        fn socket(&self) -> RawFd {
            self.socket
        }

        fn poll(&self, _events: PollEvents, _timeout: Option<Duration>) -> HttpResult<bool> {
            Ok(true)
        }

        fn read(&mut self, _buf: &mut [u8]) -> HttpResult<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
            let budget = self.budgets.pop_front().unwrap_or(usize::MAX);
            if budget == 0 {
                return Err(HttpError::ConnectionClosed);
            }
            let n = buf.len().min(budget);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn close(&mut self) -> HttpResult<()> {
            Ok(())
        }
    }

    fn pending_request(socket: RawFd, body: &[u8]) -> DudaRequest {
        let mut dr = request_for("/blog/posts/list", socket);
        dr.body_write(body);
        dr.mark_headers_sent();
        dr
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut queue = EventQueue::new();
        let id = queue.register(pending_request(7, b"abc"), Events::BODY_FLUSH);

        assert_eq!(queue.register_event(id, Events::BODY_FLUSH), Some(false));
        assert_eq!(queue.register_event(id, Events::BODY_FLUSH), Some(false));
        assert_eq!(queue.len(), 1);
        assert!(queue.is_registered(id, Events::BODY_FLUSH));
    }

    #[test]
    fn test_unregister_without_register() {
        let mut queue = EventQueue::new();
        let stray = request_for("/blog/posts/list", 7);
        assert!(matches!(
            queue.unregister(stray.id(), Events::BODY_FLUSH),
            Unregistered::NotFound
        ));
        assert_eq!(queue.register_event(stray.id(), Events::BODY_FLUSH), None);
        assert!(!queue.is_registered(stray.id(), Events::BODY_FLUSH));
    }

    #[test]
    fn test_unregister_releases_request() {
        let mut queue = EventQueue::new();
        let id = queue.register(pending_request(7, b"abc"), Events::BODY_FLUSH);

        match queue.unregister(id, Events::BODY_FLUSH) {
            Unregistered::Released(dr) => assert_eq!(dr.id(), id),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(queue.is_empty());
        assert!(matches!(
            queue.unregister(id, Events::BODY_FLUSH),
            Unregistered::NotFound
        ));
    }

    #[test]
    fn test_partial_then_complete_flush() {
        let mut queue = EventQueue::new();
        let mut session = ScriptedSession::new(7);
        let mut finished: Vec<RawFd> = Vec::new();

        let ended = Rc::new(Cell::new(false));
        let mut dr = pending_request(7, b"0123456789");
        let flag = Rc::clone(&ended);
        dr.set_end_callback(move |_| flag.set(true));
        let id = queue.register(dr, Events::BODY_FLUSH);

        session.budgets.push_back(3);
        assert_eq!(queue.on_write_ready(7, &mut session, &mut finished), EventStatus::Owned);
        assert_eq!(session.written, b"012");
        assert!(queue.is_registered(id, Events::BODY_FLUSH));
        assert!(finished.is_empty());

        assert_eq!(queue.on_write_ready(7, &mut session, &mut finished), EventStatus::Continue);
        assert_eq!(session.written, b"0123456789");
        assert!(queue.is_empty());
        assert!(ended.get());
        assert_eq!(finished, vec![7]);
    }

    #[test]
    fn test_other_sockets_untouched() {
        let mut queue = EventQueue::new();
        let mut session = ScriptedSession::new(8);
        let mut finished: Vec<RawFd> = Vec::new();

        queue.register(pending_request(7, b"abc"), Events::BODY_FLUSH);
        assert_eq!(queue.on_write_ready(8, &mut session, &mut finished), EventStatus::Continue);
        assert!(session.written.is_empty());
        assert!(queue.has_socket(7));
        assert!(!queue.has_socket(8));
    }

    #[test]
    fn test_requests_on_a_socket_run_in_order() {
        let mut queue = EventQueue::new();
        let mut session = ScriptedSession::new(7);
        let mut finished: Vec<RawFd> = Vec::new();

        queue.register(pending_request(7, b"first"), Events::BODY_FLUSH);
        queue.register(pending_request(7, b"second"), Events::BODY_FLUSH);

        session.budgets.extend([5, 2]);
        assert_eq!(queue.on_write_ready(7, &mut session, &mut finished), EventStatus::Owned);
        assert_eq!(session.written, b"firstse");
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.on_write_ready(7, &mut session, &mut finished), EventStatus::Continue);
        assert_eq!(session.written, b"firstsecond");
        assert_eq!(finished, vec![7, 7]);
    }

    #[test]
    fn test_failed_flush_completes_request() {
        let mut queue = EventQueue::new();
        let mut session = ScriptedSession::new(7);
        let mut finished: Vec<RawFd> = Vec::new();

        queue.register(pending_request(7, b"abc"), Events::BODY_FLUSH);
        session.budgets.push_back(0);
        assert_eq!(queue.on_write_ready(7, &mut session, &mut finished), EventStatus::Continue);
        assert!(queue.is_empty());
        assert_eq!(finished, vec![7]);
    }

    #[test]
    fn test_close_socket_runs_end_callbacks() {
        let mut queue = EventQueue::new();
        let ended = Rc::new(Cell::new(0));

        for socket in [7, 7, 9] {
            let mut dr = pending_request(socket, b"abc");
            let counter = Rc::clone(&ended);
            dr.set_end_callback(move |_| counter.set(counter.get() + 1));
            queue.register(dr, Events::BODY_FLUSH);
        }

        assert_eq!(queue.close_socket(7), 2);
        assert_eq!(ended.get(), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.has_socket(9));
    }
}
