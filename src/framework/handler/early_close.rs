use super::{DefaultHandler, InputQueue, Readiness};
use std::sync::Arc;

/// Default readiness, but ready to close once any forward stream is done.
#[derive(Debug)]
pub struct EarlyCloseHandler {
    inner: DefaultHandler,
}

impl EarlyCloseHandler {
    pub(crate) fn new(node: Arc<str>, back_edges: &[bool], process_bounds: bool) -> Self {
        Self {
            inner: DefaultHandler::single(node, back_edges, process_bounds),
        }
    }

    pub fn readiness(&mut self, queues: &mut [InputQueue]) -> Readiness {
        if self.inner.sync_set().any_forward_done(queues) {
            return Readiness::ReadyForClose;
        }
        self.inner.readiness(queues)
    }

    pub fn has_buffered(&self) -> bool {
        self.inner.has_buffered()
    }

    pub fn release_back_edges(&mut self) {
        self.inner.release_back_edges();
    }
}
