use super::{fill_input_set, InputQueue, InputSet, Readiness, SetPoll, SyncSet};
use crate::error::{GraphError, Result};
use std::sync::Arc;

/// All streams form one sync set; input sets are handed out `batch_size` at a time.
#[derive(Debug)]
pub struct DefaultHandler {
    node: Arc<str>,
    set: SyncSet,
    process_bounds: bool,
    ignore_back_edges: bool,
    batch_size: usize,
    buffered: Vec<InputSet>,
}

impl DefaultHandler {
    pub(crate) fn new(
        node: Arc<str>,
        back_edges: &[bool],
        process_bounds: bool,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': batch_size must be at least 1",
                node
            )));
        }
        let mut handler = Self::single(node, back_edges, process_bounds);
        handler.batch_size = batch_size;
        Ok(handler)
    }

    /// One input set per task.
    pub(crate) fn single(node: Arc<str>, back_edges: &[bool], process_bounds: bool) -> Self {
        Self {
            node,
            set: SyncSet::new((0..back_edges.len()).collect(), back_edges),
            process_bounds,
            ignore_back_edges: false,
            batch_size: 1,
            buffered: Vec::new(),
        }
    }

    pub(crate) fn sync_set(&self) -> &SyncSet {
        &self.set
    }

    pub fn readiness(&mut self, queues: &mut [InputQueue]) -> Readiness {
        loop {
            match self
                .set
                .poll(&self.node, queues, self.process_bounds, self.ignore_back_edges)
            {
                SetPoll::Ready(ts) => {
                    let input_set = fill_input_set(queues, ts, |_| true);
                    self.set.mark_processed(ts);
                    self.buffered.push(input_set);
                    if self.buffered.len() >= self.batch_size {
                        return Readiness::Ready(std::mem::take(&mut self.buffered));
                    }
                }
                SetPoll::NotReady => return Readiness::NotReady,
                SetPoll::Done => {
                    if self.buffered.is_empty() {
                        return Readiness::ReadyForClose;
                    }
                    return Readiness::Ready(std::mem::take(&mut self.buffered));
                }
            }
        }
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffered.is_empty()
    }

    pub fn release_back_edges(&mut self) {
        self.ignore_back_edges = true;
    }
}
