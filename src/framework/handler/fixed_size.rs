use super::{DefaultHandler, InputQueue, Readiness};
use crate::error::{GraphError, Result};
use crate::framework::timestamp::Timestamp;
use std::sync::Arc;

/// Default readiness after trimming queues that grew past `trigger_queue_size`.
///
/// Each triggered stream proposes a cut keeping its newest `target_queue_size`
/// packets; the earliest cut wins, or the latest with `fixed_min_size`. Packets
/// before the cut are discarded on every stream.
#[derive(Debug)]
pub struct FixedSizeHandler {
    inner: DefaultHandler,
    trigger_queue_size: usize,
    target_queue_size: usize,
    fixed_min_size: bool,
}

impl FixedSizeHandler {
    pub(crate) fn new(
        node: Arc<str>,
        back_edges: &[bool],
        process_bounds: bool,
        trigger_queue_size: usize,
        target_queue_size: usize,
        fixed_min_size: bool,
    ) -> Result<Self> {
        if target_queue_size == 0 || trigger_queue_size < target_queue_size {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': FixedSize needs 1 <= target_queue_size <= trigger_queue_size (got {} and {})",
                node, target_queue_size, trigger_queue_size
            )));
        }
        Ok(Self {
            inner: DefaultHandler::single(node, back_edges, process_bounds),
            trigger_queue_size,
            target_queue_size,
            fixed_min_size,
        })
    }

    fn trim(&self, queues: &mut [InputQueue]) {
        let mut cut: Option<Timestamp> = None;
        for &i in self.inner.sync_set().gating() {
            let queue = &queues[i];
            if queue.len() < self.trigger_queue_size {
                continue;
            }
            let Some(stream_cut) = queue.timestamp_at(queue.len() - self.target_queue_size) else {
                continue;
            };
            cut = Some(match cut {
                None => stream_cut,
                Some(c) if self.fixed_min_size => c.max(stream_cut),
                Some(c) => c.min(stream_cut),
            });
        }

        if let Some(cut) = cut {
            let dropped: usize = queues.iter_mut().map(|q| q.drop_before(cut)).sum();
            if dropped > 0 {
                tracing::debug!(dropped, cut = %cut, "fixed-size handler dropped packets");
            }
        }
    }

    pub fn readiness(&mut self, queues: &mut [InputQueue]) -> Readiness {
        self.trim(queues);
        self.inner.readiness(queues)
    }

    pub fn has_buffered(&self) -> bool {
        self.inner.has_buffered()
    }

    pub fn release_back_edges(&mut self) {
        self.inner.release_back_edges();
    }
}
