use super::{fill_input_set, InputQueue, Readiness, SetPoll, SyncSet};
use crate::error::{GraphError, Result};
use crate::framework::tag_map::{parse_tag_index, TagMap};
use crate::framework::timestamp::Timestamp;
use std::sync::Arc;

/// Independent sync sets; fires at the earliest timestamp any set is ready at.
///
/// Every set ready at that timestamp contributes its packets to the input set.
/// Used for both the SyncSet and Immediate policies.
#[derive(Debug)]
pub struct SyncSetHandler {
    node: Arc<str>,
    sets: Vec<SyncSet>,
    process_bounds: bool,
    ignore_back_edges: bool,
}

impl SyncSetHandler {
    /// One sync set per stream.
    pub(crate) fn immediate(node: Arc<str>, back_edges: &[bool], process_bounds: bool) -> Self {
        let sets = (0..back_edges.len())
            .map(|i| SyncSet::new(vec![i], back_edges))
            .collect();
        Self {
            node,
            sets,
            process_bounds,
            ignore_back_edges: false,
        }
    }

    /// Sets listed as `TAG` (every index) or `TAG:index`; unlisted streams form one more set.
    pub(crate) fn new(
        node: Arc<str>,
        tag_map: &TagMap,
        sync_sets: &[Vec<String>],
        back_edges: &[bool],
        process_bounds: bool,
    ) -> Result<Self> {
        let mut assigned = vec![false; tag_map.len()];
        let mut sets = Vec::with_capacity(sync_sets.len() + 1);

        for entries in sync_sets {
            let mut streams = Vec::new();
            for entry in entries {
                let (tag, index) = parse_tag_index(entry)?;
                let ids: Vec<usize> = match index {
                    Some(i) => tag_map.id(&tag, i).map(|id| id.index()).into_iter().collect(),
                    None => tag_map.ids_for_tag(&tag).map(|id| id.index()).collect(),
                };
                if ids.is_empty() {
                    return Err(GraphError::InvalidConfig(format!(
                        "node '{}': sync set entry '{}' matches no input stream",
                        node, entry
                    )));
                }
                for id in ids {
                    if assigned[id] {
                        return Err(GraphError::InvalidConfig(format!(
                            "node '{}': input '{}' is in more than one sync set",
                            node, entry
                        )));
                    }
                    assigned[id] = true;
                    streams.push(id);
                }
            }
            if !streams.is_empty() {
                streams.sort_unstable();
                sets.push(SyncSet::new(streams, back_edges));
            }
        }

        let leftover: Vec<usize> = (0..tag_map.len()).filter(|&i| !assigned[i]).collect();
        if !leftover.is_empty() {
            sets.push(SyncSet::new(leftover, back_edges));
        }

        Ok(Self {
            node,
            sets,
            process_bounds,
            ignore_back_edges: false,
        })
    }

    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn readiness(&mut self, queues: &mut [InputQueue]) -> Readiness {
        let mut polls = Vec::with_capacity(self.sets.len());
        let mut earliest: Option<Timestamp> = None;
        let mut all_done = true;

        for set in &mut self.sets {
            let poll = set.poll(&self.node, queues, self.process_bounds, self.ignore_back_edges);
            match poll {
                SetPoll::Ready(ts) => {
                    all_done = false;
                    earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
                }
                SetPoll::NotReady => all_done = false,
                SetPoll::Done => {}
            }
            polls.push(poll);
        }

        let Some(ts) = earliest else {
            return if all_done {
                Readiness::ReadyForClose
            } else {
                Readiness::NotReady
            };
        };

        let mut fired = vec![false; queues.len()];
        for (set, poll) in self.sets.iter_mut().zip(&polls) {
            if *poll == SetPoll::Ready(ts) {
                for &i in set.streams() {
                    fired[i] = true;
                }
                set.mark_processed(ts);
            }
        }
        Readiness::Ready(vec![fill_input_set(queues, ts, |i| fired[i])])
    }

    pub fn release_back_edges(&mut self) {
        self.ignore_back_edges = true;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_immediate_fires_per_stream() {
        let mut h = SyncSetHandler::immediate(Arc::from("n"), &[false, false], false);
        let mut queues = vec![InputQueue::new(false), InputQueue::new(false)];
        push(&mut queues[1], 3);
        let r = h.readiness(&mut queues);
        assert_eq!(ready_timestamps(&r), vec![ts(3)]);
        if let Readiness::Ready(sets) = r {
            assert!(sets[0].shards[0].is_empty());
            assert_eq!(*sets[0].shards[1].get::<i64>().unwrap(), 3);
        }
        assert!(matches!(h.readiness(&mut queues), Readiness::NotReady));
    }

    #[test]
    fn test_immediate_merges_sets_at_same_timestamp() {
        let mut h = SyncSetHandler::immediate(Arc::from("n"), &[false, false], false);
        let mut queues = vec![InputQueue::new(false), InputQueue::new(false)];
        push(&mut queues[0], 2);
        push(&mut queues[1], 2);
        push(&mut queues[1], 5);
        if let Readiness::Ready(sets) = h.readiness(&mut queues) {
            assert_eq!(sets[0].timestamp, ts(2));
            assert!(!sets[0].shards[0].is_empty());
            assert!(!sets[0].shards[1].is_empty());
        } else {
            panic!("expected ready");
        }
        assert_eq!(ready_timestamps(&h.readiness(&mut queues)), vec![ts(5)]);
    }

    #[test]
    fn test_sync_sets_from_tags() {
        let map = TagMap::new(&["A:0:a0", "A:1:a1", "B:b", "C:c"]).unwrap();
        let sets = vec![vec!["A".to_string()], vec!["B:0".to_string()]];
        let h = SyncSetHandler::new(Arc::from("n"), &map, &sets, &[false; 4], false).unwrap();
        assert_eq!(h.num_sets(), 3);

        let dup = vec![vec!["A".to_string()], vec!["A:1".to_string()]];
        assert!(SyncSetHandler::new(Arc::from("n"), &map, &dup, &[false; 4], false).is_err());
        let unknown = vec![vec!["D".to_string()]];
        assert!(SyncSetHandler::new(Arc::from("n"), &map, &unknown, &[false; 4], false).is_err());
    }

    #[test]
    fn test_sync_set_waits_within_its_set_only() {
        let map = TagMap::new(&["A:a", "B:b", "C:c"]).unwrap();
        let sets = vec![vec!["A".to_string(), "B".to_string()]];
        let mut h = SyncSetHandler::new(Arc::from("n"), &map, &sets, &[false; 3], false).unwrap();
        let mut queues = vec![
            InputQueue::new(false),
            InputQueue::new(false),
            InputQueue::new(false),
        ];
        push(&mut queues[0], 1);
        push(&mut queues[2], 4);
        let r = h.readiness(&mut queues);
        assert_eq!(ready_timestamps(&r), vec![ts(4)]);
        assert_eq!(queues[0].len(), 1);

        queues[1].set_bound(Timestamp::DONE);
        assert_eq!(ready_timestamps(&h.readiness(&mut queues)), vec![ts(1)]);
    }

    #[test]
    fn test_closes_when_every_set_is_done() {
        let mut h = SyncSetHandler::immediate(Arc::from("n"), &[false, false], true);
        let mut queues = vec![InputQueue::new(false), InputQueue::new(false)];
        queues[0].set_bound(Timestamp::DONE);
        assert_eq!(
            ready_timestamps(&h.readiness(&mut queues)),
            vec![Timestamp::ONE_OVER_POST_STREAM]
        );
        assert!(matches!(h.readiness(&mut queues), Readiness::NotReady));
        queues[1].set_bound(Timestamp::DONE);
        assert_eq!(
            ready_timestamps(&h.readiness(&mut queues)),
            vec![Timestamp::ONE_OVER_POST_STREAM]
        );
        assert!(matches!(h.readiness(&mut queues), Readiness::ReadyForClose));
    }
}
