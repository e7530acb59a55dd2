// 准入调度
//
// 每轮最多比较两个候选：待处理队列中 payload 最大的一个，以及本轮新到达的一个。
// 新请求严格更大时直接处理新请求，队列不动；否则处理队列中的最大者，新请求入队。

use super::backlog::Backlog;
use super::capacity::WorkerCapacity;
use super::request::ChunkRequest;
use crate::transport::ClientId;
use std::sync::Arc;

#[derive(Debug)]
pub struct AdmissionScheduler {
    backlog: Backlog,
    capacity: Arc<WorkerCapacity>,
}

impl AdmissionScheduler {
    pub fn new(backlog_capacity: usize, capacity: Arc<WorkerCapacity>) -> Self {
        Self {
            backlog: Backlog::new(backlog_capacity),
            capacity,
        }
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// 队列非空且有空闲槽位时，本轮优先处理积压
    pub fn should_drain(&self) -> bool {
        !self.backlog.is_empty() && self.capacity.available() > 0
    }

    /// 在积压最大者和新到达的请求之间选出本轮要处理的一个
    pub fn choose(&mut self, arrival: Option<ChunkRequest>) -> Option<ChunkRequest> {
        let Some(arrival) = arrival else {
            return self.backlog.take_max();
        };

        let arrival_wins = match self.backlog.peek_max() {
            Some(best) => arrival.payload_size > best.payload_size,
            None => true,
        };
        if arrival_wins {
            return Some(arrival);
        }

        let chosen = self.backlog.take_max();
        // 刚取出一个，队列必然有空位
        if let Err(rejected) = self.backlog.push(arrival) {
            return Some(rejected);
        }
        chosen
    }

    /// 无空闲槽位时暂存请求；队列已满时原样退回
    pub fn defer(&mut self, request: ChunkRequest) -> Result<(), ChunkRequest> {
        self.backlog.push(request)
    }

    pub fn has_pending(&self, client_id: ClientId) -> bool {
        self.backlog.contains_client(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(client_id: ClientId, payload_size: u64) -> ChunkRequest {
        ChunkRequest {
            client_id,
            payload_size,
            chunk_index: 0,
            total_chunks: 1,
            is_final: true,
            buffer_handle: client_id,
        }
    }

    fn scheduler_with(sizes: &[u64]) -> AdmissionScheduler {
        let mut scheduler = AdmissionScheduler::new(16, Arc::new(WorkerCapacity::new(1)));
        for (i, size) in sizes.iter().enumerate() {
            scheduler.defer(request(100 + i as i32, *size)).unwrap();
        }
        scheduler
    }

    fn backlog_sizes(scheduler: &AdmissionScheduler) -> Vec<u64> {
        scheduler.backlog().iter().map(|r| r.payload_size).collect()
    }

    #[test]
    fn test_backlog_max_beats_smaller_arrival() {
        let mut scheduler = scheduler_with(&[10, 50, 30]);

        let chosen = scheduler.choose(Some(request(200, 20))).unwrap();
        assert_eq!(chosen.payload_size, 50);
        assert_eq!(backlog_sizes(&scheduler), vec![10, 30, 20]);
    }

    #[test]
    fn test_larger_arrival_is_admitted_directly() {
        let mut scheduler = scheduler_with(&[10, 50, 30]);

        let chosen = scheduler.choose(Some(request(200, 51))).unwrap();
        assert_eq!(chosen.client_id, 200);
        assert_eq!(backlog_sizes(&scheduler), vec![10, 50, 30]);
    }

    #[test]
    fn test_equal_arrival_loses_to_backlog() {
        let mut scheduler = scheduler_with(&[50]);

        let chosen = scheduler.choose(Some(request(200, 50))).unwrap();
        assert_eq!(chosen.client_id, 100);
        assert_eq!(backlog_sizes(&scheduler), vec![50]);
        assert!(scheduler.has_pending(200));
    }

    #[test]
    fn test_no_arrival_takes_backlog_max() {
        let mut scheduler = scheduler_with(&[10, 50, 30]);

        assert_eq!(scheduler.choose(None).unwrap().payload_size, 50);
        assert_eq!(scheduler.choose(None).unwrap().payload_size, 30);
        assert_eq!(scheduler.choose(None).unwrap().payload_size, 10);
        assert!(scheduler.choose(None).is_none());
    }

    #[test]
    fn test_should_drain_needs_backlog_and_slot() {
        let capacity = Arc::new(WorkerCapacity::new(1));
        let mut scheduler = AdmissionScheduler::new(4, capacity.clone());
        assert!(!scheduler.should_drain());

        scheduler.defer(request(100, 1)).unwrap();
        assert!(scheduler.should_drain());

        capacity.set_limit(0);
        assert!(!scheduler.should_drain());
    }

    proptest! {
        #[test]
        fn prop_choice_is_largest_visible_candidate(
            backlog in proptest::collection::vec(0u64..100, 0..12),
            arrival in proptest::option::of(0u64..100),
        ) {
            let mut scheduler = scheduler_with(&backlog);
            let before = backlog.len() + usize::from(arrival.is_some());

            let chosen = scheduler.choose(arrival.map(|size| request(999, size)));

            match (backlog.iter().max(), arrival) {
                (None, None) => prop_assert!(chosen.is_none()),
                (max, arr) => {
                    let chosen = chosen.unwrap();
                    let best = max.copied().into_iter().chain(arr).max().unwrap();
                    prop_assert_eq!(chosen.payload_size, best);
                    // 未被选中的请求全部留在队列中
                    prop_assert_eq!(scheduler.backlog().len() + 1, before);
                    for remaining in scheduler.backlog().iter() {
                        prop_assert!(remaining.payload_size <= chosen.payload_size);
                    }
                }
            }
        }
    }
}
