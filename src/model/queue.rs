//! Per-endpoint queue set: one record holding a FIFO lane per priority.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Priority;
use crate::storage::Document;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointQueue {
    pub endpoint_address: String,
    /// Lane `i` holds priority `i + 1`, head at the front.
    lanes: [VecDeque<Uuid>; 3],
}

impl EndpointQueue {
    pub fn new(endpoint_address: impl Into<String>) -> Self {
        Self {
            endpoint_address: endpoint_address.into(),
            lanes: Default::default(),
        }
    }

    pub fn lane(&self, priority: Priority) -> &VecDeque<Uuid> {
        &self.lanes[priority.index()]
    }

    pub fn push(&mut self, priority: Priority, task: Uuid) {
        self.lanes[priority.index()].push_back(task);
    }

    /// Drop `task` from the `priority` lane. `false` if it was not there.
    pub fn remove(&mut self, priority: Priority, task: Uuid) -> bool {
        let lane = &mut self.lanes[priority.index()];
        match lane.iter().position(|id| *id == task) {
            Some(at) => lane.remove(at).is_some(),
            None => false,
        }
    }

    /// Head of the most urgent non-empty lane.
    pub fn peek_next(&self) -> Option<(Priority, Uuid)> {
        Priority::ALL
            .into_iter()
            .find_map(|p| self.lane(p).front().map(|id| (p, *id)))
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}

impl Document for EndpointQueue {
    const COLLECTION: &'static str = "endpoint_queues";
    const ENTITY: &'static str = "endpoint queue";

    fn key(&self) -> String {
        self.endpoint_address.clone()
    }
}
