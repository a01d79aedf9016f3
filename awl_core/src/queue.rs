//! Node pools and queues.
//!
//! Audio packets travel through the pipeline as fixed-capacity *nodes* drawn
//! from per-pipeline pools. Nodes are addressed by index within a
//! [`NodeBank`]; each bank owns its slots and every queue over them, so a
//! node is either on exactly one queue or held by exactly one endpoint.
//!
//! A node enqueued into several live queues at once (multi-consumer fan-out)
//! is co-owned through `copy_count`: enqueue on a live queue increments it,
//! dequeue decrements it, and the node returns to its home free-list only
//! when the count reaches zero. Free-list traffic never touches the count.
//!
//! Every mutating operation is bracketed by a caller-supplied critical
//! section pair, because I/O interrupt handlers enqueue and dequeue on the
//! same banks as the foreground loop.

use alloc::{boxed::Box, vec::Vec};

use crate::mem_pool::MemPool;

/// Index of a node within its [`NodeBank`].
pub type NodeId = u16;

/// Index of a queue within its [`NodeBank`].
pub type QueueId = u8;

/// Queue length limit meaning "no limit".
pub const LIMIT_UNLIMITED: u16 = u16::MAX;

/// Critical section entry/exit hooks.
///
/// The pair must provide mutual exclusion against every interrupt context
/// that can invoke queue operations on the same bank (codec DMA completion,
/// wireless RX callbacks). Critical sections stay short: enqueue and dequeue
/// are O(1).
#[derive(Clone, Copy)]
pub struct CriticalCfg {
    /// Enter a critical section.
    pub enter: fn(),
    /// Exit a critical section.
    pub exit: fn(),
}

impl CriticalCfg {
    /// A no-op pair for single-context use (host tests, offline tools).
    pub const fn noop() -> Self {
        fn nop() {}
        Self { enter: nop, exit: nop }
    }
}

struct NodeSlot {
    data: Box<[u8]>,
    payload_size: u16,
    home_queue: QueueId,
    copy_count: u8,
    next: Option<NodeId>,
}

struct QueueState {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    length: u16,
    limit: u16,
    name: &'static str,
    is_free_list: bool,
}

/// Snapshot of one queue, yielded by [`NodeBank::queue_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Human-readable queue name.
    pub name: &'static str,
    /// Current number of nodes.
    pub length: u16,
    /// Maximum number of nodes.
    pub limit: u16,
    /// True for free-lists, false for live queues.
    pub is_free_list: bool,
}

/// A set of node pools and the queues over them.
pub struct NodeBank {
    slots: Vec<NodeSlot>,
    queues: Vec<QueueState>,
    critical: CriticalCfg,
}

impl NodeBank {
    /// Create an empty bank using the given critical section hooks.
    pub fn new(critical: CriticalCfg) -> Self {
        Self {
            slots: Vec::new(),
            queues: Vec::new(),
            critical,
        }
    }

    /// Carve `num_nodes` nodes of `data_size` bytes each from the memory
    /// pool and place them on a new free-list.
    ///
    /// Returns `None` when the pool budget is exhausted.
    pub fn init_pool(
        &mut self,
        pool: &mut MemPool,
        num_nodes: u16,
        data_size: u16,
        name: &'static str,
    ) -> Option<QueueId> {
        let queue_id = self.queues.len() as QueueId;
        self.queues.push(QueueState {
            head: None,
            tail: None,
            length: 0,
            limit: num_nodes,
            name,
            is_free_list: true,
        });

        for _ in 0..num_nodes {
            let data = pool.alloc_bytes(data_size as usize)?;
            let node = self.slots.len() as NodeId;
            self.slots.push(NodeSlot {
                data,
                payload_size: 0,
                home_queue: queue_id,
                copy_count: 0,
                next: None,
            });
            self.link_tail(queue_id, node);
        }

        Some(queue_id)
    }

    /// Create an empty live queue with a length limit.
    pub fn init_queue(&mut self, limit: u16, name: &'static str) -> QueueId {
        let queue_id = self.queues.len() as QueueId;
        self.queues.push(QueueState {
            head: None,
            tail: None,
            length: 0,
            limit,
            name,
            is_free_list: false,
        });
        queue_id
    }

    /// Take a node from a free-list. Returns `None` on a live queue or when
    /// the free-list is empty.
    pub fn get_free_node(&mut self, queue: QueueId) -> Option<NodeId> {
        if !self.queues[queue as usize].is_free_list {
            return None;
        }
        self.dequeue(queue)
    }

    /// Return a node to its home free-list once no live queue co-owns it.
    pub fn free_node(&mut self, node: NodeId) {
        (self.critical.enter)();
        if self.slots[node as usize].copy_count == 0 {
            let home = self.slots[node as usize].home_queue;
            self.enqueue_unlocked(home, node);
        }
        (self.critical.exit)();
    }

    /// Remove and return the head node of a queue.
    pub fn dequeue(&mut self, queue: QueueId) -> Option<NodeId> {
        (self.critical.enter)();
        let head = self.unlink_head(queue);
        if let Some(node) = head {
            if !self.queues[queue as usize].is_free_list {
                // Only live queues track co-ownership.
                let slot = &mut self.slots[node as usize];
                slot.copy_count = slot.copy_count.saturating_sub(1);
            }
        }
        (self.critical.exit)();
        head
    }

    /// Append a node to a queue. Fails when the queue is at its limit.
    pub fn enqueue(&mut self, queue: QueueId, node: NodeId) -> bool {
        (self.critical.enter)();
        let ret = self.enqueue_unlocked(queue, node);
        (self.critical.exit)();
        ret
    }

    /// Insert a node at the head of a queue. Fails when the queue is at its
    /// limit.
    pub fn enqueue_at_head(&mut self, queue: QueueId, node: NodeId) -> bool {
        (self.critical.enter)();
        let q = &mut self.queues[queue as usize];
        let ret = if q.length < q.limit {
            self.slots[node as usize].next = q.head;
            let q = &mut self.queues[queue as usize];
            q.head = Some(node);
            if q.tail.is_none() {
                q.tail = Some(node);
            }
            q.length += 1;
            if !q.is_free_list {
                self.slots[node as usize].copy_count += 1;
            }
            true
        } else {
            false
        };
        (self.critical.exit)();
        ret
    }

    /// Head node of a live queue without removing it.
    pub fn peek(&self, queue: QueueId) -> Option<NodeId> {
        let q = &self.queues[queue as usize];
        if q.is_free_list { None } else { q.head }
    }

    /// Current length of a queue.
    #[inline]
    pub fn len(&self, queue: QueueId) -> u16 {
        self.queues[queue as usize].length
    }

    /// True when the queue holds no nodes.
    #[inline]
    pub fn is_empty(&self, queue: QueueId) -> bool {
        self.len(queue) == 0
    }

    /// Length limit of a queue.
    #[inline]
    pub fn limit(&self, queue: QueueId) -> u16 {
        self.queues[queue as usize].limit
    }

    /// Free every node of a live queue back to its home free-list.
    pub fn flush(&mut self, queue: QueueId) {
        if self.queues[queue as usize].is_free_list {
            return;
        }
        while let Some(node) = self.dequeue(queue) {
            self.free_node(node);
        }
    }

    /// Iterate over per-queue statistics, newest queue first.
    pub fn queue_stats(&self) -> impl Iterator<Item = QueueStats> + '_ {
        self.queues.iter().rev().map(|q| QueueStats {
            name: q.name,
            length: q.length,
            limit: q.limit,
            is_free_list: q.is_free_list,
        })
    }

    /// Total number of nodes carved across all pools in this bank.
    #[inline]
    pub fn total_nodes(&self) -> usize {
        self.slots.len()
    }

    /// Sum of all queue lengths; nodes held by endpoints are not counted.
    pub fn queued_nodes(&self) -> usize {
        self.queues.iter().map(|q| q.length as usize).sum()
    }

    /// Node payload size in bytes.
    #[inline]
    pub fn payload_size(&self, node: NodeId) -> u16 {
        self.slots[node as usize].payload_size
    }

    /// Set the node payload size in bytes.
    #[inline]
    pub fn set_payload_size(&mut self, node: NodeId, size: u16) {
        self.slots[node as usize].payload_size = size;
    }

    /// Node data buffer.
    #[inline]
    pub fn data(&self, node: NodeId) -> &[u8] {
        &self.slots[node as usize].data
    }

    /// Node data buffer, mutable.
    #[inline]
    pub fn data_mut(&mut self, node: NodeId) -> &mut [u8] {
        &mut self.slots[node as usize].data
    }

    /// Current co-ownership count of a node.
    #[inline]
    pub fn copy_count(&self, node: NodeId) -> u8 {
        self.slots[node as usize].copy_count
    }

    /// Data buffers of two distinct nodes, the first mutable as input
    /// scratch, the second as output.
    ///
    /// # Panics
    ///
    /// Panics when both ids name the same node.
    pub fn data_pair_mut(&mut self, a: NodeId, b: NodeId) -> (&mut [u8], &mut [u8]) {
        assert_ne!(a, b, "node pair must be distinct");
        let (x, y) = (a as usize, b as usize);
        if x < y {
            let (left, right) = self.slots.split_at_mut(y);
            (&mut left[x].data, &mut right[0].data)
        } else {
            let (left, right) = self.slots.split_at_mut(x);
            (&mut right[0].data, &mut left[y].data)
        }
    }

    /// Copy `len` data bytes and the payload size from one node to another.
    ///
    /// Fails when the destination buffer is smaller than `len`.
    pub fn copy_node(&mut self, dst: NodeId, src: NodeId, len: usize) -> bool {
        if dst == src {
            return true;
        }
        let (d, s) = (dst as usize, src as usize);
        let (lo, hi, dst_is_lo) = if d < s { (d, s, true) } else { (s, d, false) };
        let (left, right) = self.slots.split_at_mut(hi);
        let (dst_slot, src_slot) = if dst_is_lo {
            (&mut left[lo], &mut right[0])
        } else {
            (&mut right[0], &mut left[lo])
        };
        if dst_slot.data.len() < len || src_slot.data.len() < len {
            return false;
        }
        dst_slot.data[..len].copy_from_slice(&src_slot.data[..len]);
        dst_slot.payload_size = src_slot.payload_size;
        true
    }

    fn enqueue_unlocked(&mut self, queue: QueueId, node: NodeId) -> bool {
        let q = &mut self.queues[queue as usize];
        if q.length >= q.limit {
            return false;
        }
        self.link_tail(queue, node);
        let q = &self.queues[queue as usize];
        if !q.is_free_list {
            self.slots[node as usize].copy_count += 1;
        }
        true
    }

    fn link_tail(&mut self, queue: QueueId, node: NodeId) {
        self.slots[node as usize].next = None;
        let q = &mut self.queues[queue as usize];
        match q.tail {
            Some(tail) => {
                self.slots[tail as usize].next = Some(node);
                self.queues[queue as usize].tail = Some(node);
            }
            None => {
                q.head = Some(node);
                q.tail = Some(node);
            }
        }
        self.queues[queue as usize].length += 1;
    }

    fn unlink_head(&mut self, queue: QueueId) -> Option<NodeId> {
        let q = &mut self.queues[queue as usize];
        let head = q.head?;
        q.head = self.slots[head as usize].next;
        let q = &mut self.queues[queue as usize];
        if q.head.is_none() {
            q.tail = None;
        }
        q.length -= 1;
        self.slots[head as usize].next = None;
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank_with_pool(nodes: u16, data_size: u16) -> (NodeBank, QueueId) {
        let mut pool = MemPool::new(16 * 1024);
        let mut bank = NodeBank::new(CriticalCfg::noop());
        let free = bank
            .init_pool(&mut pool, nodes, data_size, "Test Free Queue")
            .unwrap();
        (bank, free)
    }

    #[test]
    fn test_pool_starts_full() {
        let (bank, free) = bank_with_pool(4, 32);
        assert_eq!(bank.len(free), 4);
        assert_eq!(bank.limit(free), 4);
        assert_eq!(bank.total_nodes(), 4);
    }

    #[test]
    fn test_fifo_order() {
        let (mut bank, free) = bank_with_pool(3, 16);
        let live = bank.init_queue(3, "Live");

        let a = bank.get_free_node(free).unwrap();
        let b = bank.get_free_node(free).unwrap();
        assert!(bank.enqueue(live, a));
        assert!(bank.enqueue(live, b));

        assert_eq!(bank.dequeue(live), Some(a));
        assert_eq!(bank.dequeue(live), Some(b));
        assert_eq!(bank.dequeue(live), None);
    }

    #[test]
    fn test_limit_enforced() {
        let (mut bank, free) = bank_with_pool(3, 16);
        let live = bank.init_queue(2, "Live");

        let a = bank.get_free_node(free).unwrap();
        let b = bank.get_free_node(free).unwrap();
        let c = bank.get_free_node(free).unwrap();
        assert!(bank.enqueue(live, a));
        assert!(bank.enqueue(live, b));
        assert!(!bank.enqueue(live, c));
        assert_eq!(bank.len(live), 2);
    }

    #[test]
    fn test_copy_count_multi_queue() {
        let (mut bank, free) = bank_with_pool(2, 16);
        let q1 = bank.init_queue(2, "Q1");
        let q2 = bank.init_queue(2, "Q2");
        let q3 = bank.init_queue(2, "Q3");

        let node = bank.get_free_node(free).unwrap();
        assert_eq!(bank.copy_count(node), 0);

        bank.enqueue(q1, node);
        bank.enqueue(q2, node);
        bank.enqueue(q3, node);
        assert_eq!(bank.copy_count(node), 3);

        // Node only returns home once every queue has released it.
        assert_eq!(bank.dequeue(q1), Some(node));
        bank.free_node(node);
        assert_eq!(bank.len(free), 1);
        assert_eq!(bank.copy_count(node), 2);

        assert_eq!(bank.dequeue(q2), Some(node));
        bank.free_node(node);
        assert_eq!(bank.len(free), 1);

        assert_eq!(bank.dequeue(q3), Some(node));
        assert_eq!(bank.copy_count(node), 0);
        bank.free_node(node);
        assert_eq!(bank.len(free), 2);
    }

    #[test]
    fn test_free_list_does_not_touch_copy_count() {
        let (mut bank, free) = bank_with_pool(2, 16);
        let node = bank.get_free_node(free).unwrap();
        assert_eq!(bank.copy_count(node), 0);
        bank.free_node(node);
        assert_eq!(bank.copy_count(node), 0);
        assert_eq!(bank.len(free), 2);
    }

    #[test]
    fn test_enqueue_at_head() {
        let (mut bank, free) = bank_with_pool(3, 16);
        let live = bank.init_queue(3, "Live");

        let a = bank.get_free_node(free).unwrap();
        let b = bank.get_free_node(free).unwrap();
        bank.enqueue(live, a);
        assert!(bank.enqueue_at_head(live, b));
        assert_eq!(bank.dequeue(live), Some(b));
        assert_eq!(bank.dequeue(live), Some(a));
    }

    #[test]
    fn test_peek_leaves_queue_untouched() {
        let (mut bank, free) = bank_with_pool(2, 16);
        let live = bank.init_queue(2, "Live");
        assert_eq!(bank.peek(live), None);

        let a = bank.get_free_node(free).unwrap();
        bank.enqueue(live, a);
        assert_eq!(bank.peek(live), Some(a));
        assert_eq!(bank.len(live), 1);
        // Free-lists cannot be peeked.
        assert_eq!(bank.peek(free), None);
    }

    #[test]
    fn test_flush_returns_nodes_home() {
        let (mut bank, free) = bank_with_pool(3, 16);
        let live = bank.init_queue(3, "Live");
        for _ in 0..3 {
            let n = bank.get_free_node(free).unwrap();
            bank.enqueue(live, n);
        }
        assert_eq!(bank.len(free), 0);
        bank.flush(live);
        assert_eq!(bank.len(live), 0);
        assert_eq!(bank.len(free), 3);
    }

    #[test]
    fn test_node_conservation() {
        // P1: nodes never leak across produce/consume cycles.
        let (mut bank, free) = bank_with_pool(4, 16);
        let live = bank.init_queue(4, "Live");

        for _ in 0..100 {
            let n = bank.get_free_node(free).unwrap();
            bank.enqueue(live, n);
            let m = bank.dequeue(live).unwrap();
            bank.free_node(m);
            assert_eq!(bank.queued_nodes(), bank.total_nodes());
        }
    }

    #[test]
    fn test_copy_node() {
        let (mut bank, free) = bank_with_pool(2, 16);
        let a = bank.get_free_node(free).unwrap();
        let b = bank.get_free_node(free).unwrap();

        bank.data_mut(a)[..4].copy_from_slice(&[1, 2, 3, 4]);
        bank.set_payload_size(a, 4);
        assert!(bank.copy_node(b, a, 4));
        assert_eq!(&bank.data(b)[..4], &[1, 2, 3, 4]);
        assert_eq!(bank.payload_size(b), 4);

        assert!(!bank.copy_node(b, a, 64));
    }

    #[test]
    fn test_queue_stats_iteration() {
        let (mut bank, _free) = bank_with_pool(2, 16);
        bank.init_queue(5, "Live");
        let stats: alloc::vec::Vec<_> = bank.queue_stats().collect();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "Live");
        assert!(!stats[0].is_free_list);
        assert_eq!(stats[1].name, "Test Free Queue");
        assert!(stats[1].is_free_list);
    }

    #[test]
    fn test_pool_exhaustion_reported() {
        let mut pool = MemPool::new(64);
        let mut bank = NodeBank::new(CriticalCfg::noop());
        assert!(bank.init_pool(&mut pool, 4, 32, "Too Big").is_none());
    }

    #[test]
    fn test_random_operation_sequence_conserves_nodes() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let (mut bank, free) = bank_with_pool(6, 16);
        let live_a = bank.init_queue(6, "A");
        let live_b = bank.init_queue(6, "B");

        let mut rng = StdRng::seed_from_u64(42);
        let mut held: alloc::vec::Vec<NodeId> = alloc::vec::Vec::new();
        for _ in 0..10_000 {
            match rng.gen_range(0..4) {
                0 => {
                    if let Some(n) = bank.get_free_node(free) {
                        held.push(n);
                    }
                }
                1 => {
                    if let Some(n) = held.pop() {
                        if !bank.enqueue(live_a, n) {
                            bank.free_node(n);
                        }
                    }
                }
                2 => {
                    if let Some(n) = bank.dequeue(live_a) {
                        if !bank.enqueue(live_b, n) {
                            bank.free_node(n);
                        }
                    }
                }
                _ => {
                    if let Some(n) = bank.dequeue(live_b) {
                        bank.free_node(n);
                    }
                }
            }
            assert_eq!(bank.queued_nodes() + held.len(), bank.total_nodes());
        }
    }
}
