//! Task requests and the chain protocol.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// What a chain block asks the scheduler to do next.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskStatus {
    /// Advance to the next block.
    Continue,
    /// Run the same block again.
    Repeat,
    /// Discard the remainder of the chain.
    Stop,
    /// Enqueue a copy of the remaining chain (current block included)
    /// for another worker, then continue here with the next block.
    Split,
    /// Enqueue the whole remaining chain (current block included) and
    /// stop locally.
    Requeue,
}

/// One unit of work inside a chain.
pub type Block = Arc<dyn Fn() -> TaskStatus + Send + Sync>;

/// Wraps a closure as a chain [`Block`].
pub fn block(f: impl Fn() -> TaskStatus + Send + Sync + 'static) -> Block {
    Arc::new(f)
}

/// An ordered list of blocks with a cursor. Cloning a chain is cheap:
/// the block list is shared, only the cursor is per-instance.
#[derive(Clone)]
pub struct Chain {
    blocks: Arc<[Block]>,
    cursor: usize,
}

impl Chain {
    #[must_use]
    pub fn new(blocks: impl IntoIterator<Item = Block>) -> Self {
        Self {
            blocks: blocks.into_iter().collect(),
            cursor: 0,
        }
    }

    /// Runs blocks from the cursor onward. `redispatch` receives the
    /// chain copies that `Split`/`Requeue` push back to the queue.
    pub(crate) fn run(mut self, mut redispatch: impl FnMut(Chain)) {
        while self.cursor < self.blocks.len() {
            match (self.blocks[self.cursor])() {
                TaskStatus::Continue => self.cursor += 1,
                TaskStatus::Repeat => {}
                TaskStatus::Stop => return,
                TaskStatus::Split => {
                    redispatch(self.clone());
                    self.cursor += 1;
                }
                TaskStatus::Requeue => {
                    redispatch(self);
                    return;
                }
            }
        }
    }
}

pub(crate) enum TaskKind {
    Once(Box<dyn FnOnce() + Send>),
    Chain(Chain),
}

/// A queued task, ordered by due time (earliest first) with a
/// sequence number breaking ties in submission order.
pub(crate) struct TaskRequest {
    pub(crate) due: Instant,
    pub(crate) seq: u64,
    pub(crate) kind: TaskKind,
}

impl PartialEq for TaskRequest {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TaskRequest {}

impl PartialOrd for TaskRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so the earliest-due task surfaces on the max-heap.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn heap_pops_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (seq, offset) in [(0u64, 30u64), (1, 10), (2, 20)] {
            heap.push(TaskRequest {
                due: now + Duration::from_millis(offset),
                seq,
                kind: TaskKind::Once(Box::new(|| {})),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn equal_due_times_pop_in_submission_order() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for seq in [2u64, 0, 1] {
            heap.push(TaskRequest {
                due: now,
                seq,
                kind: TaskKind::Once(Box::new(|| {})),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn chain_continue_runs_every_block() {
        let count = Arc::new(AtomicUsize::new(0));
        let chain = Chain::new((0..3).map(|_| {
            let count = count.clone();
            block(move || {
                count.fetch_add(1, Ordering::SeqCst);
                TaskStatus::Continue
            })
        }));
        chain.run(|_| panic!("no redispatch expected"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn chain_stop_discards_the_rest() {
        let reached = Arc::new(AtomicUsize::new(0));
        let reached2 = reached.clone();
        let chain = Chain::new([
            block(|| TaskStatus::Stop),
            block(move || {
                reached2.fetch_add(1, Ordering::SeqCst);
                TaskStatus::Continue
            }),
        ]);
        chain.run(|_| {});
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn chain_repeat_reruns_the_block() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let chain = Chain::new([block(move || {
            if runs2.fetch_add(1, Ordering::SeqCst) < 2 {
                TaskStatus::Repeat
            } else {
                TaskStatus::Continue
            }
        })]);
        chain.run(|_| {});
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn chain_split_copies_from_current_block() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first2 = first.clone();
        let second2 = second.clone();
        let chain = Chain::new([
            block(move || {
                if first2.fetch_add(1, Ordering::SeqCst) == 0 {
                    TaskStatus::Split
                } else {
                    TaskStatus::Continue
                }
            }),
            block(move || {
                second2.fetch_add(1, Ordering::SeqCst);
                TaskStatus::Continue
            }),
        ]);

        let mut forks = Vec::new();
        chain.run(|fork| forks.push(fork));
        assert_eq!(forks.len(), 1);
        // The local run continued past the splitting block.
        assert_eq!((first.load(Ordering::SeqCst), second.load(Ordering::SeqCst)), (1, 1));

        // The fork re-runs the splitting block, then the rest.
        forks.pop().unwrap().run(|_| panic!("single fork expected"));
        assert_eq!((first.load(Ordering::SeqCst), second.load(Ordering::SeqCst)), (2, 2));
    }

    #[test]
    fn chain_requeue_stops_locally() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first2 = first.clone();
        let second2 = second.clone();
        let chain = Chain::new([
            block(move || {
                if first2.fetch_add(1, Ordering::SeqCst) == 0 {
                    TaskStatus::Requeue
                } else {
                    TaskStatus::Continue
                }
            }),
            block(move || {
                second2.fetch_add(1, Ordering::SeqCst);
                TaskStatus::Continue
            }),
        ]);

        let mut forks = Vec::new();
        chain.run(|fork| forks.push(fork));
        // Nothing after the requeueing block ran locally.
        assert_eq!((first.load(Ordering::SeqCst), second.load(Ordering::SeqCst)), (1, 0));

        forks.pop().unwrap().run(|_| {});
        assert_eq!((first.load(Ordering::SeqCst), second.load(Ordering::SeqCst)), (2, 1));
    }
}
