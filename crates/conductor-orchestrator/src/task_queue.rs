use conductor_core::TaskId;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// A task waiting for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub score: f64,
    seq: u64,
}

impl QueueEntry {
    /// Position among entries of equal score; lower goes first.
    pub fn insertion_seq(&self) -> u64 {
        self.seq
    }
}

/// Highest score first, then lowest insertion sequence.
#[derive(Debug, Clone, Copy)]
struct Rank {
    score: f64,
    seq: u64,
}

impl PartialEq for Rank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Rank {}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    ordered: BTreeMap<Rank, TaskId>,
    index: HashMap<TaskId, Rank>,
    next_seq: u64,
}

impl QueueInner {
    fn insert(&mut self, task_id: TaskId, rank: Rank) {
        if let Some(old) = self.index.insert(task_id.clone(), rank) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(rank, task_id);
    }
}

/// Score-ordered holding area for tasks awaiting assignment.
///
/// Keyed by task id: a task is in the queue at most once. Every operation
/// takes the internal lock briefly and never waits on anything else.
#[derive(Default)]
pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task_id` with `score`, or re-score it in place if already
    /// queued. Returns `true` for a new entry.
    pub fn enqueue(&self, task_id: TaskId, score: f64) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.get(&task_id).copied() {
            Some(old) => {
                inner.insert(task_id, Rank { score, seq: old.seq });
                false
            }
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.insert(task_id, Rank { score, seq });
                true
            }
        }
    }

    /// Remove and return the highest-scoring entry.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        let (rank, task_id) = inner.ordered.pop_first()?;
        inner.index.remove(&task_id);
        Some(QueueEntry {
            task_id,
            score: rank.score,
            seq: rank.seq,
        })
    }

    /// Put a dequeued entry back exactly where it was.
    pub fn restore(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&entry.task_id) {
            return;
        }
        inner.insert(
            entry.task_id,
            Rank {
                score: entry.score,
                seq: entry.seq,
            },
        );
    }

    /// Re-enqueue after a failed or interrupted run with a decayed score.
    /// Returns the new score.
    pub fn retry(&self, task_id: TaskId, priority: f64, retry_count: u32, retry_penalty: f64) -> f64 {
        let score = retry_score(priority, retry_count, retry_penalty);
        self.enqueue(task_id, score);
        score
    }

    pub fn remove(&self, task_id: &TaskId) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.remove(task_id) {
            Some(rank) => {
                inner.ordered.remove(&rank);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.inner.lock().index.contains_key(task_id)
    }

    pub fn score_of(&self, task_id: &TaskId) -> Option<f64> {
        self.inner.lock().index.get(task_id).map(|r| r.score)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued task ids in dispatch order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.inner.lock().ordered.values().cloned().collect()
    }
}

/// `priority * retry_penalty^retry_count`
pub fn retry_score(priority: f64, retry_count: u32, retry_penalty: f64) -> f64 {
    let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
    priority * retry_penalty.powi(exp)
}

/// What to do with a task whose run just failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Run again; `retry_count` is the count after this failure.
    Requeue { retry_count: u32, score: f64 },
    /// Budget spent; the task fails for good.
    Exhausted,
}

/// Retry budget arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_penalty: f64,
}

impl RetryPolicy {
    pub fn new(retry_penalty: f64) -> Self {
        Self { retry_penalty }
    }

    pub fn decide(&self, priority: f64, retry_count: u32, max_retries: u32) -> RetryDecision {
        if retry_count >= max_retries {
            return RetryDecision::Exhausted;
        }
        let retry_count = retry_count + 1;
        RetryDecision::Requeue {
            retry_count,
            score: retry_score(priority, retry_count, self.retry_penalty),
        }
    }
}
