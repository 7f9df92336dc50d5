//! Per-user FIFO of queued storage jobs.
//!
//! Each user owns a deque ordered by `(created_at, job_id)`. Only the head
//! of an idle user's deque is eligible, and eligible heads live in a single
//! ordered set so picking the next job never scans users.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::ffs::types::{JobId, UserId};

type Slot = (i64, JobId);

#[derive(Debug, Default)]
pub struct UserFifo {
    queues: HashMap<UserId, VecDeque<Slot>>,
    busy: HashSet<UserId>,
    ready: BTreeSet<(i64, JobId, UserId)>,
}

impl UserFifo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, user: &UserId, created_at: i64, id: JobId) {
        let old_head = self.head(user);
        let queue = self.queues.entry(user.clone()).or_default();
        let slot = (created_at, id);
        let pos = queue.partition_point(|s| *s < slot);
        queue.insert(pos, slot);
        self.refresh_head(user, old_head);
    }

    /// Drops a queued job. Returns false if it wasn't queued.
    pub fn remove(&mut self, user: &UserId, id: &JobId) -> bool {
        let old_head = self.head(user);
        let Some(queue) = self.queues.get_mut(user) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|(_, j)| j == id) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.queues.remove(user);
        }
        self.refresh_head(user, old_head);
        true
    }

    /// Takes the oldest eligible job and marks its user busy. Returns the
    /// job's creation time so a failed dispatch can [`UserFifo::restore`] it.
    pub fn pop(&mut self) -> Option<(UserId, i64, JobId)> {
        let (created_at, id, user) = self.ready.pop_first()?;
        if let Some(queue) = self.queues.get_mut(&user) {
            queue.pop_front();
            if queue.is_empty() {
                self.queues.remove(&user);
            }
        }
        self.busy.insert(user.clone());
        Some((user, created_at, id))
    }

    /// Undoes a [`UserFifo::pop`] whose job couldn't be dispatched.
    pub fn restore(&mut self, user: &UserId, created_at: i64, id: JobId) {
        self.push(user, created_at, id);
        self.release(user);
    }

    /// Marks `user` as executing without popping, used when rebuilding state.
    pub fn occupy(&mut self, user: &UserId) {
        let old_head = self.head(user);
        self.busy.insert(user.clone());
        self.refresh_head(user, old_head);
    }

    /// The user's executing job finished; its next job becomes eligible.
    pub fn release(&mut self, user: &UserId) {
        let old_head = self.head(user);
        self.busy.remove(user);
        self.refresh_head(user, old_head);
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// All queued job ids, oldest first.
    pub fn ids(&self) -> Vec<JobId> {
        let mut slots: Vec<&Slot> = self.queues.values().flatten().collect();
        slots.sort();
        slots.into_iter().map(|(_, id)| id.clone()).collect()
    }

    fn head(&self, user: &UserId) -> Option<Slot> {
        self.queues.get(user).and_then(|q| q.front().cloned())
    }

    fn refresh_head(&mut self, user: &UserId, old_head: Option<Slot>) {
        if let Some((ts, id)) = old_head {
            self.ready.remove(&(ts, id, user.clone()));
        }
        if self.busy.contains(user) {
            return;
        }
        if let Some((ts, id)) = self.head(user) {
            self.ready.insert((ts, id, user.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(u: &str) -> UserId {
        UserId::from(u)
    }

    #[test]
    fn one_job_per_user_at_a_time() {
        let mut fifo = UserFifo::new();
        fifo.push(&user("u1"), 1, JobId::from("a"));
        fifo.push(&user("u1"), 2, JobId::from("b"));
        fifo.push(&user("u2"), 3, JobId::from("c"));

        assert_eq!(fifo.pop(), Some((user("u1"), 1, JobId::from("a"))));
        assert_eq!(fifo.pop(), Some((user("u2"), 3, JobId::from("c"))));
        assert_eq!(fifo.pop(), None);

        fifo.release(&user("u1"));
        assert_eq!(fifo.pop(), Some((user("u1"), 2, JobId::from("b"))));
        assert!(fifo.is_empty());
    }

    #[test]
    fn ties_break_by_job_id() {
        let mut fifo = UserFifo::new();
        fifo.push(&user("u2"), 5, JobId::from("b"));
        fifo.push(&user("u1"), 5, JobId::from("a"));
        assert_eq!(fifo.pop().map(|(_, _, id)| id), Some(JobId::from("a")));
    }

    #[test]
    fn out_of_order_push_keeps_created_order() {
        let mut fifo = UserFifo::new();
        fifo.push(&user("u1"), 10, JobId::from("late"));
        fifo.push(&user("u1"), 1, JobId::from("early"));
        assert_eq!(fifo.ids(), vec![JobId::from("early"), JobId::from("late")]);
        assert_eq!(fifo.pop().map(|(_, _, id)| id), Some(JobId::from("early")));
    }

    #[test]
    fn removing_head_promotes_next() {
        let mut fifo = UserFifo::new();
        fifo.push(&user("u1"), 1, JobId::from("a"));
        fifo.push(&user("u1"), 2, JobId::from("b"));
        assert!(fifo.remove(&user("u1"), &JobId::from("a")));
        assert!(!fifo.remove(&user("u1"), &JobId::from("a")));
        assert_eq!(fifo.len(), 1);
        assert_eq!(fifo.pop().map(|(_, _, id)| id), Some(JobId::from("b")));
    }

    #[test]
    fn restored_job_is_dispatched_again() {
        let mut fifo = UserFifo::new();
        fifo.push(&user("u1"), 1, JobId::from("a"));
        fifo.push(&user("u1"), 2, JobId::from("b"));
        let (u, ts, id) = fifo.pop().unwrap();
        fifo.restore(&u, ts, id);
        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.pop(), Some((user("u1"), 1, JobId::from("a"))));
    }

    #[test]
    fn occupied_user_waits() {
        let mut fifo = UserFifo::new();
        fifo.occupy(&user("u1"));
        fifo.push(&user("u1"), 1, JobId::from("a"));
        assert_eq!(fifo.pop(), None);
        fifo.release(&user("u1"));
        assert!(fifo.pop().is_some());
    }
}
