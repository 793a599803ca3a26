use crate::task::Task;

use std::collections::VecDeque;
use std::fmt;

/// One contribution to the source: a single submitted task, or the lazy
/// expansion of a `map` call.
enum Segment<A, R> {
  Single(Task<A, R>),
  Lazy(Box<dyn Iterator<Item = Task<A, R>> + Send>),
}

/// An append-only, order-preserving sequence of pending tasks.
///
/// Segments are drained front to back. A lazy segment is only advanced when a
/// task is requested, so its input is never realized ahead of admission.
pub(crate) struct TaskSource<A, R> {
  segments: VecDeque<Segment<A, R>>,
  pulled: usize,
}

impl<A, R> TaskSource<A, R> {
  pub(crate) fn new() -> Self {
    Self {
      segments: VecDeque::new(),
      pulled: 0,
    }
  }

  pub(crate) fn push(&mut self, task: Task<A, R>) {
    self.segments.push_back(Segment::Single(task));
  }

  pub(crate) fn extend_lazy<I>(&mut self, tasks: I)
  where
    I: Iterator<Item = Task<A, R>> + Send + 'static,
  {
    self.segments.push_back(Segment::Lazy(Box::new(tasks)));
  }

  /// Pulls the next pending task, advancing at most one lazy segment per
  /// exhausted predecessor.
  pub(crate) fn next_task(&mut self) -> Option<Task<A, R>> {
    loop {
      match self.segments.front_mut()? {
        Segment::Single(_) => {
          if let Some(Segment::Single(task)) = self.segments.pop_front() {
            self.pulled += 1;
            return Some(task);
          }
        }
        Segment::Lazy(tasks) => match tasks.next() {
          Some(task) => {
            self.pulled += 1;
            return Some(task);
          }
          None => {
            self.segments.pop_front();
          }
        },
      }
    }
  }

  /// Drops everything still pending. Returns the number of segments discarded.
  pub(crate) fn clear(&mut self) -> usize {
    let discarded = self.segments.len();
    self.segments.clear();
    discarded
  }

  pub(crate) fn pending_segments(&self) -> usize {
    self.segments.len()
  }

  pub(crate) fn pulled(&self) -> usize {
    self.pulled
  }
}

impl<A, R> fmt::Debug for TaskSource<A, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskSource")
      .field("pending_segments", &self.segments.len())
      .field("pulled", &self.pulled)
      .finish()
  }
}
