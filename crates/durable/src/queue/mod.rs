//! Task queue
//!
//! Work reaches workers through a [`TaskQueue`]: activity attempts, due
//! timers and run deadlines are enqueued with a not-before time, leased on
//! dequeue, and acked once processed. Unacked leases expire and the item is
//! redelivered, which is how worker crashes are detected.

mod item;
mod memory;
mod task_queue;

pub use item::{ActivityTask, DeadLetter, LeasedItem, QueueStats, WorkItem};
pub use memory::{InMemoryTaskQueue, InMemoryTaskQueueConfig};
pub use task_queue::{QueueError, TaskQueue};
