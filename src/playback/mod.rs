pub mod mixer;
pub mod queue;
pub mod scheduler;

pub use mixer::TickMixer;
pub use queue::{PlaybackQueue, QueueEntry, QueueItem, SharedQueue};
pub use scheduler::{FrameSink, PlaybackScheduler, SchedulerHandle, SchedulerState};
