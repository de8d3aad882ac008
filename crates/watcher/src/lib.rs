//! Output-directory watcher.
//!
//! A single loop polls the active job's render directory, indexes produced
//! artifact files, dispatches bounded-concurrency verification workers for
//! new arrivals, and -- once the render phase is done and every artifact is
//! accounted for -- runs the one assembly task that composites the verified
//! layers into the final deliverable.
//!
//! The artifact index has exactly one owner: worker completions are fed
//! back over a channel and applied by the loop itself, never from worker
//! tasks.

pub mod assemble;
pub mod index;
pub mod pool;
pub mod verify;
pub mod watch;

pub use watch::{OutputWatcher, WatcherCommand, WatcherEvent, WatcherHandle};
