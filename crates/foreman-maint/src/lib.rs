//! Background maintenance loops: stale-claim reclamation and event
//! retention. Both run for the life of the executor, never crash the
//! process, and exit promptly on the stop signal.

pub mod events;
pub mod stale;

pub use events::{run_cleanup_cycle, run_event_cleanup_loop};
pub use stale::{StaleCycleStats, run_stale_cleanup_loop, stale_cleanup_cycle};
