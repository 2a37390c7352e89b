//! A small runtime core: a zero-copy segmented byte buffer, a
//! collision-resistant chained hash table, and a poll-based event-loop
//! scheduler with timers, signals, and in-process named events.
//!
//! The four pieces are independent — nothing in [`buffer`] or
//! [`hash_table`] depends on [`scheduler`] — but they're meant to be used
//! together: a protocol implementation typically parses incoming bytes
//! out of a [`buffer::Buffer`], indexes live connections in a
//! [`hash_table::HashTable`], and drives both from callbacks registered
//! on a [`scheduler::Schedule`].
//!
//! ```no_run
//! use rt_core::config::ScheduleConfig;
//! use rt_core::scheduler::Schedule;
//! use rt_core::task::Deadline;
//!
//! let schedule = Schedule::new(ScheduleConfig::default()).unwrap();
//! schedule
//!     .task_add_timeout(Deadline::after(1, 0), Box::new(|s| {
//!         s.stop();
//!     }))
//!     .unwrap();
//! schedule.run().unwrap();
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod hash_table;
pub mod scheduler;
pub mod task;
pub mod tls;
