//! Program the Linux kernel's event histogram and synthetic-event
//! facilities from user space.
//!
//! The kernel can aggregate trace events into per-key histograms and
//! fabricate *synthetic events* that fire when a start/end pair of raw
//! events is matched at runtime. Both are driven by a text protocol
//! written into trigger files under the tracing directory. This crate
//! builds those command strings from typed descriptors and installs
//! them, including the `!`-prefixed lines that undo a setup exactly.
//!
//! ## Example
//!
//! A histogram of `sched_switch` by previous priority, hottest PIDs
//! first:
//!
//! ```rust
//! use tracefs_hist::event::{Event, EventDb, Field};
//! use tracefs_hist::hist::{Hist, HistCommand, KeyType, SortDirection, HITCOUNT};
//!
//! let mut db = EventDb::new();
//! db.add(Event::new(
//!     "sched",
//!     "sched_switch",
//!     vec![
//!         Field {
//!             name: "prev_prio".into(),
//!             size: 4,
//!             signed: true,
//!             array: false,
//!             dynamic: false,
//!         },
//!         Field {
//!             name: "common_pid".into(),
//!             size: 4,
//!             signed: true,
//!             array: false,
//!             dynamic: false,
//!         },
//!     ],
//! ));
//!
//! let mut hist = Hist::new(&db, "sched", "sched_switch", "prev_prio", KeyType::Normal).unwrap();
//! hist.add_key("common_pid", KeyType::Hex);
//! hist.add_sort_keys(&["common_pid", HITCOUNT]).unwrap();
//! hist.set_sort_direction(HITCOUNT, SortDirection::Descending).unwrap();
//!
//! assert_eq!(
//!     hist.command_line(HistCommand::Start),
//!     "hist:keys=prev_prio,common_pid.hex:sort=common_pid,hitcount.descending",
//! );
//! ```
//!
//! On a live system the metadata comes from the tracing directory
//! (`EventDb::load`) and `hist.start(&instance)` writes the line into
//! the event's `trigger` file. See [`synth::Synth`] for the two-event
//! synthetic side.
//!
//! ## Permission
//!
//! The tracing directory is normally writable only by root. Mount
//! points probed are `/sys/kernel/tracing`, then
//! `/sys/kernel/debug/tracing`.

pub mod error;
pub mod event;
pub mod filter;
pub mod hist;
pub mod instance;
pub mod synth;
