//! Per-connection TCP statistics tracking.
//!
//! Observation events from an [`source::EventSource`] are folded into a
//! fixed-capacity [`flow::FlowTracker`]. Finished (and, in live mode,
//! changed) flows are pulled out one text line at a time through a
//! [`drain::Reader`].

pub mod agent;
pub mod clock;
pub mod config;
pub mod drain;
pub mod export;
pub mod flow;
pub mod sink;
pub mod source;
pub mod sweeper;
