//! End-to-end persistence scenarios: single-node round trips, rotation
//! replay, crash windows, concurrent churn, and reader-pinned reclamation.

mod crash_windows;
mod round_trips;
mod stress;
