//! # dlfb-push: Frame Pusher
//!
//! Drives the `dlfb-core` pipeline end to end against the simulated
//! display controller: raw ARGB frames or generated test patterns go in,
//! the device's command stream and a JSON summary come out.
//!
//! Useful for measuring how well a workload compresses, for capturing a
//! reference command stream, and for checking that what the device ends
//! up showing matches the last frame pushed.

pub mod config;
pub mod service;
