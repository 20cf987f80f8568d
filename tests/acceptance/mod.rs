//! Acceptance tests run against all strategies.
//!
//! Each test iterates [`common::for_each_strategy`], so a failure message
//! always names the strategy it occurred under.

mod common;
mod config_test;
mod event_test;
mod fault_test;
mod lifecycle_test;
mod lockstep_test;
