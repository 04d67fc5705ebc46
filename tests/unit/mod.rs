//! Integration test tree, compiled as a single test target.

mod common;
mod engine_scenarios;
mod invariant_props;
mod recovery_tests;
mod sequencer_thread;
