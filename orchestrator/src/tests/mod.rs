//! Test modules for the orchestrator crate

mod support;

mod modules_tests;
mod runner_tests;
mod scheduler_tests;
