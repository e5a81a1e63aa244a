//! Test modules for the mqueue crate

mod consumer_tests;
