//! Integration tests for the harvester
//!
//! These tests drive the coordinator end to end against a scripted remote API
//! and an in-memory data sink.

mod harvest_tests;
mod support;
