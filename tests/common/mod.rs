//! Common test utilities for dirsync integration tests
//!
//! This module provides:
//! - `TestTree` builder for laying out directory trees to replicate
//! - `start_server` / `RawClient` for driving the wire protocol over loopback
//! - Polling helpers for asserting on eventually-consistent mirrors

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod harness;
pub mod test_tree;

pub use harness::{start_server, start_server_with, wait_until, RawClient, RunningServer, WAIT};
pub use test_tree::TestTree;
