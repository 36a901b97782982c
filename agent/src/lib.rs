//! Per-node dataplane agent for the cluster policy engine.
//!
//! The library wires the indexing pipeline to the dataplane: resource
//! updates and interface events drive a single-threaded loop that
//! renders classifier programs or rule chains and hands them to the
//! effectors.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod args;
pub mod daemon;
pub mod effector;
pub mod ipcmd;
