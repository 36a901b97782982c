//! Classifier-program support for the palisade dataplane agent: an eBPF
//! assembler, the per-packet state layout, IP-set lookup-table encoding,
//! the policy program builder, and attached-program bookkeeping.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod asm;
pub mod attach;
pub mod ipsets;
pub mod polprog;
pub mod state;
