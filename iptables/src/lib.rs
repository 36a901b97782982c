//! Rule-chain rendering for hosts without the classifier VM.
//!
//! Policies render to named chains whose rules carry stable hash
//! fingerprints in comments; the delta engine diffs desired state
//! against the installed hash sequences and emits a minimal edit
//! script for the chain effector.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod action;
mod delta;
mod match_criteria;
mod render;
mod rules;

pub use self::{
    action::Action,
    delta::{chain_delta, table_delta, ChainOp},
    match_criteria::MatchCriteria,
    render::{Config, Renderer},
    rules::{hashes_from_rendered, Chain, Rule, HASH_COMMENT_PREFIX, HASH_LENGTH},
};
