//! Ingestion and indexing for the palisade dataplane agent.
//!
//! Converts the inbound resource stream into the derived state the
//! renderers consume: IP-set membership (reference counted), service-set
//! contributions from endpoint slices, and per-endpoint resolved policy.
//! All state here is owned by the single dispatch task; nothing in this
//! crate locks or spawns.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod dispatcher;
mod ipset;
mod resolver;
mod service;

pub use self::{
    dispatcher::{DataplaneDelta, Dispatcher},
    ipset::{IpSetIndex, MemberChange},
    resolver::PolicyResolver,
    service::ServiceIndex,
};
