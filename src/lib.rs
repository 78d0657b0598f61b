//! flowcap - a NetFlow v5/v9 and IPFIX collector.
//!
//! Listens for flow export datagrams over UDP, decodes them with a
//! template-driven decoder, and hands structured events to a sink.

pub mod config;
pub mod event;
#[macro_use]
pub mod internal_events;
pub mod fields;
pub mod protocols;
pub mod server;
pub mod sinks;
pub mod templates;

pub use config::CollectorConfig;
pub use server::FlowCollector;
