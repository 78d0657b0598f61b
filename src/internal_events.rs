//! Internal instrumentation events.
//!
//! Every operationally interesting occurrence is a struct implementing
//! [`InternalEvent`]; emitting it logs through `tracing` and bumps the
//! matching counters. Call sites go through [`emit!`] so the telemetry
//! surface stays greppable.

use std::net::SocketAddr;

use metrics::counter;
use tracing::{debug, error, trace, warn};

pub trait InternalEvent {
    fn emit(self);
}

#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::internal_events::InternalEvent::emit($event)
    };
}

#[derive(Debug)]
pub struct SocketBindError<'a> {
    pub address: SocketAddr,
    pub error: &'a std::io::Error,
}

impl InternalEvent for SocketBindError<'_> {
    fn emit(self) {
        error!(
            message = "Unable to bind UDP socket.",
            address = %self.address,
            error = %self.error,
        );
        counter!("component_errors_total", 1, "error_code" => "socket_bind");
    }
}

#[derive(Debug)]
pub struct SocketReceiveError {
    pub error: std::io::Error,
}

impl InternalEvent for SocketReceiveError {
    fn emit(self) {
        error!(message = "Error receiving datagram.", error = %self.error);
        counter!("component_errors_total", 1, "error_code" => "socket_receive");
    }
}

#[derive(Debug)]
pub struct BytesReceived {
    pub byte_size: usize,
    pub peer_addr: SocketAddr,
}

impl InternalEvent for BytesReceived {
    fn emit(self) {
        trace!(
            message = "Bytes received.",
            byte_size = self.byte_size,
            peer_addr = %self.peer_addr,
            protocol = "udp",
        );
        counter!("component_received_bytes_total", self.byte_size as u64, "protocol" => "udp");
    }
}

#[derive(Debug)]
pub struct EventsReceived {
    pub count: usize,
    pub peer_addr: SocketAddr,
}

impl InternalEvent for EventsReceived {
    fn emit(self) {
        trace!(
            message = "Events received.",
            count = self.count,
            peer_addr = %self.peer_addr,
        );
        counter!("component_received_events_total", self.count as u64);
    }
}

/// The work queue was full and a datagram was dropped on the floor.
#[derive(Debug)]
pub struct DatagramDropped {
    pub peer_addr: SocketAddr,
    pub reason: &'static str,
}

impl InternalEvent for DatagramDropped {
    fn emit(self) {
        warn!(
            message = "Datagram dropped.",
            peer_addr = %self.peer_addr,
            reason = self.reason,
        );
        counter!("component_discarded_events_total", 1, "reason" => self.reason);
    }
}

#[derive(Debug)]
pub struct DecodeFailure {
    pub peer_addr: SocketAddr,
    pub message: String,
}

impl InternalEvent for DecodeFailure {
    fn emit(self) {
        warn!(
            message = "Failed to decode datagram.",
            peer_addr = %self.peer_addr,
            error = %self.message,
        );
        counter!("component_errors_total", 1, "error_code" => "decode");
    }
}

#[derive(Debug)]
pub struct TemplateReceived {
    pub template_id: u16,
    pub field_count: usize,
    pub peer_addr: SocketAddr,
    pub source_id: u32,
    pub protocol: &'static str,
}

impl InternalEvent for TemplateReceived {
    fn emit(self) {
        debug!(
            message = "Template received.",
            template_id = self.template_id,
            field_count = self.field_count,
            peer_addr = %self.peer_addr,
            source_id = self.source_id,
            protocol = self.protocol,
        );
        counter!("templates_received_total", 1, "protocol" => self.protocol);
    }
}

/// A template declaration could not be compiled and was not cached.
#[derive(Debug)]
pub struct TemplateDiscarded {
    pub template_id: u16,
    pub peer_addr: SocketAddr,
    pub reason: String,
}

impl InternalEvent for TemplateDiscarded {
    fn emit(self) {
        warn!(
            message = "Template discarded.",
            template_id = self.template_id,
            peer_addr = %self.peer_addr,
            reason = %self.reason,
        );
        counter!("templates_discarded_total", 1);
    }
}

/// Data flowset referencing a template we have not seen (yet).
#[derive(Debug)]
pub struct TemplateCacheMiss {
    pub template_id: u16,
    pub source_id: u32,
    pub peer_addr: SocketAddr,
}

impl InternalEvent for TemplateCacheMiss {
    fn emit(self) {
        warn!(
            message = "No template for data flowset, skipping.",
            template_id = self.template_id,
            source_id = self.source_id,
            peer_addr = %self.peer_addr,
        );
        counter!("template_cache_misses_total", 1);
    }
}

#[derive(Debug)]
pub struct TemplateLengthMismatch {
    pub template_id: u16,
    pub record_width: usize,
    pub payload_len: usize,
    pub peer_addr: SocketAddr,
}

impl InternalEvent for TemplateLengthMismatch {
    fn emit(self) {
        warn!(
            message = "Data flowset length does not match template width, skipping.",
            template_id = self.template_id,
            record_width = self.record_width,
            payload_len = self.payload_len,
            peer_addr = %self.peer_addr,
        );
        counter!("component_errors_total", 1, "error_code" => "length_mismatch");
    }
}

#[derive(Debug)]
pub struct TemplatesExpired {
    pub count: usize,
}

impl InternalEvent for TemplatesExpired {
    fn emit(self) {
        debug!(message = "Expired templates swept from cache.", count = self.count);
        counter!("templates_expired_total", self.count as u64);
    }
}
