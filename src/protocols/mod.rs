//! Protocol parsers.
//!
//! The entry point is [`ProtocolParser::parse`]: version dispatch against
//! the configured accept-set, then the per-version decoder. Decode problems
//! never escape as errors; a malformed datagram becomes a single
//! decode-failure event.

pub mod ipfix;
pub mod netflow_v5;
pub mod netflow_v9;

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::event::{LogEvent, ObjectMap, Value};
use crate::fields::FieldCatalog;
use crate::internal_events::DecodeFailure;
use crate::templates::TemplateCache;

/// Tag carried by decode-failure events.
pub const DECODE_FAILURE_TAG: &str = "_netflowdecodefailure";

pub struct ProtocolParser {
    pub(crate) catalog: Arc<FieldCatalog>,
    pub(crate) templates: Arc<TemplateCache>,
    pub(crate) target: String,
    versions: Vec<u16>,
}

impl ProtocolParser {
    pub fn new(
        catalog: Arc<FieldCatalog>,
        templates: Arc<TemplateCache>,
        target: String,
        versions: Vec<u16>,
    ) -> Self {
        Self {
            catalog,
            templates,
            target,
            versions,
        }
    }

    /// Decode one datagram into events.
    pub fn parse(&self, data: &[u8], peer_addr: SocketAddr) -> Vec<LogEvent> {
        if data.len() < 2 {
            return vec![self.decode_failure(
                peer_addr,
                format!("datagram of {} bytes is too short to carry a version", data.len()),
            )];
        }

        let version = u16::from_be_bytes([data[0], data[1]]);
        if !self.versions.contains(&version) {
            return vec![self.decode_failure(
                peer_addr,
                format!("unknown or disabled flow export version {version}"),
            )];
        }

        let result = match version {
            5 => netflow_v5::parse(data, peer_addr, &self.target),
            9 => netflow_v9::parse(data, peer_addr, self),
            10 => ipfix::parse(data, peer_addr, self),
            // The accept-set is validated at startup to a subset of {5, 9, 10}.
            other => Err(format!("version {other} has no decoder")),
        };

        match result {
            Ok(events) => events,
            Err(message) => vec![self.decode_failure(peer_addr, message)],
        }
    }

    /// Compile and cache a fully resolved template.
    pub(crate) fn cache_template(
        &self,
        source_id: u32,
        template_id: u16,
        peer_addr: SocketAddr,
        ops: Vec<crate::fields::DecodeOp>,
        protocol: &'static str,
    ) {
        let field_count = ops.len();
        let key = (source_id, template_id, peer_addr.ip(), peer_addr.port());
        self.templates
            .put(key, crate::templates::Template::new(template_id, ops));
        emit!(crate::internal_events::TemplateReceived {
            template_id,
            field_count,
            peer_addr,
            source_id,
            protocol,
        });
    }

    fn decode_failure(&self, peer_addr: SocketAddr, message: String) -> LogEvent {
        emit!(DecodeFailure {
            peer_addr,
            message: message.clone(),
        });

        let mut event = LogEvent::default();
        event.insert("timestamp", Utc::now());
        event.insert("host", peer_addr.ip().to_string());
        event.insert("message", message);
        event.insert("tags", vec![Value::from(DECODE_FAILURE_TAG)]);
        event
    }
}

/// Render an epoch second + microsecond pair as ISO-8601. Microsecond
/// overflow and underflow normalize into whole seconds.
pub(crate) fn render_iso8601(seconds: i64, micros: i64) -> String {
    use chrono::{SecondsFormat, TimeZone};

    let seconds = seconds + micros.div_euclid(1_000_000);
    let micros = micros.rem_euclid(1_000_000);
    match Utc.timestamp_opt(seconds, micros as u32 * 1000).single() {
        Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        None => format!("{seconds}.{micros:06}"),
    }
}

/// Assemble a flow event: top-level timestamp and host, decoded fields
/// nested under the configured container key.
pub(crate) fn build_event(
    target: &str,
    timestamp: DateTime<Utc>,
    peer_addr: SocketAddr,
    fields: ObjectMap,
) -> LogEvent {
    let mut event = LogEvent::default();
    event.insert("timestamp", timestamp);
    event.insert("host", peer_addr.ip().to_string());
    event.insert(target, fields);
    event
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::templates::TemplateCache;
    use std::time::Duration;

    pub fn parser() -> ProtocolParser {
        parser_with_versions(vec![5, 9, 10])
    }

    pub fn parser_with_versions(versions: Vec<u16>) -> ProtocolParser {
        let catalog = Arc::new(FieldCatalog::load(None, None).unwrap());
        let templates = Arc::new(TemplateCache::new(Duration::from_secs(60)));
        ProtocolParser::new(catalog, templates, "netflow".into(), versions)
    }

    pub fn peer() -> SocketAddr {
        "192.0.2.10:2055".parse().unwrap()
    }

    pub fn container<'a>(event: &'a LogEvent, target: &str) -> &'a ObjectMap {
        event.get(target).unwrap().as_object().unwrap()
    }
}
