//! IPFIX (NetFlow v10): template-driven flowsets with enterprise fields
//! (RFC 7011).
//!
//! Framing mirrors v9 with different set ids (2 templates, 3 options
//! templates) and an explicit message length in the header. Template field
//! declarations carry an enterprise bit in the high bit of the type; when
//! set, a 32-bit enterprise number follows the `(type, length)` pair.

use std::net::SocketAddr;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::event::{LogEvent, ObjectMap, Value};
use crate::internal_events::{
    TemplateCacheMiss, TemplateDiscarded, TemplateLengthMismatch,
};
use crate::templates::TemplateKey;

use super::{build_event, render_iso8601, ProtocolParser};

const HEADER_SIZE: usize = 16;
const TEMPLATE_SET_ID: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
const MIN_DATA_SET_ID: u16 = 256;

/// High bit of a template field type: an enterprise number follows.
const ENTERPRISE_BIT: u16 = 0x8000;

struct Header {
    export_time: u32,
    observation_domain_id: u32,
}

impl Header {
    fn from_bytes(data: &[u8]) -> Result<(Self, usize), String> {
        if data.len() < HEADER_SIZE {
            return Err(format!(
                "IPFIX datagram too short for header: {} bytes, need {}",
                data.len(),
                HEADER_SIZE
            ));
        }

        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < HEADER_SIZE {
            return Err(format!("IPFIX message length {length} below header size"));
        }
        if length > data.len() {
            return Err(format!(
                "IPFIX message length {length} exceeds datagram of {} bytes",
                data.len()
            ));
        }

        let header = Self {
            export_time: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            observation_domain_id: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        };
        Ok((header, length))
    }
}

/// One parsed template field declaration.
struct FieldSpec {
    enterprise_id: u32,
    field_type: u16,
    field_length: u16,
}

/// Read `count` field declarations, honoring the enterprise bit.
fn read_field_specs(
    body: &[u8],
    mut offset: usize,
    count: usize,
    template_id: u16,
) -> Result<(Vec<FieldSpec>, usize), String> {
    let mut specs = Vec::with_capacity(count);
    for _ in 0..count {
        if offset + 4 > body.len() {
            return Err(format!("template {template_id} declaration truncated"));
        }
        let raw_type = be16(&body[offset..]);
        let field_length = be16(&body[offset + 2..]);
        offset += 4;

        let enterprise_id = if raw_type & ENTERPRISE_BIT != 0 {
            if offset + 4 > body.len() {
                return Err(format!(
                    "template {template_id} enterprise number truncated"
                ));
            }
            let id = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]);
            offset += 4;
            id
        } else {
            0
        };

        specs.push(FieldSpec {
            enterprise_id,
            field_type: raw_type & !ENTERPRISE_BIT,
            field_length,
        });
    }
    Ok((specs, offset))
}

pub(crate) fn parse(
    data: &[u8],
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
) -> Result<Vec<LogEvent>, String> {
    let (header, message_len) = Header::from_bytes(data)?;
    let timestamp = Utc
        .timestamp_opt(i64::from(header.export_time), 0)
        .single()
        .ok_or_else(|| format!("IPFIX export time out of range: {}", header.export_time))?;

    let mut events = Vec::new();
    let mut offset = HEADER_SIZE;
    while offset + 4 <= message_len {
        let set_id = be16(&data[offset..]);
        let length = be16(&data[offset + 2..]) as usize;
        if length < 4 {
            return Err(format!("set {set_id} length {length} below minimum"));
        }
        let end = offset + length;
        if end > message_len {
            return Err(format!(
                "set {set_id} extends beyond message: {end} > {message_len}"
            ));
        }

        let body = &data[offset + 4..end];
        match set_id {
            TEMPLATE_SET_ID => parse_template_set(body, &header, peer_addr, parser)?,
            OPTIONS_TEMPLATE_SET_ID => parse_options_template_set(body, &header, peer_addr, parser)?,
            id if id >= MIN_DATA_SET_ID => {
                decode_data_set(body, id, &header, timestamp, peer_addr, parser, &mut events)
            }
            id => debug!(message = "Skipping reserved set id.", set_id = id),
        }

        offset = end;
    }

    Ok(events)
}

fn parse_template_set(
    body: &[u8],
    header: &Header,
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
) -> Result<(), String> {
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let template_id = be16(&body[offset..]);
        let field_count = be16(&body[offset + 2..]) as usize;
        let (specs, next) = read_field_specs(body, offset + 4, field_count, template_id)?;
        offset = next;

        compile_template(
            specs,
            template_id,
            header,
            peer_addr,
            parser,
            "ipfix",
        );
    }
    Ok(())
}

fn parse_options_template_set(
    body: &[u8],
    header: &Header,
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
) -> Result<(), String> {
    let mut offset = 0;
    while offset + 6 <= body.len() {
        let template_id = be16(&body[offset..]);
        let field_count = be16(&body[offset + 2..]) as usize;
        // Scope fields lead the declaration; they resolve through the same
        // catalog as option fields.
        let _scope_field_count = be16(&body[offset + 4..]) as usize;
        let (specs, next) = read_field_specs(body, offset + 6, field_count, template_id)?;
        offset = next;

        compile_template(
            specs,
            template_id,
            header,
            peer_addr,
            parser,
            "ipfix_options",
        );
    }
    Ok(())
}

/// Resolve every declared field and cache the template, or discard it with
/// a warning on the first unresolvable field.
fn compile_template(
    specs: Vec<FieldSpec>,
    template_id: u16,
    header: &Header,
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
    protocol: &'static str,
) {
    let mut ops = Vec::with_capacity(specs.len());
    let mut rejection = None;
    for spec in &specs {
        match parser
            .catalog
            .resolve_ipfix(spec.enterprise_id, spec.field_type, spec.field_length)
        {
            Ok(op) => ops.push(op),
            Err(err) => {
                rejection = Some(err.to_string());
                break;
            }
        }
    }

    if template_id < MIN_DATA_SET_ID {
        rejection.get_or_insert_with(|| format!("template id {template_id} below 256"));
    }
    match rejection {
        Some(reason) => emit!(TemplateDiscarded {
            template_id,
            peer_addr,
            reason,
        }),
        None => parser.cache_template(
            header.observation_domain_id,
            template_id,
            peer_addr,
            ops,
            protocol,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_data_set(
    body: &[u8],
    set_id: u16,
    header: &Header,
    timestamp: DateTime<Utc>,
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
    events: &mut Vec<LogEvent>,
) {
    let key: TemplateKey = (
        header.observation_domain_id,
        set_id,
        peer_addr.ip(),
        peer_addr.port(),
    );
    let Some(template) = parser.templates.get(&key) else {
        emit!(TemplateCacheMiss {
            template_id: set_id,
            source_id: header.observation_domain_id,
            peer_addr,
        });
        return;
    };

    let width = template.width();
    if width == 0 || width > body.len() {
        emit!(TemplateLengthMismatch {
            template_id: set_id,
            record_width: width,
            payload_len: body.len(),
            peer_addr,
        });
        return;
    }

    // Records run to the end of the set; leftovers shorter than one record
    // are padding.
    for record in body.chunks_exact(width) {
        let mut fields = ObjectMap::new();
        fields.insert("version".into(), Value::Integer(10));

        for (name, value) in template.decode(record) {
            let value = match value {
                Value::Integer(raw) => convert_timestamp_field(name, raw),
                other => other,
            };
            fields.insert(name.to_owned(), value);
        }

        events.push(build_event(&parser.target, timestamp, peer_addr, fields));
    }
}

/// Absolute-timestamp information elements become ISO-8601 strings; all
/// other integers pass through unchanged.
fn convert_timestamp_field(name: &str, raw: i64) -> Value {
    let divisor = match name {
        "flowStartSeconds" | "flowEndSeconds" => 1,
        "flowStartMilliseconds" | "flowEndMilliseconds" => 1_000,
        "flowStartMicroseconds" | "flowEndMicroseconds" => 1_000_000,
        "flowStartNanoseconds" | "flowEndNanoseconds" => 1_000_000_000,
        _ => return Value::Integer(raw),
    };

    let seconds = raw.div_euclid(divisor);
    let micros = raw.rem_euclid(divisor) * 1_000_000 / divisor;
    Value::Bytes(render_iso8601(seconds, micros))
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{container, parser, peer};
    use super::*;

    const EXPORT_TIME: u32 = 1_600_000_000;

    /// Assemble a complete IPFIX message from sets, fixing up the length.
    fn ipfix_message(domain_id: u32, sets: &[Vec<u8>]) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_SIZE];
        data[0..2].copy_from_slice(&10u16.to_be_bytes()); // version
        data[4..8].copy_from_slice(&EXPORT_TIME.to_be_bytes());
        data[8..12].copy_from_slice(&7u32.to_be_bytes()); // sequence
        data[12..16].copy_from_slice(&domain_id.to_be_bytes());
        for set in sets {
            data.extend_from_slice(set);
        }
        let total = data.len() as u16;
        data[2..4].copy_from_slice(&total.to_be_bytes());
        data
    }

    /// Template set declaring one template. Fields with a nonzero
    /// enterprise id get the enterprise bit and trailing enterprise number.
    fn template_set(template_id: u16, fields: &[(u32, u16, u16)]) -> Vec<u8> {
        let mut set = Vec::new();
        set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&0u16.to_be_bytes()); // patched below
        set.extend_from_slice(&template_id.to_be_bytes());
        set.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (enterprise_id, field_type, field_length) in fields {
            if *enterprise_id == 0 {
                set.extend_from_slice(&field_type.to_be_bytes());
                set.extend_from_slice(&field_length.to_be_bytes());
            } else {
                set.extend_from_slice(&(field_type | ENTERPRISE_BIT).to_be_bytes());
                set.extend_from_slice(&field_length.to_be_bytes());
                set.extend_from_slice(&enterprise_id.to_be_bytes());
            }
        }
        let total = set.len() as u16;
        set[2..4].copy_from_slice(&total.to_be_bytes());
        set
    }

    fn data_set(set_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut set = Vec::new();
        set.extend_from_slice(&set_id.to_be_bytes());
        set.extend_from_slice(&((4 + payload.len()) as u16).to_be_bytes());
        set.extend_from_slice(payload);
        set
    }

    #[test]
    fn template_then_data_decodes() {
        let parser = parser();

        // sourceIPv4Address + octetDeltaCount.
        let template = template_set(256, &[(0, 8, 4), (0, 1, 4)]);
        let mut payload = Vec::new();
        payload.extend_from_slice(&[192, 168, 1, 1]);
        payload.extend_from_slice(&1500u32.to_be_bytes());
        let data = data_set(256, &payload);

        let events = parser.parse(&ipfix_message(1, &[template, data]), peer());
        assert_eq!(events.len(), 1);

        let netflow = container(&events[0], "netflow");
        assert_eq!(netflow["version"], Value::Integer(10));
        assert_eq!(
            netflow["sourceIPv4Address"],
            Value::Bytes("192.168.1.1".into())
        );
        assert_eq!(netflow["octetDeltaCount"], Value::Integer(1500));

        let ts = events[0].get("timestamp").unwrap().as_timestamp().unwrap();
        assert_eq!(ts.timestamp(), i64::from(EXPORT_TIME));
    }

    #[test]
    fn enterprise_fields_resolve_through_their_namespace() {
        let parser = parser();

        // Netscaler round trip time lives under enterprise 5951.
        let template = template_set(256, &[(5951, 128, 4)]);
        let data = data_set(256, &250u32.to_be_bytes());

        let events = parser.parse(&ipfix_message(1, &[template, data]), peer());
        assert_eq!(events.len(), 1);
        assert_eq!(
            container(&events[0], "netflow")["netscalerRoundTripTime"],
            Value::Integer(250)
        );
    }

    #[test]
    fn variable_length_field_rejects_the_template() {
        let parser = parser();

        let template = template_set(256, &[(0, 8, 4), (0, 1, 0xFFFF)]);
        parser.parse(&ipfix_message(1, &[template]), peer());

        // The template must not be cached: data referencing it misses.
        let data = data_set(256, &[0u8; 8]);
        assert!(parser.parse(&ipfix_message(1, &[data]), peer()).is_empty());
    }

    #[test]
    fn structured_data_types_reject_the_template() {
        let parser = parser();

        for field_type in [291u16, 292, 293] {
            let template = template_set(256, &[(0, field_type, 4)]);
            parser.parse(&ipfix_message(1, &[template]), peer());

            let data = data_set(256, &[0u8; 4]);
            assert!(parser.parse(&ipfix_message(1, &[data]), peer()).is_empty());
        }
    }

    #[test]
    fn observation_domain_scopes_templates() {
        let parser = parser();

        let template = template_set(256, &[(0, 1, 4)]);
        parser.parse(&ipfix_message(1, &[template]), peer());

        let data = data_set(256, &7u32.to_be_bytes());
        assert!(parser
            .parse(&ipfix_message(2, &[data.clone()]), peer())
            .is_empty());
        assert_eq!(parser.parse(&ipfix_message(1, &[data]), peer()).len(), 1);
    }

    #[test]
    fn records_run_to_end_of_set() {
        let parser = parser();

        let template = template_set(256, &[(0, 1, 4)]);
        let mut payload = Vec::new();
        for n in 1u32..=3 {
            payload.extend_from_slice(&n.to_be_bytes());
        }
        payload.extend_from_slice(&[0, 0]); // padding
        let data = data_set(256, &payload);

        let events = parser.parse(&ipfix_message(1, &[template, data]), peer());
        assert_eq!(events.len(), 3);
        assert_eq!(
            container(&events[2], "netflow")["octetDeltaCount"],
            Value::Integer(3)
        );
    }

    #[test]
    fn flow_timestamp_elements_become_iso8601() {
        let parser = parser();

        // flowStartSeconds (u32) + flowStartMilliseconds + flowStartMicroseconds
        // + flowStartNanoseconds (u64 each).
        let template = template_set(
            256,
            &[(0, 150, 4), (0, 152, 8), (0, 154, 8), (0, 156, 8)],
        );
        let mut payload = Vec::new();
        payload.extend_from_slice(&1_600_000_000u32.to_be_bytes());
        payload.extend_from_slice(&1_600_000_000_500u64.to_be_bytes());
        payload.extend_from_slice(&1_600_000_000_500_000u64.to_be_bytes());
        payload.extend_from_slice(&1_600_000_000_500_000_000u64.to_be_bytes());
        let data = data_set(256, &payload);

        let events = parser.parse(&ipfix_message(1, &[template, data]), peer());
        let netflow = container(&events[0], "netflow");
        assert_eq!(
            netflow["flowStartSeconds"],
            Value::Bytes("2020-09-13T12:26:40.000000Z".into())
        );
        assert_eq!(
            netflow["flowStartMilliseconds"],
            Value::Bytes("2020-09-13T12:26:40.500000Z".into())
        );
        assert_eq!(
            netflow["flowStartMicroseconds"],
            Value::Bytes("2020-09-13T12:26:40.500000Z".into())
        );
        assert_eq!(
            netflow["flowStartNanoseconds"],
            Value::Bytes("2020-09-13T12:26:40.500000Z".into())
        );
    }

    #[test]
    fn options_template_fields_resolve_uniformly() {
        let parser = parser();

        // Options template: scope field exportingProcessId, option field
        // octetDeltaCount, both from the IANA catalog.
        let mut set = Vec::new();
        set.extend_from_slice(&OPTIONS_TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&18u16.to_be_bytes()); // length
        set.extend_from_slice(&257u16.to_be_bytes()); // template id
        set.extend_from_slice(&2u16.to_be_bytes()); // field count
        set.extend_from_slice(&1u16.to_be_bytes()); // scope field count
        set.extend_from_slice(&144u16.to_be_bytes()); // exportingProcessId
        set.extend_from_slice(&4u16.to_be_bytes());
        set.extend_from_slice(&1u16.to_be_bytes()); // octetDeltaCount
        set.extend_from_slice(&4u16.to_be_bytes());

        let mut payload = Vec::new();
        payload.extend_from_slice(&9u32.to_be_bytes());
        payload.extend_from_slice(&1500u32.to_be_bytes());
        let data = data_set(257, &payload);

        let events = parser.parse(&ipfix_message(1, &[set, data]), peer());
        assert_eq!(events.len(), 1);
        let netflow = container(&events[0], "netflow");
        assert_eq!(netflow["exportingProcessId"], Value::Integer(9));
        assert_eq!(netflow["octetDeltaCount"], Value::Integer(1500));
    }

    #[test]
    fn header_length_must_cover_the_message() {
        let parser = parser();
        let mut data = ipfix_message(1, &[]);
        data[2..4].copy_from_slice(&64u16.to_be_bytes()); // longer than the datagram

        let events = parser.parse(&data, peer());
        assert_eq!(events.len(), 1);
        assert!(events[0].get("tags").is_some());
    }

    #[test]
    fn sets_beyond_message_length_are_not_read() {
        let parser = parser();

        // A well-formed message followed by trailing garbage the header
        // length excludes.
        let template = template_set(256, &[(0, 1, 4)]);
        let mut data = ipfix_message(1, &[template]);
        data.extend_from_slice(&[0xFF; 6]);

        // The trailing bytes must not fail the parse.
        assert!(parser.parse(&data, peer()).is_empty());
    }
}
