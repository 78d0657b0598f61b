//! NetFlow v9: template-driven flowsets (RFC 3954).
//!
//! Flowset id 0 carries templates, id 1 options templates, ids 256 and up
//! data records laid out by a previously seen template.

use std::net::SocketAddr;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::event::{LogEvent, ObjectMap, Value};
use crate::fields::DecodeOp;
use crate::internal_events::{
    TemplateCacheMiss, TemplateDiscarded, TemplateLengthMismatch,
};
use crate::templates::TemplateKey;

use super::{build_event, render_iso8601, ProtocolParser};

const HEADER_SIZE: usize = 20;
const TEMPLATE_FLOWSET_ID: u16 = 0;
const OPTIONS_TEMPLATE_FLOWSET_ID: u16 = 1;
const MIN_DATA_FLOWSET_ID: u16 = 256;

/// Trailing bytes tolerated at the end of a data flowset.
const MAX_PADDING: usize = 3;

struct Header {
    uptime_ms: u32,
    unix_secs: u32,
    flow_seq_num: u32,
    source_id: u32,
}

impl Header {
    fn from_bytes(data: &[u8]) -> Result<Self, String> {
        if data.len() < HEADER_SIZE {
            return Err(format!(
                "v9 datagram too short for header: {} bytes, need {}",
                data.len(),
                HEADER_SIZE
            ));
        }
        Ok(Self {
            uptime_ms: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            unix_secs: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flow_seq_num: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            source_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        })
    }
}

pub(crate) fn parse(
    data: &[u8],
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
) -> Result<Vec<LogEvent>, String> {
    let header = Header::from_bytes(data)?;
    let timestamp = Utc
        .timestamp_opt(i64::from(header.unix_secs), 0)
        .single()
        .ok_or_else(|| format!("v9 header timestamp out of range: {}", header.unix_secs))?;

    let mut events = Vec::new();
    let mut offset = HEADER_SIZE;
    while offset + 4 <= data.len() {
        let flowset_id = be16(&data[offset..]);
        let length = be16(&data[offset + 2..]) as usize;
        if length < 4 {
            return Err(format!("flowset {flowset_id} length {length} below minimum"));
        }
        let end = offset + length;
        if end > data.len() {
            return Err(format!(
                "flowset {flowset_id} extends beyond datagram: {end} > {}",
                data.len()
            ));
        }

        let body = &data[offset + 4..end];
        match flowset_id {
            TEMPLATE_FLOWSET_ID => parse_template_flowset(body, &header, peer_addr, parser)?,
            OPTIONS_TEMPLATE_FLOWSET_ID => {
                parse_options_template_flowset(body, &header, peer_addr, parser)?
            }
            id if id >= MIN_DATA_FLOWSET_ID => {
                decode_data_flowset(body, id, &header, timestamp, peer_addr, parser, &mut events)
            }
            id => debug!(message = "Skipping reserved flowset id.", flowset_id = id),
        }

        offset = end;
    }

    Ok(events)
}

fn parse_template_flowset(
    body: &[u8],
    header: &Header,
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
) -> Result<(), String> {
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let template_id = be16(&body[offset..]);
        let field_count = be16(&body[offset + 2..]) as usize;
        offset += 4;

        let decl_end = offset + field_count * 4;
        if decl_end > body.len() {
            return Err(format!("template {template_id} declaration truncated"));
        }

        let mut ops = Vec::with_capacity(field_count);
        let mut rejection = None;
        for decl in body[offset..decl_end].chunks_exact(4) {
            let field_type = be16(&decl[0..]);
            let field_length = be16(&decl[2..]);
            match parser.catalog.resolve_netflow(field_type, field_length) {
                Ok(op) => ops.push(op),
                Err(err) => {
                    rejection = Some(err.to_string());
                    break;
                }
            }
        }
        offset = decl_end;

        if template_id < MIN_DATA_FLOWSET_ID {
            rejection.get_or_insert_with(|| format!("template id {template_id} below 256"));
        }
        match rejection {
            Some(reason) => emit!(TemplateDiscarded {
                template_id,
                peer_addr,
                reason,
            }),
            None => parser.cache_template(
                header.source_id,
                template_id,
                peer_addr,
                ops,
                "netflow_v9",
            ),
        }
    }
    Ok(())
}

/// Scope field types are a fixed enumeration, not catalog entries.
fn scope_field_name(field_type: u16) -> Option<&'static str> {
    match field_type {
        1 => Some("scope_system"),
        2 => Some("scope_interface"),
        3 => Some("scope_line_card"),
        4 => Some("scope_netflow_cache"),
        5 => Some("scope_template"),
        _ => None,
    }
}

fn parse_options_template_flowset(
    body: &[u8],
    header: &Header,
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
) -> Result<(), String> {
    let mut offset = 0;
    // Flowsets may carry trailing padding shorter than another header.
    while offset + 6 <= body.len() {
        let template_id = be16(&body[offset..]);
        let scope_len = be16(&body[offset + 2..]) as usize;
        let option_len = be16(&body[offset + 4..]) as usize;
        offset += 6;

        if scope_len % 4 != 0 || option_len % 4 != 0 {
            return Err(format!(
                "options template {template_id} scope/option lengths not a multiple of 4"
            ));
        }
        let decl_end = offset + scope_len + option_len;
        if decl_end > body.len() {
            return Err(format!("options template {template_id} declaration truncated"));
        }

        let mut ops = Vec::with_capacity((scope_len + option_len) / 4);
        let mut rejection = None;

        for decl in body[offset..offset + scope_len].chunks_exact(4) {
            let field_type = be16(&decl[0..]);
            let field_length = be16(&decl[2..]) as usize;
            match scope_field_name(field_type) {
                Some(name) if (1..=8).contains(&field_length) => ops.push(DecodeOp::Uint {
                    name: name.to_owned(),
                    width: field_length,
                }),
                Some(name) => {
                    rejection =
                        Some(format!("scope field {name} has unusable length {field_length}"));
                    break;
                }
                None => {
                    rejection = Some(format!("unknown scope field type {field_type}"));
                    break;
                }
            }
        }
        if rejection.is_none() {
            for decl in body[offset + scope_len..decl_end].chunks_exact(4) {
                let field_type = be16(&decl[0..]);
                let field_length = be16(&decl[2..]);
                match parser.catalog.resolve_netflow(field_type, field_length) {
                    Ok(op) => ops.push(op),
                    Err(err) => {
                        rejection = Some(err.to_string());
                        break;
                    }
                }
            }
        }
        offset = decl_end;

        if template_id < MIN_DATA_FLOWSET_ID {
            rejection.get_or_insert_with(|| format!("template id {template_id} below 256"));
        }
        match rejection {
            Some(reason) => emit!(TemplateDiscarded {
                template_id,
                peer_addr,
                reason,
            }),
            None => parser.cache_template(
                header.source_id,
                template_id,
                peer_addr,
                ops,
                "netflow_v9_options",
            ),
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn decode_data_flowset(
    body: &[u8],
    flowset_id: u16,
    header: &Header,
    timestamp: DateTime<Utc>,
    peer_addr: SocketAddr,
    parser: &ProtocolParser,
    events: &mut Vec<LogEvent>,
) {
    let key: TemplateKey = (header.source_id, flowset_id, peer_addr.ip(), peer_addr.port());
    let Some(template) = parser.templates.get(&key) else {
        emit!(TemplateCacheMiss {
            template_id: flowset_id,
            source_id: header.source_id,
            peer_addr,
        });
        return;
    };

    let width = template.width();
    if width == 0 || width > body.len() || body.len() % width > MAX_PADDING {
        emit!(TemplateLengthMismatch {
            template_id: flowset_id,
            record_width: width,
            payload_len: body.len(),
            peer_addr,
        });
        return;
    }

    for record in body.chunks_exact(width) {
        let mut fields = ObjectMap::new();
        fields.insert("version".into(), Value::Integer(9));
        fields.insert("flow_seq_num".into(), header.flow_seq_num.into());
        fields.insert("flowset_id".into(), flowset_id.into());

        for (name, value) in template.decode(record) {
            let value = match value {
                Value::Integer(raw) if name.ends_with("_switched") => {
                    switched_timestamp(header, raw)
                }
                other => other,
            };
            fields.insert(name.to_owned(), value);
        }

        events.push(build_event(&parser.target, timestamp, peer_addr, fields));
    }
}

/// Uptime-relative `*_switched` value to an absolute ISO-8601 string.
///
/// v9 exports carry no sub-second export time; the historical microsecond
/// term `1_000_000 - millis % 1000` is kept as-is, overflow normalizing
/// into the seconds.
fn switched_timestamp(header: &Header, value: i64) -> Value {
    let millis = i64::from(header.uptime_ms) - value;
    let seconds = i64::from(header.unix_secs) - millis.div_euclid(1000);
    let micros = 1_000_000 - millis.rem_euclid(1000);
    Value::Bytes(render_iso8601(seconds, micros))
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}
