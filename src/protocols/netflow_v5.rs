//! NetFlow v5: fixed 24-byte header, fixed 48-byte flow records, no
//! templates.

use std::net::{Ipv4Addr, SocketAddr};

use chrono::{TimeZone, Utc};

use crate::event::{LogEvent, ObjectMap, Value};

use super::build_event;

const HEADER_SIZE: usize = 24;
const RECORD_SIZE: usize = 48;

/// RFC ceiling on records per v5 PDU.
const MAX_RECORD_COUNT: u16 = 30;

struct Header {
    count: u16,
    uptime_ms: u32,
    unix_secs: u32,
    unix_nsecs: u32,
    flow_seq_num: u32,
    engine_type: u8,
    engine_id: u8,
    sampling_algorithm: u8,
    sampling_interval: u16,
}

impl Header {
    fn from_bytes(data: &[u8]) -> Result<Self, String> {
        if data.len() < HEADER_SIZE {
            return Err(format!(
                "v5 datagram too short for header: {} bytes, need {}",
                data.len(),
                HEADER_SIZE
            ));
        }

        let count = u16::from_be_bytes([data[2], data[3]]);
        if count == 0 || count > MAX_RECORD_COUNT {
            return Err(format!("v5 record count {count} outside 1..={MAX_RECORD_COUNT}"));
        }

        let sampling = u16::from_be_bytes([data[22], data[23]]);

        Ok(Self {
            count,
            uptime_ms: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            unix_secs: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            unix_nsecs: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            flow_seq_num: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            engine_type: data[20],
            engine_id: data[21],
            sampling_algorithm: (sampling >> 14) as u8,
            sampling_interval: sampling & 0x3FFF,
        })
    }
}

pub(crate) fn parse(
    data: &[u8],
    peer_addr: SocketAddr,
    target: &str,
) -> Result<Vec<LogEvent>, String> {
    let header = Header::from_bytes(data)?;

    let needed = HEADER_SIZE + header.count as usize * RECORD_SIZE;
    if data.len() < needed {
        return Err(format!(
            "v5 datagram truncated: {} bytes, need {} for {} records",
            data.len(),
            needed,
            header.count
        ));
    }

    let timestamp = Utc
        .timestamp_opt(i64::from(header.unix_secs), header.unix_nsecs)
        .single()
        .ok_or_else(|| format!("v5 header timestamp out of range: {}", header.unix_secs))?;

    let mut events = Vec::with_capacity(header.count as usize);
    for index in 0..header.count as usize {
        let start = HEADER_SIZE + index * RECORD_SIZE;
        let record = &data[start..start + RECORD_SIZE];
        let fields = decode_record(record, &header);
        events.push(build_event(target, timestamp, peer_addr, fields));
    }

    Ok(events)
}

fn decode_record(record: &[u8], header: &Header) -> ObjectMap {
    let mut fields = ObjectMap::new();

    fields.insert("version".into(), Value::Integer(5));
    fields.insert("flow_seq_num".into(), header.flow_seq_num.into());
    fields.insert("engine_type".into(), header.engine_type.into());
    fields.insert("engine_id".into(), header.engine_id.into());
    fields.insert("sampling_algorithm".into(), header.sampling_algorithm.into());
    fields.insert("sampling_interval".into(), header.sampling_interval.into());

    fields.insert("ipv4_src_addr".into(), ipv4(&record[0..4]));
    fields.insert("ipv4_dst_addr".into(), ipv4(&record[4..8]));
    fields.insert("ipv4_next_hop".into(), ipv4(&record[8..12]));
    fields.insert("input_snmp".into(), be16(&record[12..14]).into());
    fields.insert("output_snmp".into(), be16(&record[14..16]).into());
    fields.insert("in_pkts".into(), be32(&record[16..20]).into());
    fields.insert("in_bytes".into(), be32(&record[20..24]).into());
    fields.insert(
        "first_switched".into(),
        switched_timestamp(header, be32(&record[24..28])),
    );
    fields.insert(
        "last_switched".into(),
        switched_timestamp(header, be32(&record[28..32])),
    );
    fields.insert("l4_src_port".into(), be16(&record[32..34]).into());
    fields.insert("l4_dst_port".into(), be16(&record[34..36]).into());
    fields.insert("tcp_flags".into(), record[37].into());
    fields.insert("protocol".into(), record[38].into());
    fields.insert("src_tos".into(), record[39].into());
    fields.insert("src_as".into(), be16(&record[40..42]).into());
    fields.insert("dst_as".into(), be16(&record[42..44]).into());
    fields.insert("src_mask".into(), record[44].into());
    fields.insert("dst_mask".into(), record[45].into());

    fields
}

/// Turn an uptime-relative `*_switched` value into an absolute ISO-8601
/// string, carrying nanosecond precision from the header.
fn switched_timestamp(header: &Header, value: u32) -> Value {
    let millis = i64::from(header.uptime_ms) - i64::from(value);
    let mut seconds = i64::from(header.unix_secs) - millis.div_euclid(1000);
    let mut micros = i64::from(header.unix_nsecs) / 1000 - millis.rem_euclid(1000);
    if micros < 0 {
        seconds -= 1;
        micros += 1_000_000;
    }
    Value::Bytes(super::render_iso8601(seconds, micros))
}

fn ipv4(bytes: &[u8]) -> Value {
    Value::Bytes(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string())
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
