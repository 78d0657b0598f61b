//! Compiled templates and the per-exporter template cache.
//!
//! A template is compiled once, when its declaration arrives, into a flat
//! array of decode instructions. Decoding a record is a single pass over
//! that array. The cache is keyed by the full exporter identity so template
//! ids from different exporters or observation domains never collide.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::event::Value;
use crate::fields::DecodeOp;
use crate::internal_events::TemplatesExpired;

/// `(source_id, template_id, exporter_host, exporter_port)`.
///
/// `source_id` is the v9 Source ID or the IPFIX Observation Domain ID.
pub type TemplateKey = (u32, u16, IpAddr, u16);

/// A compiled record layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    id: u16,
    ops: Vec<DecodeOp>,
    width: usize,
}

impl Template {
    pub fn new(id: u16, ops: Vec<DecodeOp>) -> Self {
        let width = ops.iter().map(DecodeOp::width).sum();
        Self { id, ops, width }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Total record width in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn field_count(&self) -> usize {
        self.ops.len()
    }

    /// Decode one record of exactly `width()` bytes into named values,
    /// preserving declaration order. Skip fields consume bytes and emit
    /// nothing.
    pub fn decode(&self, record: &[u8]) -> Vec<(&str, Value)> {
        debug_assert_eq!(record.len(), self.width);

        let mut out = Vec::with_capacity(self.ops.len());
        let mut offset = 0;
        for op in &self.ops {
            let bytes = &record[offset..offset + op.width()];
            offset += op.width();
            match op {
                DecodeOp::Uint { name, .. } => {
                    out.push((name.as_str(), Value::Integer(be_uint(bytes) as i64)));
                }
                DecodeOp::Ipv4 { name } => {
                    let addr = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                    out.push((name.as_str(), Value::Bytes(addr.to_string())));
                }
                DecodeOp::Ipv6 { name } => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(bytes);
                    out.push((name.as_str(), Value::Bytes(Ipv6Addr::from(octets).to_string())));
                }
                DecodeOp::Mac { name } => {
                    let mac = format!(
                        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
                    );
                    out.push((name.as_str(), Value::Bytes(mac)));
                }
                DecodeOp::Str { name, .. } => {
                    let trimmed = trim_padding(bytes);
                    out.push((
                        name.as_str(),
                        Value::Bytes(String::from_utf8_lossy(trimmed).into_owned()),
                    ));
                }
                DecodeOp::Skip { .. } => {}
            }
        }
        out
    }
}

/// Big-endian unsigned integer of 1 to 8 bytes.
fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Fixed-length strings are padded with NULs or spaces on the wire.
fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0 && *b != b' ')
        .map_or(0, |pos| pos + 1);
    &bytes[..end]
}

struct CacheEntry {
    template: Arc<Template>,
    refreshed_at: Instant,
}

/// Shared template cache with a sliding TTL.
///
/// Every successful `get` refreshes the entry's window; expired entries are
/// dropped lazily on `get` and swept opportunistically on `put`. No
/// background timer.
pub struct TemplateCache {
    ttl: Duration,
    entries: Mutex<HashMap<TemplateKey, CacheEntry>>,
}

impl TemplateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace a template, sweeping expired entries while the
    /// lock is held.
    pub fn put(&self, key: TemplateKey, template: Template) {
        let now = Instant::now();
        let expired = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| now.duration_since(entry.refreshed_at) <= self.ttl);
            let expired = before - entries.len();
            entries.insert(
                key,
                CacheEntry {
                    template: Arc::new(template),
                    refreshed_at: now,
                },
            );
            expired
        };
        if expired > 0 {
            emit!(TemplatesExpired { count: expired });
        }
    }

    /// Fetch a template, refreshing its TTL window on hit.
    pub fn get(&self, key: &TemplateKey) -> Option<Arc<Template>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.refreshed_at) > self.ttl => {
                entries.remove(key);
                None
            }
            Some(entry) => {
                entry.refreshed_at = now;
                Some(Arc::clone(&entry.template))
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::thread::sleep;

    fn uint(name: &str, width: usize) -> DecodeOp {
        DecodeOp::Uint {
            name: name.into(),
            width,
        }
    }

    fn key_for(addr: &str, source_id: u32, template_id: u16) -> TemplateKey {
        let addr: SocketAddr = addr.parse().unwrap();
        (source_id, template_id, addr.ip(), addr.port())
    }

    #[test]
    fn decodes_mixed_field_types() {
        let template = Template::new(
            256,
            vec![
                uint("in_bytes", 4),
                DecodeOp::Ipv4 {
                    name: "ipv4_src_addr".into(),
                },
                DecodeOp::Mac {
                    name: "in_src_mac".into(),
                },
                DecodeOp::Skip { length: 2 },
                DecodeOp::Str {
                    name: "if_name".into(),
                    length: 8,
                },
            ],
        );
        assert_eq!(template.width(), 4 + 4 + 6 + 2 + 8);

        let mut record = Vec::new();
        record.extend_from_slice(&100u32.to_be_bytes());
        record.extend_from_slice(&[192, 168, 1, 1]);
        record.extend_from_slice(&[0x00, 0x1b, 0x21, 0x3c, 0x9d, 0xf8]);
        record.extend_from_slice(&[0xde, 0xad]);
        record.extend_from_slice(b"eth0\0\0\0\0");

        let fields = template.decode(&record);
        assert_eq!(
            fields,
            vec![
                ("in_bytes", Value::Integer(100)),
                ("ipv4_src_addr", Value::Bytes("192.168.1.1".into())),
                ("in_src_mac", Value::Bytes("00:1b:21:3c:9d:f8".into())),
                ("if_name", Value::Bytes("eth0".into())),
            ]
        );
    }

    #[test]
    fn decodes_narrowed_integers() {
        let template = Template::new(256, vec![uint("in_bytes", 3), uint("out_bytes", 5)]);
        let record = [0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x02];
        let fields = template.decode(&record);
        assert_eq!(fields[0].1, Value::Integer(0x010001));
        assert_eq!(fields[1].1, Value::Integer(2));
    }

    #[test]
    fn string_padding_is_trimmed() {
        let template = Template::new(
            256,
            vec![DecodeOp::Str {
                name: "sampler_name".into(),
                length: 6,
            }],
        );
        assert_eq!(
            template.decode(b"lan 1 "),
            vec![("sampler_name", Value::Bytes("lan 1".into()))]
        );
        assert_eq!(
            template.decode(b"\0\0\0\0\0\0"),
            vec![("sampler_name", Value::Bytes(String::new()))]
        );
    }

    #[test]
    fn get_refreshes_the_ttl_window() {
        let cache = TemplateCache::new(Duration::from_millis(400));
        let key = key_for("10.0.0.1:2055", 1, 256);
        cache.put(key, Template::new(256, vec![uint("in_bytes", 4)]));

        // Keep touching the entry at intervals shorter than the TTL; the
        // sliding window must keep it alive well past the original expiry.
        for _ in 0..4 {
            sleep(Duration::from_millis(150));
            assert!(cache.get(&key).is_some());
        }

        sleep(Duration::from_millis(600));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn put_sweeps_expired_entries() {
        let cache = TemplateCache::new(Duration::from_millis(50));
        let stale = key_for("10.0.0.1:2055", 1, 256);
        cache.put(stale, Template::new(256, vec![uint("in_bytes", 4)]));

        sleep(Duration::from_millis(150));
        let fresh = key_for("10.0.0.2:2055", 1, 256);
        cache.put(fresh, Template::new(256, vec![uint("in_pkts", 4)]));

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fresh).is_some());
    }

    #[test]
    fn exporter_identity_isolates_templates() {
        let cache = TemplateCache::new(Duration::from_secs(60));
        let a = key_for("10.0.0.1:2055", 1, 256);
        let b = key_for("10.0.0.2:2055", 1, 256);
        let c = key_for("10.0.0.1:2055", 2, 256);

        cache.put(a, Template::new(256, vec![uint("in_bytes", 4)]));
        cache.put(b, Template::new(256, vec![uint("in_pkts", 4)]));
        cache.put(c, Template::new(256, vec![uint("flows", 4)]));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&a).unwrap().field_count(), 1);
        let record = 7u32.to_be_bytes();
        assert_eq!(
            cache.get(&b).unwrap().decode(&record)[0].0,
            "in_pkts"
        );
        assert_eq!(cache.get(&c).unwrap().decode(&record)[0].0, "flows");
    }

    #[test]
    fn redefinition_replaces_the_entry() {
        let cache = TemplateCache::new(Duration::from_secs(60));
        let key = key_for("10.0.0.1:2055", 1, 256);
        cache.put(key, Template::new(256, vec![uint("in_bytes", 4)]));
        cache.put(
            key,
            Template::new(256, vec![uint("in_bytes", 4), uint("in_pkts", 4)]),
        );

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key).unwrap().width(), 8);
    }
}
