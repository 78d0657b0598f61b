//! Field catalogs and the field resolver.
//!
//! The catalogs map wire-level field types to decoding descriptors. The
//! NetFlow v9 catalog is keyed by field type alone; the IPFIX catalog is
//! keyed by `(enterprise_id, field_type)` with enterprise 0 being the IANA
//! standard set. Defaults are compiled in from `definitions/` and can be
//! augmented or overridden by user-supplied YAML files.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use snafu::Snafu;

const DEFAULT_NETFLOW_DEFINITIONS: &str = include_str!("../definitions/netflow.yaml");
const DEFAULT_IPFIX_DEFINITIONS: &str = include_str!("../definitions/ipfix.yaml");

/// IPFIX structured data types (RFC 6313). Templates using these are rejected.
const STRUCTURED_DATA_TYPES: [u16; 3] = [291, 292, 293];

/// The variable-length marker in an IPFIX template declaration.
const VARIABLE_LENGTH: u16 = 0xFFFF;

#[derive(Debug, Snafu)]
pub enum CatalogError {
    #[snafu(display("field definitions file {path} does not exist"))]
    Missing { path: String },

    #[snafu(display("unable to read field definitions from {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("field definitions in {path} are not valid YAML: {source}"))]
    Syntax {
        path: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("invalid field definition in {path}: {message}"))]
    Entry { path: String, message: String },
}

/// Semantic value types a catalog entry may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Uint8,
    Uint16,
    Uint24,
    Uint32,
    Uint64,
    Ip4Addr,
    Ip6Addr,
    MacAddr,
    String,
    Skip,
}

impl SemanticType {
    /// Nominal encoded width in bytes; 0 for the length-driven kinds.
    fn nominal_width(self) -> usize {
        match self {
            SemanticType::Uint8 => 1,
            SemanticType::Uint16 => 2,
            SemanticType::Uint24 => 3,
            SemanticType::Uint32 => 4,
            SemanticType::Uint64 => 8,
            SemanticType::Ip4Addr => 4,
            SemanticType::Ip6Addr => 16,
            SemanticType::MacAddr => 6,
            SemanticType::String | SemanticType::Skip => 0,
        }
    }
}

/// A catalog entry: how to decode one field type, before the template
/// declares its length.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDef {
    Typed { kind: SemanticType, name: String },
    /// Old-style numeric entry: an unsigned integer whose width comes from
    /// the template, falling back to `default_width` when declared as 0.
    Legacy { default_width: u16, name: String },
    Skip,
}

/// A fully resolved decoding instruction for one template field.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOp {
    Uint { name: String, width: usize },
    Ipv4 { name: String },
    Ipv6 { name: String },
    Mac { name: String },
    Str { name: String, length: usize },
    Skip { length: usize },
}

impl DecodeOp {
    /// Encoded width in bytes consumed from the record.
    pub fn width(&self) -> usize {
        match self {
            DecodeOp::Uint { width, .. } => *width,
            DecodeOp::Ipv4 { .. } => 4,
            DecodeOp::Ipv6 { .. } => 16,
            DecodeOp::Mac { .. } => 6,
            DecodeOp::Str { length, .. } => *length,
            DecodeOp::Skip { length } => *length,
        }
    }
}

/// Why a template field could not be resolved. Any of these discards the
/// whole containing template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    UnknownField { enterprise_id: u32, field_type: u16 },
    UnsupportedLength { field_type: u16, length: u16 },
    VariableLength { field_type: u16 },
    StructuredData { field_type: u16 },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::UnknownField {
                enterprise_id,
                field_type,
            } => write!(
                f,
                "unsupported field type {field_type} (enterprise {enterprise_id})"
            ),
            ResolveError::UnsupportedLength { field_type, length } => write!(
                f,
                "field type {field_type} has unusable declared length {length}"
            ),
            ResolveError::VariableLength { field_type } => write!(
                f,
                "field type {field_type} uses variable-length encoding"
            ),
            ResolveError::StructuredData { field_type } => write!(
                f,
                "field type {field_type} is an IPFIX structured data type"
            ),
        }
    }
}

/// Declarative YAML forms a catalog entry can take.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Legacy(u16, String),
    Typed(SemanticType, String),
    Marker((SemanticType,)),
}

impl RawEntry {
    fn into_def(self, path: &str) -> Result<FieldDef, CatalogError> {
        match self {
            RawEntry::Legacy(default_width, name) => {
                if default_width == 0 || default_width > 8 {
                    return Err(CatalogError::Entry {
                        path: path.to_owned(),
                        message: format!(
                            "default width {default_width} for {name} is outside 1..=8"
                        ),
                    });
                }
                Ok(FieldDef::Legacy {
                    default_width,
                    name,
                })
            }
            RawEntry::Typed(kind, name) => {
                if kind == SemanticType::Skip {
                    return Err(CatalogError::Entry {
                        path: path.to_owned(),
                        message: format!("skip entry for {name} must not carry a name"),
                    });
                }
                Ok(FieldDef::Typed { kind, name })
            }
            RawEntry::Marker((kind,)) => {
                if kind != SemanticType::Skip {
                    return Err(CatalogError::Entry {
                        path: path.to_owned(),
                        message: "single-element entries must be [skip]".to_owned(),
                    });
                }
                Ok(FieldDef::Skip)
            }
        }
    }
}

/// The loaded, immutable catalogs.
#[derive(Debug, Clone)]
pub struct FieldCatalog {
    netflow: HashMap<u16, FieldDef>,
    ipfix: HashMap<(u32, u16), FieldDef>,
}

impl FieldCatalog {
    /// Load the embedded defaults, then apply any user overrides. Keys in an
    /// override file replace keys in the default catalog.
    pub fn load(
        netflow_override: Option<&Path>,
        ipfix_override: Option<&Path>,
    ) -> Result<Self, CatalogError> {
        let mut netflow = parse_netflow(DEFAULT_NETFLOW_DEFINITIONS, "<embedded netflow.yaml>")?;
        let mut ipfix = parse_ipfix(DEFAULT_IPFIX_DEFINITIONS, "<embedded ipfix.yaml>")?;

        if let Some(path) = netflow_override {
            let contents = read_override(path)?;
            netflow.extend(parse_netflow(&contents, &path.display().to_string())?);
        }
        if let Some(path) = ipfix_override {
            let contents = read_override(path)?;
            ipfix.extend(parse_ipfix(&contents, &path.display().to_string())?);
        }

        Ok(Self { netflow, ipfix })
    }

    /// Resolve a NetFlow v9 template field declaration.
    pub fn resolve_netflow(&self, field_type: u16, length: u16) -> Result<DecodeOp, ResolveError> {
        let def = self
            .netflow
            .get(&field_type)
            .ok_or(ResolveError::UnknownField {
                enterprise_id: 0,
                field_type,
            })?;
        resolve_def(def, field_type, length)
    }

    /// Resolve an IPFIX template field declaration.
    pub fn resolve_ipfix(
        &self,
        enterprise_id: u32,
        field_type: u16,
        length: u16,
    ) -> Result<DecodeOp, ResolveError> {
        if length == VARIABLE_LENGTH {
            return Err(ResolveError::VariableLength { field_type });
        }
        if enterprise_id == 0 && STRUCTURED_DATA_TYPES.contains(&field_type) {
            return Err(ResolveError::StructuredData { field_type });
        }
        let def = self
            .ipfix
            .get(&(enterprise_id, field_type))
            .ok_or(ResolveError::UnknownField {
                enterprise_id,
                field_type,
            })?;
        resolve_def(def, field_type, length)
    }

    #[cfg(test)]
    pub(crate) fn netflow_len(&self) -> usize {
        self.netflow.len()
    }
}

fn read_override(path: &Path) -> Result<String, CatalogError> {
    if !path.exists() {
        return Err(CatalogError::Missing {
            path: path.display().to_string(),
        });
    }
    std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse_netflow(contents: &str, path: &str) -> Result<HashMap<u16, FieldDef>, CatalogError> {
    let raw: HashMap<u16, RawEntry> =
        serde_yaml::from_str(contents).map_err(|source| CatalogError::Syntax {
            path: path.to_owned(),
            source,
        })?;
    raw.into_iter()
        .map(|(field_type, entry)| Ok((field_type, entry.into_def(path)?)))
        .collect()
}

fn parse_ipfix(contents: &str, path: &str) -> Result<HashMap<(u32, u16), FieldDef>, CatalogError> {
    let raw: HashMap<u32, HashMap<u16, RawEntry>> =
        serde_yaml::from_str(contents).map_err(|source| CatalogError::Syntax {
            path: path.to_owned(),
            source,
        })?;
    let mut defs = HashMap::new();
    for (enterprise_id, entries) in raw {
        for (field_type, entry) in entries {
            defs.insert((enterprise_id, field_type), entry.into_def(path)?);
        }
    }
    Ok(defs)
}

fn resolve_def(def: &FieldDef, field_type: u16, length: u16) -> Result<DecodeOp, ResolveError> {
    match def {
        FieldDef::Skip => Ok(DecodeOp::Skip {
            length: length as usize,
        }),
        FieldDef::Legacy {
            default_width,
            name,
        } => {
            let width = if length == 0 { *default_width } else { length };
            if width == 0 || width > 8 {
                return Err(ResolveError::UnsupportedLength {
                    field_type,
                    length,
                });
            }
            Ok(DecodeOp::Uint {
                name: name.clone(),
                width: width as usize,
            })
        }
        FieldDef::Typed { kind, name } => match kind {
            SemanticType::Uint8
            | SemanticType::Uint16
            | SemanticType::Uint24
            | SemanticType::Uint32
            | SemanticType::Uint64 => {
                // Exporters may narrow or widen integer fields, e.g. a
                // nominally u32 counter exported as u24.
                let width = if length == 0 {
                    kind.nominal_width()
                } else {
                    length as usize
                };
                if width == 0 || width > 8 {
                    return Err(ResolveError::UnsupportedLength {
                        field_type,
                        length,
                    });
                }
                Ok(DecodeOp::Uint {
                    name: name.clone(),
                    width,
                })
            }
            SemanticType::Ip4Addr => {
                expect_width(field_type, length, 4)?;
                Ok(DecodeOp::Ipv4 { name: name.clone() })
            }
            SemanticType::Ip6Addr => {
                expect_width(field_type, length, 16)?;
                Ok(DecodeOp::Ipv6 { name: name.clone() })
            }
            SemanticType::MacAddr => {
                expect_width(field_type, length, 6)?;
                Ok(DecodeOp::Mac { name: name.clone() })
            }
            SemanticType::String => Ok(DecodeOp::Str {
                name: name.clone(),
                length: length as usize,
            }),
            SemanticType::Skip => Ok(DecodeOp::Skip {
                length: length as usize,
            }),
        },
    }
}

fn expect_width(field_type: u16, length: u16, expected: u16) -> Result<(), ResolveError> {
    if length == expected {
        Ok(())
    } else {
        Err(ResolveError::UnsupportedLength { field_type, length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn catalog() -> FieldCatalog {
        FieldCatalog::load(None, None).unwrap()
    }

    #[test]
    fn embedded_defaults_load() {
        let catalog = catalog();
        assert!(catalog.netflow_len() > 50);

        // Spot checks against the shipped definitions.
        assert_eq!(
            catalog.resolve_netflow(1, 4).unwrap(),
            DecodeOp::Uint {
                name: "in_bytes".into(),
                width: 4
            }
        );
        assert_eq!(
            catalog.resolve_netflow(8, 4).unwrap(),
            DecodeOp::Ipv4 {
                name: "ipv4_src_addr".into()
            }
        );
        assert_eq!(
            catalog.resolve_ipfix(0, 8, 4).unwrap(),
            DecodeOp::Ipv4 {
                name: "sourceIPv4Address".into()
            }
        );
    }

    #[test]
    fn integer_fields_follow_declared_width() {
        let catalog = catalog();
        // in_bytes is nominally u32; a u24 export narrows it.
        assert_eq!(
            catalog.resolve_netflow(1, 3).unwrap(),
            DecodeOp::Uint {
                name: "in_bytes".into(),
                width: 3
            }
        );
        // And a u64 export widens it.
        assert_eq!(
            catalog.resolve_netflow(1, 8).unwrap(),
            DecodeOp::Uint {
                name: "in_bytes".into(),
                width: 8
            }
        );
    }

    #[test]
    fn legacy_entries_use_default_width_when_zero() {
        let defs: HashMap<u16, FieldDef> =
            parse_netflow("42: [2, engine_field]\n", "<test>").unwrap();
        assert_eq!(
            resolve_def(&defs[&42], 42, 0).unwrap(),
            DecodeOp::Uint {
                name: "engine_field".into(),
                width: 2
            }
        );
        assert_eq!(
            resolve_def(&defs[&42], 42, 4).unwrap(),
            DecodeOp::Uint {
                name: "engine_field".into(),
                width: 4
            }
        );
    }

    #[test]
    fn skip_marker_consumes_declared_length() {
        let defs = parse_netflow("43: [skip]\n", "<test>").unwrap();
        assert_eq!(
            resolve_def(&defs[&43], 43, 7).unwrap(),
            DecodeOp::Skip { length: 7 }
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve_netflow(65000, 4),
            Err(ResolveError::UnknownField {
                enterprise_id: 0,
                field_type: 65000
            })
        );
    }

    #[test]
    fn ipfix_variable_length_is_rejected() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve_ipfix(0, 8, 0xFFFF),
            Err(ResolveError::VariableLength { field_type: 8 })
        );
    }

    #[test]
    fn ipfix_structured_data_is_rejected() {
        let catalog = catalog();
        for field_type in [291, 292, 293] {
            assert_eq!(
                catalog.resolve_ipfix(0, field_type, 4),
                Err(ResolveError::StructuredData { field_type })
            );
        }
    }

    #[test]
    fn override_replaces_default_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1: [uint64, renamed_bytes]").unwrap();

        let catalog = FieldCatalog::load(Some(file.path()), None).unwrap();
        assert_eq!(
            catalog.resolve_netflow(1, 8).unwrap(),
            DecodeOp::Uint {
                name: "renamed_bytes".into(),
                width: 8
            }
        );
        // Untouched keys keep their default definitions.
        assert_eq!(
            catalog.resolve_netflow(2, 4).unwrap(),
            DecodeOp::Uint {
                name: "in_pkts".into(),
                width: 4
            }
        );
    }

    #[test]
    fn missing_override_is_an_error() {
        let err = FieldCatalog::load(Some(Path::new("/nonexistent/defs.yaml")), None).unwrap_err();
        assert!(matches!(err, CatalogError::Missing { .. }));
    }

    #[test]
    fn malformed_catalog_is_a_syntax_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not yaml: [[[").unwrap();
        let err = FieldCatalog::load(Some(file.path()), None).unwrap_err();
        assert!(matches!(err, CatalogError::Syntax { .. }));
    }
}
