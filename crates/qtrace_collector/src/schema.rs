//! Feature/metric schemas and the wire layout of completed records.
//!
//! A record on a per-OU ring is laid out as `u32 ou_index`, then the OU's
//! feature struct, then the metrics struct, all fields native-endian and
//! packed in declaration order. Producer and consumer share the machine, so
//! no endianness conversion is performed anywhere.

use bytes::{Buf, BufMut};

use crate::metrics::{ResourceMetrics, METRICS_WIRE_SIZE};

/// Primitive type of one feature field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int16,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float64,
    /// Pointer-sized value carried for joining/debugging, never interpreted.
    Opaque,
    /// Length of a list-typed field, carried as a signed 32-bit count.
    ListLen,
}

impl FieldKind {
    /// Packed width in bytes on the wire.
    pub fn wire_size(self) -> usize {
        match self {
            FieldKind::Bool => 1,
            FieldKind::Int16 => 2,
            FieldKind::Int32 | FieldKind::UInt32 | FieldKind::ListLen => 4,
            FieldKind::Int64 | FieldKind::UInt64 | FieldKind::Float64 | FieldKind::Opaque => 8,
        }
    }

    /// Whether the field is emitted into training output. Opaque values are
    /// meaningless to downstream consumers and are suppressed.
    pub fn output_visible(self) -> bool {
        !matches!(self, FieldKind::Opaque)
    }
}

/// One decoded feature value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float64(f64),
    Opaque(u64),
    ListLen(i32),
}

impl FieldValue {
    pub fn render(&self) -> String {
        match self {
            FieldValue::Bool(v) => (u8::from(*v)).to_string(),
            FieldValue::Int16(v) => v.to_string(),
            FieldValue::Int32(v) => v.to_string(),
            FieldValue::Int64(v) => v.to_string(),
            FieldValue::UInt32(v) => v.to_string(),
            FieldValue::UInt64(v) => v.to_string(),
            FieldValue::Float64(v) => v.to_string(),
            FieldValue::Opaque(v) => format!("{v:#x}"),
            FieldValue::ListLen(v) => v.to_string(),
        }
    }
}

/// A named, typed feature field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Schema of one operating unit: a stable index, the marker base name, and
/// the ordered feature fields.
#[derive(Debug, Clone)]
pub struct OuSchema {
    pub ou_index: u32,
    pub name: String,
    pub features: Vec<FieldSpec>,
}

impl OuSchema {
    pub fn begin_marker(&self) -> String {
        format!("{}_begin", self.name)
    }

    pub fn end_marker(&self) -> String {
        format!("{}_end", self.name)
    }

    pub fn features_marker(&self) -> String {
        format!("{}_features", self.name)
    }

    pub fn flush_marker(&self) -> String {
        format!("{}_flush", self.name)
    }

    /// Packed size of the feature struct on the wire.
    pub fn feature_wire_size(&self) -> usize {
        self.features.iter().map(|f| f.kind.wire_size()).sum()
    }

    /// Output column names: visible feature fields in declaration order.
    pub fn feature_columns(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| f.kind.output_visible())
            .map(|f| f.name.as_str())
            .collect()
    }
}

/// Metric field names, identical across OUs, in wire order.
pub const METRIC_FIELDS: &[(&str, FieldKind)] = &[
    ("start_time", FieldKind::UInt64),
    ("end_time", FieldKind::UInt64),
    ("elapsed_us", FieldKind::UInt64),
    ("cpu_cycles", FieldKind::UInt64),
    ("instructions", FieldKind::UInt64),
    ("cache_references", FieldKind::UInt64),
    ("cache_misses", FieldKind::UInt64),
    ("ref_cpu_cycles", FieldKind::UInt64),
    ("disk_bytes_read", FieldKind::UInt64),
    ("disk_bytes_written", FieldKind::UInt64),
    ("network_bytes_read", FieldKind::UInt64),
    ("network_bytes_written", FieldKind::UInt64),
    ("cpu_id", FieldKind::UInt32),
    ("pid", FieldKind::UInt32),
];

/// Full collector schema: every OU, ordered by `ou_index`.
#[derive(Debug, Clone, Default)]
pub struct CollectorSchema {
    pub ous: Vec<OuSchema>,
}

impl CollectorSchema {
    pub fn new(ous: Vec<OuSchema>) -> Self {
        Self { ous }
    }

    pub fn ou(&self, ou_index: u32) -> Option<&OuSchema> {
        self.ous.get(ou_index as usize)
    }

    pub fn metric_columns() -> Vec<&'static str> {
        METRIC_FIELDS.iter().map(|(name, _)| *name).collect()
    }
}

/// A completed record decoded from a per-OU ring.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub ou_index: u32,
    pub features: Vec<FieldValue>,
    pub metrics: ResourceMetrics,
}

/// Encode feature values into their packed wire form. Value kinds must match
/// the spec list exactly; the caller owns that invariant.
pub fn encode_features(specs: &[FieldSpec], values: &[FieldValue], buf: &mut Vec<u8>) {
    debug_assert_eq!(specs.len(), values.len());
    for value in values {
        match value {
            FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
            FieldValue::Int16(v) => buf.put_i16_ne(*v),
            FieldValue::Int32(v) => buf.put_i32_ne(*v),
            FieldValue::Int64(v) => buf.put_i64_ne(*v),
            FieldValue::UInt32(v) => buf.put_u32_ne(*v),
            FieldValue::UInt64(v) => buf.put_u64_ne(*v),
            FieldValue::Float64(v) => buf.put_f64_ne(*v),
            FieldValue::Opaque(v) => buf.put_u64_ne(*v),
            FieldValue::ListLen(v) => buf.put_i32_ne(*v),
        }
    }
}

/// Decode a packed feature struct. Returns `None` on a size mismatch.
pub fn decode_features(specs: &[FieldSpec], mut buf: &[u8]) -> Option<Vec<FieldValue>> {
    let expected: usize = specs.iter().map(|f| f.kind.wire_size()).sum();
    if buf.len() != expected {
        return None;
    }
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let value = match spec.kind {
            FieldKind::Bool => FieldValue::Bool(buf.get_u8() != 0),
            FieldKind::Int16 => FieldValue::Int16(buf.get_i16_ne()),
            FieldKind::Int32 => FieldValue::Int32(buf.get_i32_ne()),
            FieldKind::Int64 => FieldValue::Int64(buf.get_i64_ne()),
            FieldKind::UInt32 => FieldValue::UInt32(buf.get_u32_ne()),
            FieldKind::UInt64 => FieldValue::UInt64(buf.get_u64_ne()),
            FieldKind::Float64 => FieldValue::Float64(buf.get_f64_ne()),
            FieldKind::Opaque => FieldValue::Opaque(buf.get_u64_ne()),
            FieldKind::ListLen => FieldValue::ListLen(buf.get_i32_ne()),
        };
        out.push(value);
    }
    Some(out)
}

/// Decode one ring record: `u32 ou_index` ‖ features ‖ metrics.
pub fn decode_record(schema: &CollectorSchema, mut buf: &[u8]) -> Option<DecodedRecord> {
    if buf.len() < 4 {
        return None;
    }
    let ou_index = buf.get_u32_ne();
    let ou = schema.ou(ou_index)?;
    let feature_size = ou.feature_wire_size();
    if buf.len() != feature_size + METRICS_WIRE_SIZE {
        return None;
    }
    let features = decode_features(&ou.features, &buf[..feature_size])?;
    let metrics = ResourceMetrics::decode(&buf[feature_size..])?;
    Some(DecodedRecord {
        ou_index,
        features,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> CollectorSchema {
        CollectorSchema::new(vec![OuSchema {
            ou_index: 0,
            name: "ExecSeqScan".to_string(),
            features: vec![
                FieldSpec::new("query_id", FieldKind::Int64),
                FieldSpec::new("plan_plan_node_id", FieldKind::Int32),
                FieldSpec::new("plan_qual", FieldKind::ListLen),
                FieldSpec::new("plan_lefttree", FieldKind::Opaque),
                FieldSpec::new("plan_parallel_aware", FieldKind::Bool),
            ],
        }])
    }

    #[test]
    fn feature_roundtrip_preserves_order_and_packing() {
        let schema = sample_schema();
        let ou = schema.ou(0).unwrap();
        let values = vec![
            FieldValue::Int64(42),
            FieldValue::Int32(7),
            FieldValue::ListLen(3),
            FieldValue::Opaque(0xdead_beef),
            FieldValue::Bool(true),
        ];
        let mut buf = Vec::new();
        encode_features(&ou.features, &values, &mut buf);
        assert_eq!(buf.len(), ou.feature_wire_size());
        let decoded = decode_features(&ou.features, &buf).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn decode_rejects_truncated_features() {
        let schema = sample_schema();
        let ou = schema.ou(0).unwrap();
        let buf = vec![0u8; ou.feature_wire_size() - 1];
        assert!(decode_features(&ou.features, &buf).is_none());
    }

    #[test]
    fn opaque_fields_are_not_output_columns() {
        let schema = sample_schema();
        let columns = schema.ou(0).unwrap().feature_columns();
        assert_eq!(
            columns,
            vec![
                "query_id",
                "plan_plan_node_id",
                "plan_qual",
                "plan_parallel_aware"
            ]
        );
    }
}
