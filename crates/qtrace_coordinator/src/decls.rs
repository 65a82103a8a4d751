//! Operating-unit schema extraction from the server's C declarations.
//!
//! The server publishes its plan-node structs as a C header; this module
//! parses those declarations, expands embedded structs field by field with
//! name prefixes, and builds the per-OU feature schemas. This is the only
//! place that knows the OU catalog.

use std::collections::BTreeMap;

use anyhow::Context;
use qtrace_collector::schema::{CollectorSchema, FieldKind, FieldSpec, OuSchema};

/// The OU catalog: executor function emitting the markers, and the struct
/// its features marker carries. Position is the stable `ou_index`.
pub const OU_DEFS: [(&str, &str); 15] = [
    ("ExecAgg", "Agg"),
    ("ExecBitmapHeapScan", "BitmapHeapScan"),
    ("ExecBitmapIndexScan", "BitmapIndexScan"),
    ("ExecHash", "Hash"),
    ("ExecHashJoinImpl", "HashJoin"),
    ("ExecIndexOnlyScan", "IndexOnlyScan"),
    ("ExecIndexScan", "IndexScan"),
    ("ExecLimit", "Limit"),
    ("ExecLockRows", "LockRows"),
    ("ExecModifyTable", "ModifyTable"),
    ("ExecNestLoop", "NestLoop"),
    ("ExecResult", "Result"),
    ("ExecSeqScan", "SeqScan"),
    ("ExecSort", "Sort"),
    ("ExecSubPlan", "SubPlan"),
];

/// One parsed struct field: a scalar with a mapped primitive type, or an
/// embedded record to expand.
#[derive(Debug, Clone, PartialEq)]
pub enum CField {
    Scalar { name: String, kind: FieldKind },
    Record { name: String, type_name: String },
}

#[derive(Debug, Clone, Default)]
pub struct CStruct {
    pub fields: Vec<CField>,
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out.lines()
        .map(|line| line.split("//").next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_field(raw: &str, known: &BTreeMap<String, CStruct>) -> anyhow::Result<CField> {
    // Normalize pointers so `*name` tokenizes separately.
    let spaced = raw.replace('*', " * ");
    let tokens: Vec<&str> = spaced.split_whitespace().collect();
    if tokens.len() < 2 {
        anyhow::bail!("unparsable field declaration: {raw:?}");
    }
    let name = tokens[tokens.len() - 1].to_string();
    let type_tokens: Vec<&str> = tokens[..tokens.len() - 1]
        .iter()
        .copied()
        .filter(|token| *token != "struct")
        .collect();

    if type_tokens.contains(&"*") {
        let base = type_tokens.first().copied().unwrap_or("");
        let kind = if base == "List" {
            FieldKind::ListLen
        } else {
            FieldKind::Opaque
        };
        return Ok(CField::Scalar { name, kind });
    }

    let joined = type_tokens.join(" ");
    let kind = match joined.as_str() {
        "bool" => Some(FieldKind::Bool),
        "short" => Some(FieldKind::Int16),
        "int" => Some(FieldKind::Int32),
        "long" | "long long" => Some(FieldKind::Int64),
        "unsigned int" => Some(FieldKind::UInt32),
        "unsigned long" | "unsigned long long" => Some(FieldKind::UInt64),
        "double" => Some(FieldKind::Float64),
        _ => None,
    };
    if let Some(kind) = kind {
        return Ok(CField::Scalar { name, kind });
    }
    if known.contains_key(&joined) {
        return Ok(CField::Record {
            name,
            type_name: joined,
        });
    }
    anyhow::bail!("no type mapping for {joined:?} (field {name:?})");
}

/// Parse `typedef struct Name { ... } Name;` declarations, in order.
pub fn parse_declarations(source: &str) -> anyhow::Result<BTreeMap<String, CStruct>> {
    let source = strip_comments(source);
    let mut structs = BTreeMap::new();
    let mut rest = source.as_str();
    while let Some(start) = rest.find("typedef struct") {
        rest = &rest[start + "typedef struct".len()..];
        let open = rest
            .find('{')
            .context("struct declaration without a body")?;
        let name = rest[..open].trim().to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            anyhow::bail!("malformed struct name {name:?}");
        }
        let close = rest.find('}').context("struct body without a closer")?;
        let body = &rest[open + 1..close];
        let mut fields = Vec::new();
        for raw in body.split(';') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            fields.push(parse_field(raw, &structs)?);
        }
        if fields.is_empty() {
            anyhow::bail!("struct {name} declares no fields");
        }
        structs.insert(name, CStruct { fields });
        rest = &rest[close + 1..];
    }
    if structs.is_empty() {
        anyhow::bail!("no struct declarations found");
    }
    Ok(structs)
}

/// Expand a struct into a flat field list, prefixing embedded-record field
/// names the way the declaration parser always has.
pub fn expand_struct(
    structs: &BTreeMap<String, CStruct>,
    name: &str,
    prefix: &str,
) -> anyhow::Result<Vec<FieldSpec>> {
    let decl = structs
        .get(name)
        .with_context(|| format!("no type info for struct {name}"))?;
    let mut out = Vec::new();
    for field in &decl.fields {
        match field {
            CField::Scalar { name, kind } => {
                out.push(FieldSpec::new(format!("{prefix}{name}"), *kind));
            }
            CField::Record { name, type_name } => {
                out.extend(expand_struct(
                    structs,
                    type_name,
                    &format!("{prefix}{name}_"),
                )?);
            }
        }
    }
    Ok(out)
}

/// Build the full collector schema from the server's declarations.
pub fn build_schema(source: &str) -> anyhow::Result<CollectorSchema> {
    let structs = parse_declarations(source)?;
    let mut ous = Vec::with_capacity(OU_DEFS.len());
    for (index, (function, struct_name)) in OU_DEFS.iter().enumerate() {
        let mut features = vec![FieldSpec::new("query_id", FieldKind::Int64)];
        features.extend(
            expand_struct(&structs, struct_name, &format!("{struct_name}_"))
                .with_context(|| format!("expand features for {function}"))?,
        );
        features.push(FieldSpec::new("left_child_plan_node_id", FieldKind::Int32));
        features.push(FieldSpec::new("right_child_plan_node_id", FieldKind::Int32));
        features.push(FieldSpec::new("statement_start_ts", FieldKind::Int64));
        ous.push(OuSchema {
            ou_index: index as u32,
            name: (*function).to_string(),
            features,
        });
    }
    Ok(CollectorSchema::new(ous))
}
