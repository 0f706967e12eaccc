//! Type registry and type integration.
//!
//! [`TypeRegistry`] maps an [`Oid`] to a [`TypeInfo`]. Builtin types are always known, user
//! defined types (composites, enums, domains and their arrays) are loaded from the catalog the
//! first time a connection sees an oid it does not know.
//!
//! Integration with external types:
//!
//! - [`serde`]'s `Deserialize` and `Serialize` via `Json`, requires `json` feature
//! - [`time`][::time]'s `Date`, `PrimitiveDateTime`, `OffsetDateTime`, requires `time` feature
use std::collections::HashMap;

use crate::{
    postgres::{Oid, oid},
    row::Row,
};

pub(crate) mod value;

pub use value::{ArrayDim, Value};

#[cfg(feature = "json")]
mod json;
#[cfg(feature = "json")]
pub use json::Json;

#[cfg(feature = "time")]
mod time;

/// Rust side representation of a scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Bytea,
    Uuid,
    Json,
    Jsonb,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Oid,
    Char,
}

/// Shape of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Scalar(HostType),
    /// Array, the element is looked up in the registry by oid.
    Array { element: Oid },
    /// Composite attributes in catalog order.
    Composite { attributes: Vec<(String, Oid)> },
    /// Enum labels in server sort order.
    Enum { labels: Vec<String> },
    /// Domain over another type, decoded as its base type.
    Domain { base: Oid },
    /// Unknown to the driver, decoded as raw bytes.
    Opaque,
}

/// A postgres type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub oid: Oid,
    pub schema: String,
    pub name: String,
    pub kind: TypeKind,
}

impl TypeInfo {
    fn opaque(oid: Oid) -> TypeInfo {
        TypeInfo { oid, schema: String::new(), name: String::new(), kind: TypeKind::Opaque }
    }
}

/// Catalog row of `pg_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogType {
    pub oid: Oid,
    pub schema: String,
    pub name: String,
    /// `b` base, `c` composite, `d` domain, `e` enum, `p` pseudo, `r` range, `m` multirange.
    pub typtype: u8,
    pub typelem: Oid,
    pub typrelid: Oid,
    pub typbasetype: Oid,
}

/// Mapping of oid to [`TypeInfo`] for one connection.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: HashMap<Oid, TypeInfo>,
}

macro_rules! builtin {
    ($($oid:ident, $array:ident, $name:literal => $host:ident;)*) => {
        const BUILTIN: &[(Oid, Oid, &str, HostType)] = &[
            $((oid::$oid, oid::$array, $name, HostType::$host),)*
        ];
    };
}

builtin! {
    BOOL, BOOL_ARRAY, "bool" => Bool;
    BYTEA, BYTEA_ARRAY, "bytea" => Bytea;
    CHAR, CHAR_ARRAY, "char" => Char;
    NAME, NAME_ARRAY, "name" => Text;
    INT8, INT8_ARRAY, "int8" => Int8;
    INT2, INT2_ARRAY, "int2" => Int2;
    INT4, INT4_ARRAY, "int4" => Int4;
    TEXT, TEXT_ARRAY, "text" => Text;
    OID, OID_ARRAY, "oid" => Oid;
    JSON, JSON_ARRAY, "json" => Json;
    FLOAT4, FLOAT4_ARRAY, "float4" => Float4;
    FLOAT8, FLOAT8_ARRAY, "float8" => Float8;
    BPCHAR, BPCHAR_ARRAY, "bpchar" => Text;
    VARCHAR, VARCHAR_ARRAY, "varchar" => Text;
    DATE, DATE_ARRAY, "date" => Date;
    TIME, TIME_ARRAY, "time" => Time;
    TIMESTAMP, TIMESTAMP_ARRAY, "timestamp" => Timestamp;
    TIMESTAMPTZ, TIMESTAMPTZ_ARRAY, "timestamptz" => TimestampTz;
    INTERVAL, INTERVAL_ARRAY, "interval" => Interval;
    NUMERIC, NUMERIC_ARRAY, "numeric" => Numeric;
    UUID, UUID_ARRAY, "uuid" => Uuid;
    JSONB, JSONB_ARRAY, "jsonb" => Jsonb;
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TypeRegistry {
    /// Registry with only builtin types.
    pub fn builtin() -> TypeRegistry {
        let mut types = HashMap::with_capacity(BUILTIN.len() * 2 + 1);
        let catalog = |oid, name: &str, kind| TypeInfo {
            oid,
            schema: "pg_catalog".into(),
            name: name.into(),
            kind,
        };

        for &(oid, array, name, host) in BUILTIN {
            types.insert(oid, catalog(oid, name, TypeKind::Scalar(host)));
            types.insert(array, catalog(array, &format!("_{name}"), TypeKind::Array { element: oid }));
        }
        types.insert(oid::UNKNOWN, catalog(oid::UNKNOWN, "unknown", TypeKind::Scalar(HostType::Text)));

        TypeRegistry { types }
    }

    /// Build the registry from catalog rows.
    ///
    /// `attributes` are `(typrelid, name, type)` in attribute order, `labels` are
    /// `(enum type, label)` in sort order. Builtin types keep their builtin definition.
    pub fn from_catalog(
        catalog: &[CatalogType],
        attributes: &[(Oid, String, Oid)],
        labels: &[(Oid, String)],
    ) -> TypeRegistry {
        let mut me = TypeRegistry::builtin();

        // a type referenced as element by another type cannot itself be an array
        let referenced: std::collections::HashSet<Oid> = catalog
            .iter()
            .filter(|e| e.typelem != 0)
            .map(|e| e.typelem)
            .collect();

        for row in catalog {
            if me.types.contains_key(&row.oid) {
                continue;
            }

            let kind = match row.typtype {
                b'c' => TypeKind::Composite {
                    attributes: attributes
                        .iter()
                        .filter(|(rel, ..)| *rel == row.typrelid)
                        .map(|(_, name, oid)| (name.clone(), *oid))
                        .collect(),
                },
                b'e' => TypeKind::Enum {
                    labels: labels
                        .iter()
                        .filter(|(oid, _)| *oid == row.oid)
                        .map(|(_, label)| label.clone())
                        .collect(),
                },
                b'd' if row.typbasetype != 0 => TypeKind::Domain { base: row.typbasetype },
                _ if row.typelem != 0 && !referenced.contains(&row.oid) => {
                    TypeKind::Array { element: row.typelem }
                }
                _ => TypeKind::Opaque,
            };

            me.types.insert(row.oid, TypeInfo {
                oid: row.oid,
                schema: row.schema.clone(),
                name: row.name.clone(),
                kind,
            });
        }

        me
    }

    /// Returns the type if registered.
    pub fn get(&self, oid: Oid) -> Option<&TypeInfo> {
        self.types.get(&oid)
    }

    /// Returns the type, or an opaque type for unregistered oid.
    pub fn lookup(&self, oid: Oid) -> TypeInfo {
        self.types.get(&oid).cloned().unwrap_or_else(|| TypeInfo::opaque(oid))
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.types.contains_key(&oid)
    }

    /// Element type of an array type.
    pub fn element(&self, oid: Oid) -> Option<&TypeInfo> {
        match self.types.get(&oid)?.kind {
            TypeKind::Array { element } => self.types.get(&element),
            _ => None,
        }
    }

    /// Array type whose element is `oid`.
    pub fn array_of(&self, oid: Oid) -> Option<&TypeInfo> {
        self.types
            .values()
            .find(|e| e.kind == TypeKind::Array { element: oid })
    }

    /// Find type by name, `schema.name` or bare `name`.
    pub fn by_name(&self, name: &str) -> Option<&TypeInfo> {
        let (schema, name) = match name.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, name),
        };
        self.types
            .values()
            .find(|e| e.name == name && schema.is_none_or(|s| s == e.schema))
    }

    /// Host type used to decode `oid`, following domains.
    pub fn host_type(&self, oid: Oid) -> Option<HostType> {
        let mut oid = oid;
        // domain chains are short, the bound guards against a malformed catalog
        for _ in 0..8 {
            match self.types.get(&oid)?.kind {
                TypeKind::Scalar(host) => return Some(host),
                TypeKind::Domain { base } => oid = base,
                _ => return None,
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ===== Catalog =====

pub(crate) const CATALOG_TYPES: &str = "\
SELECT t.oid, n.nspname, t.typname, t.typtype, t.typelem, t.typrelid, t.typbasetype \
FROM pg_catalog.pg_type t JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace";

pub(crate) const CATALOG_ATTRIBUTES: &str = "\
SELECT a.attrelid, a.attname, a.atttypid \
FROM pg_catalog.pg_attribute a JOIN pg_catalog.pg_type t ON t.typrelid = a.attrelid \
WHERE t.typtype = 'c' AND a.attnum > 0 AND NOT a.attisdropped \
ORDER BY a.attrelid, a.attnum";

pub(crate) const CATALOG_ENUMS: &str = "\
SELECT e.enumtypid, e.enumlabel FROM pg_catalog.pg_enum e \
ORDER BY e.enumtypid, e.enumsortorder";

/// Read a text column of a catalog row.
fn text(row: &Row, idx: usize) -> Result<String, crate::DecodeError> {
    row.try_get::<_, String>(idx)
}

fn oid_col(row: &Row, idx: usize) -> Result<Oid, crate::DecodeError> {
    let value = text(row, idx)?;
    value.parse().map_err(|_| crate::DecodeError::Malformed("invalid oid"))
}

pub(crate) fn catalog_type(row: &Row) -> Result<CatalogType, crate::DecodeError> {
    Ok(CatalogType {
        oid: oid_col(row, 0)?,
        schema: text(row, 1)?,
        name: text(row, 2)?,
        typtype: text(row, 3)?.bytes().next().unwrap_or(b'b'),
        typelem: oid_col(row, 4)?,
        typrelid: oid_col(row, 5)?,
        typbasetype: oid_col(row, 6)?,
    })
}

pub(crate) fn catalog_attribute(row: &Row) -> Result<(Oid, String, Oid), crate::DecodeError> {
    Ok((oid_col(row, 0)?, text(row, 1)?, oid_col(row, 2)?))
}

pub(crate) fn catalog_label(row: &Row) -> Result<(Oid, String), crate::DecodeError> {
    Ok((oid_col(row, 0)?, text(row, 1)?))
}

impl std::fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            return write!(f, "oid {}", self.oid);
        }
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(oid: Oid, name: &str, typtype: u8, typelem: Oid, typrelid: Oid) -> CatalogType {
        CatalogType {
            oid,
            schema: "public".into(),
            name: name.into(),
            typtype,
            typelem,
            typrelid,
            typbasetype: 0,
        }
    }

    #[test]
    fn builtin_arrays() {
        let reg = TypeRegistry::builtin();
        assert_eq!(reg.host_type(oid::INT4), Some(HostType::Int4));
        assert_eq!(reg.element(oid::INT4_ARRAY).map(|e| e.oid), Some(oid::INT4));
        assert_eq!(reg.array_of(oid::TEXT).map(|e| e.oid), Some(oid::TEXT_ARRAY));
        assert_eq!(reg.by_name("pg_catalog._int4").map(|e| e.oid), Some(oid::INT4_ARRAY));
    }

    #[test]
    fn array_rule() {
        // `vec` names float8 as element, yet `_vec` names `vec`, so `vec` is not an array
        let catalog = [
            row(90010, "vec", b'b', oid::FLOAT8, 0),
            row(90011, "_vec", b'b', 90010, 0),
        ];
        let reg = TypeRegistry::from_catalog(&catalog, &[], &[]);
        assert_eq!(reg.get(90010).map(|e| &e.kind), Some(&TypeKind::Opaque));
        assert_eq!(reg.get(90011).map(|e| &e.kind), Some(&TypeKind::Array { element: 90010 }));
    }

    #[test]
    fn composite_and_enum() {
        let catalog = [
            row(90001, "pair", b'c', 0, 91001),
            row(90002, "mood", b'e', 0, 0),
            row(90003, "_mood", b'b', 90002, 0),
            // builtin entries from the catalog never replace builtin definitions
            row(oid::INT4, "int4", b'b', 0, 0),
        ];
        let attributes = [
            (91001, "a".to_owned(), oid::INT4),
            (91001, "b".to_owned(), oid::TEXT),
            (91999, "other".to_owned(), oid::BOOL),
        ];
        let labels = [
            (90002, "sad".to_owned()),
            (90002, "ok".to_owned()),
            (90002, "happy".to_owned()),
        ];
        let reg = TypeRegistry::from_catalog(&catalog, &attributes, &labels);

        let TypeKind::Composite { attributes } = &reg.lookup(90001).kind else {
            panic!("expected composite")
        };
        assert_eq!(attributes, &[("a".to_owned(), oid::INT4), ("b".to_owned(), oid::TEXT)]);

        let TypeKind::Enum { labels } = &reg.lookup(90002).kind else {
            panic!("expected enum")
        };
        assert_eq!(labels, &["sad", "ok", "happy"]);

        assert_eq!(reg.element(90003).map(|e| e.name.as_str()), Some("mood"));
        assert_eq!(reg.host_type(oid::INT4), Some(HostType::Int4));
    }

    #[test]
    fn unknown_oid_is_opaque() {
        let reg = TypeRegistry::builtin();
        assert_eq!(reg.get(123456), None);
        assert_eq!(reg.lookup(123456).kind, TypeKind::Opaque);
    }

    #[test]
    fn domain_follows_base() {
        let mut catalog = row(90020, "email", b'd', 0, 0);
        catalog.typbasetype = oid::TEXT;
        let reg = TypeRegistry::from_catalog(&[catalog], &[], &[]);
        assert_eq!(reg.host_type(90020), Some(HostType::Text));
    }
}
