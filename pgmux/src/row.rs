//! Postgres row operation.
//!
//! - [`Row`]
//! - [`Column`]
//! - [`FromRow`]
//! - [`Decode`]
//!
//! - [`Index`]
//! - [`DecodeError`]
use bytes::Bytes;
use std::{borrow::Cow, fmt, str::Utf8Error, string::FromUtf8Error, sync::Arc};

use crate::{
    common::unit_error,
    ext::FmtExt,
    postgres::{FieldDescription, Oid, PgFormat, ProtocolError, oid},
    types::{HostType, TypeInfo, TypeRegistry, Value},
};

/// Postgres row.
#[derive(Clone)]
pub struct Row {
    columns: Arc<[FieldDescription]>,
    values: Vec<Option<Bytes>>,
    types: Arc<TypeRegistry>,
}

impl Row {
    /// `DataRow` values described by the last `RowDescription`.
    pub(crate) fn new(
        columns: Arc<[FieldDescription]>,
        values: Vec<Option<Bytes>>,
        types: Arc<TypeRegistry>,
    ) -> Result<Self, ProtocolError> {
        if columns.len() != values.len() {
            return Err(ProtocolError::malformed("DataRow length does not match RowDescription"));
        }
        Ok(Self { columns, values, types })
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Column descriptions.
    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        let nth = idx.position(&self.columns)?;
        R::decode(self.column(nth))
    }

    /// Decode column into dynamic [`Value`].
    pub fn get_value<I: Index>(&self, idx: I) -> Result<Value, DecodeError> {
        self.try_get(idx)
    }

    fn column(&self, nth: usize) -> Column {
        let field = &self.columns[nth];
        Column {
            name: field.name.clone(),
            oid: field.type_oid,
            format: field.format,
            value: self.values[nth].clone(),
            types: self.types.clone(),
        }
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl IntoIterator for Row {
    type Item = Column;

    type IntoIter = IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter { row: self, iter_n: 0 }
    }
}

/// [`IntoIterator`] implementation from [`Row`].
#[derive(Debug)]
pub struct IntoIter {
    row: Row,
    iter_n: usize,
}

impl IntoIter {
    /// Same as [`Iterator::next`] but returns [`Result`] instead.
    pub fn try_next(&mut self) -> Result<Column, DecodeError> {
        self.next().ok_or(DecodeError::IndexOutOfBounds(self.iter_n))
    }
}

impl Iterator for IntoIter {
    type Item = Column;

    fn next(&mut self) -> Option<Self::Item> {
        if self.iter_n == self.row.len() {
            return None;
        }
        let column = self.row.column(self.iter_n);
        self.iter_n += 1;
        Some(column)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (field, value) in self.columns.iter().zip(&self.values) {
            dbg.key(&field.name);
            match value {
                None => dbg.value(&format_args!("NULL")),
                Some(v) => dbg.value(&v.lossy()),
            };
        }
        dbg.finish()
    }
}

/// Postgres column.
#[derive(Clone)]
pub struct Column {
    name: Arc<str>,
    oid: Oid,
    format: PgFormat,
    value: Option<Bytes>,
    types: Arc<TypeRegistry>,
}

impl Column {
    /// Returns column [`Oid`].
    pub const fn oid(&self) -> Oid {
        self.oid
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn format(&self) -> PgFormat {
        self.format
    }

    /// Returns the registered type of the column, opaque when unknown.
    pub fn type_info(&self) -> TypeInfo {
        self.types.lookup(self.oid)
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Extract the inner bytes as slice.
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Clone the inner [`Bytes`].
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn value(&self) -> Option<Bytes> {
        self.value.clone()
    }

    /// Consume self into the inner [`Bytes`].
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    /// Try consume self into the inner [`Bytes`].
    ///
    /// Return [`DecodeError::Null`] if value is `NULL`.
    pub fn try_into_value(self) -> Result<Bytes, DecodeError> {
        self.value.ok_or(DecodeError::Null)
    }

    /// Decode into dynamic [`Value`] using the type registry.
    pub fn to_value(&self) -> Result<Value, DecodeError> {
        Value::decode(&self.types, self.oid, self.format, self.value.clone())
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }

    fn host_type(&self) -> Option<HostType> {
        self.types.host_type(self.oid)
    }

    fn mismatch(&self, expected: &'static str) -> DecodeError {
        DecodeError::OidMismatch { expected, found: self.oid }
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("oid", &self.oid)
            .field("value", &self.value.as_deref().map(FmtExt::lossy))
            .finish()
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl FromRow for Vec<Value> {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        row.into_iter().map(|e| e.to_value()).collect()
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Decode),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);

/// A type that can be constructed from [`Column`].
pub trait Decode: Sized {
    /// Try decode self from column.
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl Decode for Column {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column)
    }
}

impl Decode for Value {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        column.to_value()
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.is_null() {
            true => Ok(None),
            false => column.decode().map(Some),
        }
    }
}

impl Decode for () {
    fn decode(_: Column) -> Result<Self, DecodeError> {
        Ok(())
    }
}

/// Numbers decode from any narrower type of the same family, in binary or text format.
macro_rules! decode_number {
    ($ty:ty, $name:literal, $($host:ident => $src:ty),*) => {
        impl Decode for $ty {
            fn decode(col: Column) -> Result<Self, DecodeError> {
                let host = col.host_type();
                let format = col.format;
                let value = col.value.clone().ok_or(DecodeError::Null)?;
                match (host, format) {
                    $(
                        (Some(HostType::$host), PgFormat::Binary) => {
                            let be = value[..].try_into().map_err(|_| DecodeError::Malformed("unexpected value length"))?;
                            Ok(<$src>::from_be_bytes(be).into())
                        }
                        (Some(HostType::$host), PgFormat::Text) => {
                            let text = std::str::from_utf8(&value)?;
                            text.parse::<$ty>().map_err(|_| DecodeError::Malformed(concat!("invalid ", $name)))
                        }
                    )*
                    _ => Err(col.mismatch($name)),
                }
            }
        }
    };
}

decode_number!(i16, "int2", Int2 => i16);
decode_number!(i32, "int4", Int2 => i16, Int4 => i32);
decode_number!(i64, "int8", Int2 => i16, Int4 => i32, Int8 => i64);
decode_number!(f32, "float4", Float4 => f32);
decode_number!(f64, "float8", Float4 => f32, Float8 => f64);
decode_number!(u32, "oid", Oid => u32);

impl Decode for bool {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        if col.host_type() != Some(HostType::Bool) {
            return Err(col.mismatch("bool"));
        }
        match col.to_value()? {
            Value::Bool(b) => Ok(b),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::Malformed("invalid bool")),
        }
    }
}

impl Decode for String {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        // text format of any type is its textual representation
        if col.format == PgFormat::Text {
            return Ok(String::from_utf8(col.try_into_value()?.into())?);
        }
        match col.to_value()? {
            Value::Text(s) | Value::Enum(s) | Value::Numeric(s) | Value::Json(s) => Ok(s),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("text")),
        }
    }
}

impl Decode for Vec<u8> {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        Bytes::decode(col).map(Into::into)
    }
}

impl Decode for Bytes {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match (col.oid, col.format) {
            (oid::BYTEA, PgFormat::Binary) => col.try_into_value(),
            (oid::BYTEA, PgFormat::Text) => {
                let value = col.try_into_value()?;
                let text = std::str::from_utf8(&value)?;
                Ok(crate::types::value::decode_hex_bytea(text)?.into())
            }
            _ => Err(col.mismatch("bytea")),
        }
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the position of the column.
    fn position(self, columns: &[FieldDescription]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, columns: &[FieldDescription]) -> Result<usize, DecodeError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, columns: &[FieldDescription]) -> Result<usize, DecodeError> {
        columns
            .iter()
            .position(|e| &*e.name == self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

unit_error! {
    /// An error when try to [`fetch_one`][crate::query::Query::fetch_one] and not returns any row.
    pub struct RowNotFound("row not found");
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Column type cannot be decoded into requested type.
    OidMismatch {
        expected: &'static str,
        found: Oid,
    },
    /// Row is null.
    Null,
    /// Value bytes do not match its type.
    Malformed(&'static str),
    /// Failed to deserialize using `serde_json`.
    #[cfg(feature = "json")]
    Json(serde_json::error::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::OidMismatch { expected, found } => write!(f, "expected {expected}, found type oid {found}"),
            Self::Null => write!(f, "unexpected NULL value"),
            Self::Malformed(reason) => write!(f, "{reason}"),
            #[cfg(feature = "json")]
            Self::Json(e) => write!(f, "{e}"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));
from!(<bytes::TryGetError>_ => Self::Malformed("value truncated"));
#[cfg(feature = "json")]
from!(<serde_json::error::Error>e => Self::Json(e));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
