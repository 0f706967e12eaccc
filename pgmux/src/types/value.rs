use bytes::{Buf, Bytes};
use std::fmt::Write;

use super::{HostType, TypeKind, TypeRegistry};
use crate::{
    postgres::{Oid, PgFormat},
    row::DecodeError,
};

/// Bound of composite nesting, a deeper value is rejected as malformed.
const MAX_DEPTH: usize = 32;

/// Dynamically typed value, decoded by the type registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Exact decimal string, `NaN` and `Infinity` included.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    /// `json` or `jsonb` document text.
    Json(String),
    /// Days since 2000-01-01.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since 2000-01-01 00:00:00.
    Timestamp(i64),
    /// Microseconds since 2000-01-01 00:00:00 UTC.
    TimestampTz(i64),
    Interval {
        months: i32,
        days: i32,
        micros: i64,
    },
    Oid(Oid),
    Char(i8),
    Array {
        element: Oid,
        dims: Vec<ArrayDim>,
        /// Elements in row-major order.
        elements: Vec<Value>,
    },
    /// Composite fields in attribute order.
    Composite(Vec<(String, Value)>),
    Enum(String),
    /// Value of a type the registry does not know.
    Unknown(Bytes),
}

/// One dimension of an array value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDim {
    pub len: i32,
    pub lower_bound: i32,
}

impl Value {
    /// Decode a column value.
    pub fn decode(
        types: &TypeRegistry,
        oid: Oid,
        format: PgFormat,
        value: Option<Bytes>,
    ) -> Result<Value, DecodeError> {
        let Some(value) = value else {
            return Ok(Value::Null);
        };
        match format {
            PgFormat::Binary => decode_binary(types, oid, value, 0),
            PgFormat::Text => decode_text(types, oid, value),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text of `Text`, `Numeric`, `Json` and `Enum` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Numeric(s) | Value::Json(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer value widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int2(v) => Some(v.into()),
            Value::Int4(v) => Some(v.into()),
            Value::Int8(v) => Some(v),
            Value::Oid(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Elements of an array value.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array { elements, .. } => Some(elements),
            _ => None,
        }
    }

    /// Field of a composite value by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Composite(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

fn malformed(reason: &'static str) -> DecodeError {
    DecodeError::Malformed(reason)
}

fn fixed<const N: usize>(value: &[u8]) -> Result<[u8; N], DecodeError> {
    value.try_into().map_err(|_| malformed("unexpected value length"))
}

fn utf8(value: Bytes) -> Result<String, DecodeError> {
    Ok(String::from_utf8(value.into())?)
}

fn decode_binary(types: &TypeRegistry, oid: Oid, value: Bytes, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(malformed("value nested too deep"));
    }

    if let Some(host) = types.host_type(oid) {
        return decode_scalar(host, value);
    }

    let Some(info) = types.get(oid) else {
        return Ok(Value::Unknown(value));
    };

    match &info.kind {
        TypeKind::Array { .. } => decode_array(types, value, depth),
        TypeKind::Composite { attributes } => {
            let names = attributes.iter().map(|(name, _)| name.as_str());
            decode_composite(types, names, value, depth)
        }
        TypeKind::Enum { .. } => Ok(Value::Enum(utf8(value)?)),
        TypeKind::Scalar(_) | TypeKind::Domain { .. } | TypeKind::Opaque => Ok(Value::Unknown(value)),
    }
}

fn decode_scalar(host: HostType, value: Bytes) -> Result<Value, DecodeError> {
    let v = &value[..];
    let value = match host {
        HostType::Bool => Value::Bool(fixed::<1>(v)?[0] != 0),
        HostType::Int2 => Value::Int2(i16::from_be_bytes(fixed(v)?)),
        HostType::Int4 => Value::Int4(i32::from_be_bytes(fixed(v)?)),
        HostType::Int8 => Value::Int8(i64::from_be_bytes(fixed(v)?)),
        HostType::Float4 => Value::Float4(f32::from_be_bytes(fixed(v)?)),
        HostType::Float8 => Value::Float8(f64::from_be_bytes(fixed(v)?)),
        HostType::Numeric => Value::Numeric(numeric_to_string(value)?),
        HostType::Text => Value::Text(utf8(value)?),
        HostType::Bytea => Value::Bytea(value.into()),
        HostType::Uuid => Value::Uuid(fixed(v)?),
        HostType::Json => Value::Json(utf8(value)?),
        HostType::Jsonb => {
            let mut value = value;
            if value.try_get_u8()? != 1 {
                return Err(malformed("unsupported jsonb version"));
            }
            Value::Json(utf8(value)?)
        }
        HostType::Date => Value::Date(i32::from_be_bytes(fixed(v)?)),
        HostType::Time => Value::Time(i64::from_be_bytes(fixed(v)?)),
        HostType::Timestamp => Value::Timestamp(i64::from_be_bytes(fixed(v)?)),
        HostType::TimestampTz => Value::TimestampTz(i64::from_be_bytes(fixed(v)?)),
        HostType::Interval => {
            let mut value = value;
            if value.len() != 16 {
                return Err(malformed("unexpected value length"));
            }
            let micros = value.get_i64();
            let days = value.get_i32();
            let months = value.get_i32();
            Value::Interval { months, days, micros }
        }
        HostType::Oid => Value::Oid(u32::from_be_bytes(fixed(v)?)),
        HostType::Char => Value::Char(i8::from_be_bytes(fixed(v)?)),
    };
    Ok(value)
}

/// `ndim`, has-null flag, element oid, `ndim` times (length, lower bound), then elements.
fn decode_array(types: &TypeRegistry, mut value: Bytes, depth: usize) -> Result<Value, DecodeError> {
    let ndim = value.try_get_i32()?;
    let _has_null = value.try_get_i32()?;
    let element = value.try_get_u32()?;

    if !(0..=6).contains(&ndim) {
        return Err(malformed("invalid array dimension"));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    let mut count: usize = if ndim == 0 { 0 } else { 1 };
    for _ in 0..ndim {
        let len = value.try_get_i32()?;
        let lower_bound = value.try_get_i32()?;
        if len < 0 {
            return Err(malformed("negative array length"));
        }
        count = count.saturating_mul(len as usize);
        dims.push(ArrayDim { len, lower_bound });
    }

    // every element carries at least its length
    if count > value.len() / 4 {
        return Err(malformed("array length exceeds value"));
    }

    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        elements.push(match next_value(&mut value)? {
            Some(e) => decode_binary(types, element, e, depth + 1)?,
            None => Value::Null,
        });
    }

    Ok(Value::Array { element, dims, elements })
}

/// Field count, then per field the type oid and a length prefixed value.
fn decode_composite<'a>(
    types: &TypeRegistry,
    mut names: impl Iterator<Item = &'a str>,
    mut value: Bytes,
    depth: usize,
) -> Result<Value, DecodeError> {
    let count = value.try_get_i32()?;
    if count < 0 || count as usize > value.len() / 8 {
        return Err(malformed("invalid composite field count"));
    }

    let mut fields = Vec::with_capacity(count as usize);
    for i in 0..count {
        let oid = value.try_get_u32()?;
        let field = match next_value(&mut value)? {
            Some(e) => decode_binary(types, oid, e, depth + 1)?,
            None => Value::Null,
        };
        let name = match names.next() {
            Some(name) => name.to_owned(),
            None => format!("f{}", i + 1),
        };
        fields.push((name, field));
    }

    Ok(Value::Composite(fields))
}

fn next_value(value: &mut Bytes) -> Result<Option<Bytes>, DecodeError> {
    match value.try_get_i32()? {
        -1 => Ok(None),
        len if len < 0 || len as usize > value.len() => Err(malformed("invalid value length")),
        len => Ok(Some(value.split_to(len as usize))),
    }
}

/// Binary numeric into its decimal string.
///
/// Digits are base 10000, `weight` is the power of the first digit.
fn numeric_to_string(mut value: Bytes) -> Result<String, DecodeError> {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;
    const PINF: u16 = 0xD000;
    const NINF: u16 = 0xF000;

    let ndigits = value.try_get_i16()?;
    let weight = value.try_get_i16()? as i32;
    let sign = value.try_get_u16()?;
    let dscale = value.try_get_u16()? as usize;

    match sign {
        NAN => return Ok("NaN".into()),
        PINF => return Ok("Infinity".into()),
        NINF => return Ok("-Infinity".into()),
        _ => {}
    }

    if ndigits < 0 {
        return Err(malformed("negative numeric digit count"));
    }
    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        digits.push(value.try_get_i16()?);
    }
    let digit = |i: i32| if i < 0 { 0 } else { digits.get(i as usize).copied().unwrap_or(0) };

    let mut out = String::new();
    if sign == NEGATIVE {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            let d = digit(i);
            let _ = match i {
                0 => write!(out, "{d}"),
                _ => write!(out, "{d:04}"),
            };
        }
    }

    if dscale > 0 {
        out.push('.');
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push_str(&frac);
    }

    Ok(out)
}

fn decode_text(types: &TypeRegistry, oid: Oid, value: Bytes) -> Result<Value, DecodeError> {
    let text = utf8(value)?;

    let Some(host) = types.host_type(oid) else {
        return Ok(match types.get(oid).map(|e| &e.kind) {
            Some(TypeKind::Enum { .. }) => Value::Enum(text),
            _ => Value::Text(text),
        });
    };

    let value = match host {
        HostType::Bool => match text.as_str() {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => return Err(malformed("invalid bool")),
        },
        HostType::Int2 => Value::Int2(parse(&text)?),
        HostType::Int4 => Value::Int4(parse(&text)?),
        HostType::Int8 => Value::Int8(parse(&text)?),
        HostType::Float4 => Value::Float4(parse(&text)?),
        HostType::Float8 => Value::Float8(parse(&text)?),
        HostType::Oid => Value::Oid(parse(&text)?),
        HostType::Numeric => Value::Numeric(text),
        HostType::Json | HostType::Jsonb => Value::Json(text),
        HostType::Bytea => Value::Bytea(decode_hex_bytea(&text)?),
        _ => Value::Text(text),
    };
    Ok(value)
}

fn parse<T: std::str::FromStr>(text: &str) -> Result<T, DecodeError> {
    text.parse().map_err(|_| malformed("invalid text value"))
}

/// Text `bytea` in hex output format, `\x` followed by hex pairs.
pub(crate) fn decode_hex_bytea(text: &str) -> Result<Vec<u8>, DecodeError> {
    let Some(hex) = text.strip_prefix("\\x") else {
        return Err(malformed("bytea is not in hex format"));
    };
    if hex.len() % 2 != 0 {
        return Err(malformed("odd bytea hex length"));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|_| malformed("invalid bytea hex"))?;
            u8::from_str_radix(pair, 16).map_err(|_| malformed("invalid bytea hex"))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;
    use bytes::{BufMut, BytesMut};

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_i16(digits.len() as i16);
        b.put_i16(weight);
        b.put_u16(sign);
        b.put_u16(dscale);
        for d in digits {
            b.put_i16(*d);
        }
        b.freeze()
    }

    #[test]
    fn numeric_decimal() {
        assert_eq!(numeric_to_string(numeric(0, 0, 2, &[123, 4500])).unwrap(), "123.45");
        assert_eq!(numeric_to_string(numeric(-1, 0, 3, &[10])).unwrap(), "0.001");
        assert_eq!(numeric_to_string(numeric(1, 0x4000, 0, &[1, 0])).unwrap(), "-10000");
        assert_eq!(numeric_to_string(numeric(0, 0, 0, &[])).unwrap(), "0");
        assert_eq!(numeric_to_string(numeric(-2, 0, 5, &[1000])).unwrap(), "0.00001");
        assert_eq!(numeric_to_string(numeric(0, 0xC000, 0, &[])).unwrap(), "NaN");
    }

    #[test]
    fn int_array() {
        let mut b = BytesMut::new();
        b.put_i32(1);
        b.put_i32(1);
        b.put_u32(oid::INT4);
        b.put_i32(3);
        b.put_i32(1);
        b.put_i32(4);
        b.put_i32(7);
        b.put_i32(-1);
        b.put_i32(4);
        b.put_i32(9);

        let types = TypeRegistry::builtin();
        let value = Value::decode(&types, oid::INT4_ARRAY, PgFormat::Binary, Some(b.freeze())).unwrap();
        assert_eq!(
            value,
            Value::Array {
                element: oid::INT4,
                dims: vec![ArrayDim { len: 3, lower_bound: 1 }],
                elements: vec![Value::Int4(7), Value::Null, Value::Int4(9)],
            }
        );
    }

    #[test]
    fn truncated_array_is_error() {
        let mut b = BytesMut::new();
        b.put_i32(1);
        b.put_i32(0);
        b.put_u32(oid::INT4);
        b.put_i32(1000);
        b.put_i32(1);

        let types = TypeRegistry::builtin();
        assert!(Value::decode(&types, oid::INT4_ARRAY, PgFormat::Binary, Some(b.freeze())).is_err());
    }

    #[test]
    fn text_format() {
        let types = TypeRegistry::builtin();
        let text = |oid, s: &'static str| {
            Value::decode(&types, oid, PgFormat::Text, Some(Bytes::from_static(s.as_bytes()))).unwrap()
        };
        assert_eq!(text(oid::INT4, "42"), Value::Int4(42));
        assert_eq!(text(oid::BOOL, "t"), Value::Bool(true));
        assert_eq!(text(oid::NUMERIC, "1.50"), Value::Numeric("1.50".into()));
        assert_eq!(text(oid::BYTEA, "\\x00ff"), Value::Bytea(vec![0, 255]));
        assert_eq!(text(999_999, "whatever"), Value::Text("whatever".into()));
        assert_eq!(Value::decode(&types, oid::INT4, PgFormat::Text, None).unwrap(), Value::Null);
    }

    #[test]
    fn unknown_binary_is_opaque() {
        let types = TypeRegistry::builtin();
        let value = Value::decode(&types, 999_999, PgFormat::Binary, Some(Bytes::from_static(b"\x01\x02"))).unwrap();
        assert_eq!(value, Value::Unknown(Bytes::from_static(b"\x01\x02")));
    }
}
