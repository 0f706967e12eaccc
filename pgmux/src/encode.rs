//! Query parameter encoding.
//!
//! - [`Encode`]
//! - [`Encoded`]
use bytes::Bytes;

use crate::{
    Error, Result,
    postgres::{Oid, PgFormat, PgType, oid},
};

/// Value that can be bound as a query parameter.
pub trait Encode {
    /// Encode self into a parameter value.
    fn encode(self) -> Encoded;
}

/// Encoded query parameter.
///
/// Strings are sent in text format with an unspecified type, the server infers the type from the
/// statement, so a string can be bound to any column type. Other values are sent in binary format
/// with their type oid.
#[derive(Clone, PartialEq, Eq)]
pub struct Encoded {
    value: Option<Bytes>,
    oid: Oid,
    format: PgFormat,
}

impl Encoded {
    /// Binary value of type `oid`.
    pub fn binary(value: impl Into<Bytes>, oid: Oid) -> Encoded {
        Self { value: Some(value.into()), oid, format: PgFormat::Binary }
    }

    /// Text value of type `oid`, zero leaves the type to the server.
    pub fn text(value: impl Into<Bytes>, oid: Oid) -> Encoded {
        Self { value: Some(value.into()), oid, format: PgFormat::Text }
    }

    /// `NULL` of type `oid`.
    pub fn null(oid: Oid) -> Encoded {
        Self { value: None, oid, format: PgFormat::Binary }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Convert the value to the parameter type the server reported for a prepared statement.
    ///
    /// Integers and floats widen, `NULL` and text values adopt the target type. Anything else
    /// must already match.
    pub fn coerce(self, target: Oid) -> Result<Encoded> {
        if target == 0 || target == self.oid || self.format == PgFormat::Text {
            return Ok(Self { oid: if target == 0 { self.oid } else { target }, ..self });
        }
        let Some(value) = self.value.as_deref() else {
            return Ok(Encoded::null(target));
        };

        let widened = match (self.oid, target) {
            (oid::INT2, oid::INT4) => i32::from(i16_be(value)?).to_be_bytes().to_vec(),
            (oid::INT2, oid::INT8) => i64::from(i16_be(value)?).to_be_bytes().to_vec(),
            (oid::INT4, oid::INT8) => i64::from(i32_be(value)?).to_be_bytes().to_vec(),
            (oid::FLOAT4, oid::FLOAT8) => {
                let be = value.try_into().map_err(|_| Error::config("malformed float4 parameter"))?;
                f64::from(f32::from_be_bytes(be)).to_be_bytes().to_vec()
            }
            (from, to) => {
                return Err(Error::config(format!("parameter of type oid {from} cannot bind to type oid {to}")));
            }
        };

        Ok(Encoded::binary(widened, target))
    }
}

fn i16_be(value: &[u8]) -> Result<i16> {
    let be = value.try_into().map_err(|_| Error::config("malformed int2 parameter"))?;
    Ok(i16::from_be_bytes(be))
}

fn i32_be(value: &[u8]) -> Result<i32> {
    let be = value.try_into().map_err(|_| Error::config("malformed int4 parameter"))?;
    Ok(i32::from_be_bytes(be))
}

impl std::fmt::Debug for Encoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::ext::FmtExt;
        let mut dbg = f.debug_struct("Encoded");
        dbg.field("oid", &self.oid);
        match &self.value {
            Some(v) => dbg.field("value", &v.lossy()),
            None => dbg.field("value", &"NULL"),
        };
        dbg.finish()
    }
}

// ===== Implementations =====

impl Encode for Encoded {
    fn encode(self) -> Encoded {
        self
    }
}

macro_rules! encode_be {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(self) -> Encoded {
                Encoded::binary(self.to_be_bytes().to_vec(), <$ty as PgType>::OID)
            }
        }
    )*};
}

encode_be!(i16, i32, i64, f32, f64);

impl Encode for bool {
    fn encode(self) -> Encoded {
        Encoded::binary(vec![self as u8], oid::BOOL)
    }
}

impl Encode for &str {
    fn encode(self) -> Encoded {
        Encoded::text(self.to_owned(), 0)
    }
}

impl Encode for String {
    fn encode(self) -> Encoded {
        Encoded::text(self, 0)
    }
}

impl Encode for &String {
    fn encode(self) -> Encoded {
        self.as_str().encode()
    }
}

impl Encode for &[u8] {
    fn encode(self) -> Encoded {
        Encoded::binary(Bytes::copy_from_slice(self), oid::BYTEA)
    }
}

impl Encode for Vec<u8> {
    fn encode(self) -> Encoded {
        Encoded::binary(self, oid::BYTEA)
    }
}

impl Encode for Bytes {
    fn encode(self) -> Encoded {
        Encoded::binary(self, oid::BYTEA)
    }
}

impl<T: PgType + ?Sized> PgType for &T {
    const OID: Oid = T::OID;
}

impl<T: Encode + PgType> Encode for Option<T> {
    fn encode(self) -> Encoded {
        match self {
            Some(value) => value.encode(),
            // text stays unspecified like a non null string
            None if T::OID == oid::TEXT => Encoded::null(0),
            None => Encoded::null(T::OID),
        }
    }
}
