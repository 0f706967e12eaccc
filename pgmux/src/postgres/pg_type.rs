/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// A type that have corresponding postgres oid.
pub trait PgType {
    const OID: Oid;
}

/// Well known builtin type oids.
///
/// These never change between server versions, see `pg_type.dat` in postgres source.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const CHAR: Oid = 18;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const REGPROC: Oid = 24;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const JSON: Oid = 114;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const UNKNOWN: Oid = 705;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIME: Oid = 1083;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const INTERVAL: Oid = 1186;
    pub const NUMERIC: Oid = 1700;
    pub const RECORD: Oid = 2249;
    pub const UUID: Oid = 2950;
    pub const JSONB: Oid = 3802;

    pub const BOOL_ARRAY: Oid = 1000;
    pub const BYTEA_ARRAY: Oid = 1001;
    pub const INT2_ARRAY: Oid = 1005;
    pub const INT4_ARRAY: Oid = 1007;
    pub const TEXT_ARRAY: Oid = 1009;
    pub const VARCHAR_ARRAY: Oid = 1015;
    pub const INT8_ARRAY: Oid = 1016;
    pub const FLOAT4_ARRAY: Oid = 1021;
    pub const FLOAT8_ARRAY: Oid = 1022;
    pub const UUID_ARRAY: Oid = 2951;
    pub const CHAR_ARRAY: Oid = 1002;
    pub const NAME_ARRAY: Oid = 1003;
    pub const OID_ARRAY: Oid = 1028;
    pub const JSON_ARRAY: Oid = 199;
    pub const BPCHAR_ARRAY: Oid = 1014;
    pub const DATE_ARRAY: Oid = 1182;
    pub const TIME_ARRAY: Oid = 1183;
    pub const TIMESTAMP_ARRAY: Oid = 1115;
    pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
    pub const INTERVAL_ARRAY: Oid = 1187;
    pub const NUMERIC_ARRAY: Oid = 1231;
    pub const JSONB_ARRAY: Oid = 3807;
}

macro_rules! oid {
    ($ty:ty, $oid:expr $(, $doc:literal)? ) => {
        impl PgType for $ty {
            $(#[doc = $doc])?
            const OID: Oid = $oid;
        }
    };
}

oid!(bool, oid::BOOL);
oid!(i64, oid::INT8, "`int8` ~18 digit integer, 8-byte storage");
oid!(i16, oid::INT2, "`int2` -32 thousand to 32 thousand, 2-byte storage");
oid!(i32, oid::INT4, "`int4` -2 billion to 2 billion integer, 4-byte storage");
oid!(str, oid::TEXT, "`text` variable-length string, no limit specified");
oid!(String, oid::TEXT, "`text` variable-length string, no limit specified");
oid!(f32, oid::FLOAT4, "`float4` single-precision floating point number, 4-byte storage");
oid!(f64, oid::FLOAT8, "`float8` double-precision floating point number, 8-byte storage");
oid!([u8], oid::BYTEA, "`bytea` variable-length binary string");
oid!(Vec<u8>, oid::BYTEA, "`bytea` variable-length binary string");
oid!(bytes::Bytes, oid::BYTEA, "`bytea` variable-length binary string");

#[cfg(feature = "time")]
impl PgType for time::PrimitiveDateTime {
    /// date and time
    const OID: Oid = oid::TIMESTAMP;
}

#[cfg(feature = "time")]
impl PgType for time::OffsetDateTime {
    /// date and time with time zone
    const OID: Oid = oid::TIMESTAMPTZ;
}

#[cfg(feature = "time")]
impl PgType for time::Date {
    const OID: Oid = oid::DATE;
}
