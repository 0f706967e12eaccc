use bytes::Bytes;
use time::{
    Date, Duration, OffsetDateTime, PrimitiveDateTime, Time,
    format_description::{BorrowedFormatItem as I, Component as C, modifier},
};

use crate::{
    encode::{Encode, Encoded},
    postgres::{Oid, PgFormat, PgType, oid},
    row::{Column, Decode, DecodeError},
};

/// 2000-01-01, postgres binary date and timestamp values count from here.
const PG_EPOCH_DATE: Date = match Date::from_julian_day(2_451_545) {
    Ok(ok) => ok,
    Err(_) => panic!("julian day of 2000-01-01 is valid"),
};

const PG_EPOCH: PrimitiveDateTime = PrimitiveDateTime::new(PG_EPOCH_DATE, Time::MIDNIGHT);

enum Raw {
    Binary(Bytes),
    Text(String),
}

fn raw(column: Column, expected: &'static str, oid: Oid) -> Result<Raw, DecodeError> {
    if column.oid() != oid {
        return Err(DecodeError::OidMismatch { expected, found: column.oid() });
    }
    let format = column.format();
    let value = column.try_into_value()?;
    match format {
        PgFormat::Binary => Ok(Raw::Binary(value)),
        PgFormat::Text => Ok(Raw::Text(String::from_utf8(value.to_vec())?)),
    }
}

fn be<const N: usize>(value: &[u8]) -> Result<[u8; N], DecodeError> {
    value.try_into().map_err(|_| DecodeError::Malformed("unexpected date/time length"))
}

const OUT_OF_RANGE: DecodeError = DecodeError::Malformed("date/time out of range");

impl Decode for Date {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let value = match raw(column, "date", oid::DATE)? {
            Raw::Binary(value) => value,
            Raw::Text(text) => {
                return Date::parse(&text, DATE).map_err(|_| DecodeError::Malformed("invalid date text"));
            }
        };
        let days = i32::from_be_bytes(be(&value)?);
        PG_EPOCH_DATE.checked_add(Duration::days(days.into())).ok_or(OUT_OF_RANGE)
    }
}

impl Decode for PrimitiveDateTime {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let value = match raw(column, "timestamp", oid::TIMESTAMP)? {
            Raw::Binary(value) => value,
            Raw::Text(text) => {
                return PrimitiveDateTime::parse(&text, TIMESTAMP)
                    .map_err(|_| DecodeError::Malformed("invalid timestamp text"));
            }
        };
        let micros = i64::from_be_bytes(be(&value)?);
        PG_EPOCH.checked_add(Duration::microseconds(micros)).ok_or(OUT_OF_RANGE)
    }
}

impl Decode for OffsetDateTime {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let value = match raw(column, "timestamptz", oid::TIMESTAMPTZ)? {
            Raw::Binary(value) => value,
            Raw::Text(text) => {
                return OffsetDateTime::parse(&text, TIMESTAMPTZ)
                    .map_err(|_| DecodeError::Malformed("invalid timestamptz text"));
            }
        };
        let micros = i64::from_be_bytes(be(&value)?);
        PG_EPOCH
            .assume_utc()
            .checked_add(Duration::microseconds(micros))
            .ok_or(OUT_OF_RANGE)
    }
}

/// Microseconds since the postgres epoch, saturating at the range of `i64`.
fn micros(since: Duration) -> i64 {
    let micros = since.whole_microseconds();
    i64::try_from(micros).unwrap_or(if micros < 0 { i64::MIN } else { i64::MAX })
}

impl Encode for Date {
    fn encode(self) -> Encoded {
        let days = (self - PG_EPOCH_DATE).whole_days();
        let days = i32::try_from(days).unwrap_or(if days < 0 { i32::MIN } else { i32::MAX });
        Encoded::binary(days.to_be_bytes().to_vec(), <Date as PgType>::OID)
    }
}

impl Encode for PrimitiveDateTime {
    fn encode(self) -> Encoded {
        Encoded::binary(micros(self - PG_EPOCH).to_be_bytes().to_vec(), <Self as PgType>::OID)
    }
}

impl Encode for OffsetDateTime {
    fn encode(self) -> Encoded {
        let since = self - PG_EPOCH.assume_utc();
        Encoded::binary(micros(since).to_be_bytes().to_vec(), <Self as PgType>::OID)
    }
}

const SUBSECOND: I<'static> = I::Compound(&[
    I::Literal(b"."),
    I::Component(C::Subsecond(modifier::Subsecond::default())),
]);

const OFFSET_MINUTE: I<'static> = I::Compound(&[
    I::Literal(b":"),
    I::Component(C::OffsetMinute(modifier::OffsetMinute::default())),
]);

const DATE: &[I<'_>] = &[
    I::Component(C::Year(modifier::Year::default())),
    I::Literal(b"-"),
    I::Component(C::Month(modifier::Month::default())),
    I::Literal(b"-"),
    I::Component(C::Day(modifier::Day::default())),
];

const TIMESTAMP: &[I<'_>] = &[
    I::Compound(DATE),
    I::Literal(b" "),
    I::Component(C::Hour(modifier::Hour::default())),
    I::Literal(b":"),
    I::Component(C::Minute(modifier::Minute::default())),
    I::Literal(b":"),
    I::Component(C::Second(modifier::Second::default())),
    I::Optional(&SUBSECOND),
];

const TIMESTAMPTZ: &[I<'_>] = &[
    I::Compound(TIMESTAMP),
    I::Component(C::OffsetHour(modifier::OffsetHour::default())),
    I::Optional(&OFFSET_MINUTE),
];

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use time::{Month, UtcOffset};

    use super::*;
    use crate::{
        postgres::FieldDescription,
        row::Row,
        types::TypeRegistry,
    };

    fn column(oid: u32, format: PgFormat, value: &[u8]) -> Column {
        let field = FieldDescription {
            name: "t".into(),
            table_oid: 0,
            column_id: 0,
            type_oid: oid,
            type_size: 8,
            type_modifier: -1,
            format,
        };
        let row = Row::new(
            Arc::from([field]),
            vec![Some(Bytes::copy_from_slice(value))],
            Arc::new(TypeRegistry::default()),
        )
        .unwrap();
        row.into_iter().next().unwrap()
    }

    #[test]
    fn binary_epoch_offsets() {
        let date = Date::from_calendar_date(2000, Month::January, 2).unwrap();
        assert_eq!(date.encode().value().unwrap().as_ref(), &1i32.to_be_bytes());

        let col = column(oid::DATE, PgFormat::Binary, &(-1i32).to_be_bytes());
        assert_eq!(col.decode::<Date>().unwrap(), Date::from_calendar_date(1999, Month::December, 31).unwrap());

        let col = column(oid::TIMESTAMP, PgFormat::Binary, &1_500_000i64.to_be_bytes());
        let ts = col.decode::<PrimitiveDateTime>().unwrap();
        assert_eq!(ts, PG_EPOCH + Duration::milliseconds(1500));
        assert_eq!(ts.encode().value().unwrap().as_ref(), &1_500_000i64.to_be_bytes());
    }

    #[test]
    fn text_timestamps() {
        let col = column(oid::TIMESTAMP, PgFormat::Text, b"2024-03-01 10:20:30.25");
        let ts = col.decode::<PrimitiveDateTime>().unwrap();
        assert_eq!(ts.millisecond(), 250);

        let col = column(oid::TIMESTAMPTZ, PgFormat::Text, b"2024-03-01 10:20:30+07");
        let ts = col.decode::<OffsetDateTime>().unwrap();
        assert_eq!(ts.offset(), UtcOffset::from_hms(7, 0, 0).unwrap());

        let col = column(oid::TIMESTAMP, PgFormat::Binary, &i64::MAX.to_be_bytes());
        assert!(col.decode::<PrimitiveDateTime>().is_err());
    }
}
