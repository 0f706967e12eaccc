use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    encode::{Encode, Encoded},
    postgres::{Oid, PgFormat, PgType, oid},
    row::{Column, Decode, DecodeError},
};

/// jsonb binary format version.
const JSONB_VERSION: u8 = 1;

/// Decode and Encode postgres json value.
///
/// Decodes both `json` and `jsonb` columns, encodes as `jsonb`.
///
/// # Panics
///
/// Note that when performing [`Encode`], if [`Serialize`] implementation decide
/// to fail, it will panics. Use [`Json::try_encode`] to handle the error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> PgType for Json<T> {
    /// jsonb, Binary JSON
    const OID: Oid = oid::JSONB;
}

impl<T> std::ops::Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Serialize> Json<T> {
    /// Serialize into a `jsonb` parameter.
    pub fn try_encode(&self) -> Result<Encoded, serde_json::Error> {
        let mut buf = vec![JSONB_VERSION];
        serde_json::to_writer(&mut buf, &self.0)?;
        Ok(Encoded::binary(buf, oid::JSONB))
    }
}

impl<T> Decode for Json<T>
where
    T: DeserializeOwned,
{
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let (oid, format) = (column.oid(), column.format());
        if !matches!(oid, oid::JSON | oid::JSONB) {
            return Err(DecodeError::OidMismatch { expected: "json", found: oid });
        }

        let value = column.try_into_value()?;
        let body = match (oid, format) {
            (oid::JSONB, PgFormat::Binary) => match value.split_first() {
                Some((&JSONB_VERSION, body)) => body,
                _ => return Err(DecodeError::Malformed("unsupported jsonb version")),
            },
            _ => &value[..],
        };

        serde_json::from_slice(body).map(Json).map_err(Into::into)
    }
}

impl<T: Serialize> Encode for Json<T> {
    fn encode(self) -> Encoded {
        match self.try_encode() {
            Ok(ok) => ok,
            Err(err) => panic!("failed to serialize json parameter: {err}"),
        }
    }
}

impl<T: Serialize> Serialize for Json<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Json<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(T::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_jsonb() {
        let e = Json(vec![1, 2]).encode();
        assert_eq!(e.oid(), oid::JSONB);
        assert_eq!(e.value().unwrap().as_ref(), b"\x01[1,2]");
    }
}
