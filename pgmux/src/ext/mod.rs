use bytes::{Buf, BufMut, Bytes};

use crate::postgres::ProtocolError;

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// Length is `usize` in rust, while sometime postgres want `u32`,
    /// this will panic when overflow instead of wrapping.
    fn to_u32(self) -> u32;
    /// Length is `usize` in rust, while sometime postgres want `u16`,
    /// this will panic when overflow instead of wrapping.
    fn to_u16(self) -> u16;
}

/// Nul string operation.
pub trait StrExt {
    /// String length plus nul (1).
    fn nul_string_len(&self) -> u32;
}

/// Nul string operation in [`BufMut`]
pub trait BufMutExt {
    /// Write string and nul termination.
    fn put_nul_string(&mut self, string: &str);
}

/// Checked reads from a received message body.
///
/// Every read reports a truncated or malformed body as [`ProtocolError`] instead of panicking.
pub trait BytesExt {
    /// Read nul terminated bytes, without the nul.
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError>;

    /// Read nul terminated utf8 string.
    fn get_nul_string(&mut self) -> Result<String, ProtocolError>;

    /// Read a length prefixed value, `-1` length is `None`.
    fn get_value(&mut self) -> Result<Option<Bytes>, ProtocolError>;
}

/// Helper trait to [`Display`][std::fmt::Display] bytes.
pub trait FmtExt {
    /// Lossy [`Display`][std::fmt::Display] bytes.
    fn lossy(&self) -> LossyFmt<'_>;
}

/// Lossy [`Display`][std::fmt::Display] implementation for bytes.
pub struct LossyFmt<'a>(pub &'a [u8]);

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }
}

impl StrExt for str {
    fn nul_string_len(&self) -> u32 {
        self.len().to_u32() + 1/* nul */
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

impl BytesExt for Bytes {
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let Some(end) = self.iter().position(|e| matches!(e, b'\0')) else {
            return Err(ProtocolError::malformed("string is not nul terminated"));
        };
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        Ok(me)
    }

    fn get_nul_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.get_nul_bytes()?;
        String::from_utf8(bytes.into()).map_err(|_| ProtocolError::malformed("string is not utf8"))
    }

    fn get_value(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        match self.try_get_i32()? {
            -1 => Ok(None),
            len if len < 0 => Err(ProtocolError::malformed("negative value length")),
            len if len as usize > self.len() => Err(ProtocolError::malformed("value length exceeds message")),
            len => Ok(Some(self.split_to(len as usize))),
        }
    }
}

impl FmtExt for [u8] {
    fn lossy(&self) -> LossyFmt<'_> {
        LossyFmt(self)
    }
}

impl std::fmt::Display for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if b.is_ascii_graphic() || b.is_ascii_whitespace() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nul_string() {
        let mut b = Bytes::from_static(b"user\0alice\0rest");
        assert_eq!(b.get_nul_string().unwrap(), "user");
        assert_eq!(b.get_nul_string().unwrap(), "alice");
        assert!(b.get_nul_string().is_err());
    }

    #[test]
    fn value_length() {
        let mut b = Bytes::from_static(b"\xff\xff\xff\xff\0\0\0\x02hi\0\0\0\x09x");
        assert_eq!(b.get_value().unwrap(), None);
        assert_eq!(b.get_value().unwrap().as_deref(), Some(&b"hi"[..]));
        assert!(b.get_value().is_err());
    }
}
