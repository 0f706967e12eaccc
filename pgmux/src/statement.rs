//! Prepared statement and portal names, and the [`Statement`] handle.
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, atomic::Ordering},
};

use crate::{
    Connection, Result,
    encode::Encoded,
    portal::Portal,
    postgres::{FieldDescription, Oid},
};

type AtomicId = std::sync::atomic::AtomicU32;

/// Server side object name, `q` followed by ten digits.
///
/// Names wrap after `u32::MAX`, long before that the statement cache has evicted every name
/// it handed out.
#[derive(Clone, PartialEq, Eq)]
pub struct Id([u8; 11]);

impl Id {
    pub(crate) fn unnamed() -> Self {
        Self([b'?'; 11])
    }

    pub(crate) fn next(atomic: &AtomicId) -> Self {
        let id = atomic.fetch_add(1, Ordering::Relaxed);
        let mut buf = *b"q0000000000";
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // only ascii digits and `q` are ever written
        std::str::from_utf8(&self.0[..]).unwrap_or_default()
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

macro_rules! delegate {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Id);

        impl $name {
            pub(crate) fn unnamed() -> Self {
                Self(Id::unnamed())
            }

            pub(crate) fn next() -> Self {
                static ID: AtomicId = AtomicId::new(0);
                Self(Id::next(&ID))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Id;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

delegate!(StatementName);
delegate!(PortalName);

/// Statement cache key, the sql after rewrite and the declared parameter types.
pub(crate) fn statement_key(sql: &str, oids: &[Oid]) -> u64 {
    let mut buf = DefaultHasher::new();
    sql.hash(&mut buf);
    oids.hash(&mut buf);
    buf.finish()
}

/// Statement cache entry.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub name: StatementName,
    pub columns: Option<Arc<[FieldDescription]>>,
}

/// A prepared statement.
///
/// Created by [`Connection::prepare`]. The statement lives in the connection statement cache,
/// executing it after eviction prepares it again transparently.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) conn: Connection,
    pub(crate) sql: Arc<str>,
    pub(crate) names: Vec<String>,
    pub(crate) name: StatementName,
    pub(crate) params: Arc<[Oid]>,
    pub(crate) columns: Option<Arc<[FieldDescription]>>,
}

impl Statement {
    /// Sql text after named parameter rewrite.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Server side name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Parameter names by position, empty for positional sql.
    pub fn param_names(&self) -> &[String] {
        &self.names
    }

    /// Parameter types inferred by the server.
    pub fn param_types(&self) -> &[Oid] {
        &self.params
    }

    /// Result columns, `None` for statements returning no rows.
    pub fn columns(&self) -> Option<&[FieldDescription]> {
        self.columns.as_deref()
    }

    /// Bind parameters and start executing, returns the open portal.
    ///
    /// Parameters are converted to the types the server reported when preparing.
    pub async fn execute(&self, params: Vec<Encoded>) -> Result<Portal> {
        let params = params
            .into_iter()
            .zip(self.params.iter().copied().chain(std::iter::repeat(0)))
            .map(|(param, oid)| param.coerce(oid))
            .collect::<Result<Vec<_>>>()?;
        Portal::prepared(self.conn.clone().into(), self, params).await
    }

    /// Bind named parameters and start executing.
    pub async fn execute_named(&self, params: Vec<(String, Encoded)>) -> Result<Portal> {
        let mut ordered = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let Some((_, value)) = params.iter().find(|(e, _)| e == name) else {
                return Err(crate::Error::config(format!("missing parameter `{name}`")));
            };
            ordered.push(value.clone());
        }
        self.execute(ordered).await
    }

    /// Close the statement on the server and evict it from the cache.
    pub async fn close(self) -> Result<()> {
        self.conn.close_statement(&self.sql, &self.name).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        let a = StatementName::next();
        let b = StatementName::next();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 11);
        assert!(a.as_str().starts_with('q'));
        assert_eq!(StatementName::unnamed().as_str(), "");
        assert!(PortalName::unnamed().is_unnamed());
    }

    #[test]
    fn key_includes_types() {
        assert_eq!(statement_key("SELECT $1", &[23]), statement_key("SELECT $1", &[23]));
        assert_ne!(statement_key("SELECT $1", &[23]), statement_key("SELECT $1", &[20]));
        assert_ne!(statement_key("SELECT 1", &[]), statement_key("SELECT 2", &[]));
    }
}
