//! Query API types.
use std::marker::PhantomData;

use crate::{
    Error, Result, Row,
    encode::Encode,
    executor::Executor,
    portal::{Params, Portal, RowStream},
    row::{FromRow, RowNotFound},
    sql::Sql,
};

/// Entrypoint of the query API.
pub fn query<SQL, Exe, R>(sql: SQL, exe: Exe) -> Query<SQL, Exe, R> {
    Query { sql, exe, params: Params::Positional(vec![]), mixed: false, _p: PhantomData }
}

/// Same as [`query`] with [`Row`] as the output.
pub fn query_row<SQL, Exe>(sql: SQL, exe: Exe) -> Query<SQL, Exe, Row> {
    query(sql, exe)
}

/// Same as [`query`] with [`Row`] as the output.
pub fn execute<SQL, Exe>(sql: SQL, exe: Exe) -> Query<SQL, Exe, Row> {
    query(sql, exe)
}

/// The query API.
///
/// Sql may use positional `$1` placeholders bound with [`bind`][Query::bind], or named `@name`
/// and `:name` placeholders bound with [`bind_named`][Query::bind_named].
#[derive(Debug)]
#[must_use = "query does nothing until fetched or executed"]
pub struct Query<SQL, Exe, R> {
    sql: SQL,
    exe: Exe,
    params: Params,
    mixed: bool,
    _p: PhantomData<R>,
}

impl<SQL, Exe, R> Query<SQL, Exe, R> {
    /// Bind positional query parameter.
    pub fn bind<V: Encode>(mut self, value: V) -> Self {
        match &mut self.params {
            Params::Positional(params) => params.push(value.encode()),
            Params::Named(_) => self.mixed = true,
        }
        self
    }

    /// Bind named query parameter.
    pub fn bind_named<V: Encode>(mut self, name: impl Into<String>, value: V) -> Self {
        match &mut self.params {
            Params::Named(params) => params.push((name.into(), value.encode())),
            Params::Positional(params) if params.is_empty() => {
                self.params = Params::Named(vec![(name.into(), value.encode())]);
            }
            Params::Positional(_) => self.mixed = true,
        }
        self
    }
}

impl<SQL, Exe, R> Query<SQL, Exe, R>
where
    SQL: Sql,
    Exe: Executor,
{
    /// Start executing and return the open [`Portal`].
    pub async fn portal(self) -> Result<Portal> {
        if self.mixed {
            return Err(Error::config("cannot mix positional and named parameters"));
        }
        let conn = self.exe.acquire().await?;
        Portal::start(conn, self.sql.sql(), self.params, self.sql.persistent()).await
    }

    /// Fetch rows using [`Stream`][futures_core::Stream] api.
    ///
    /// Rows of every statement in the sql are yielded in order.
    pub async fn fetch(self) -> Result<RowStream<R>>
    where
        R: FromRow,
    {
        Ok(self.portal().await?.into_stream())
    }

    /// Fetch all rows into [`Vec`].
    pub async fn fetch_all(self) -> Result<Vec<R>>
    where
        R: FromRow,
    {
        let mut portal = self.portal().await?;
        let mut output = vec![];
        while let Some(row) = portal.next_row().await? {
            output.push(R::from_row(row)?);
        }
        Ok(output)
    }

    /// Fetch one row, returns [`RowNotFound`] error when there is none.
    pub async fn fetch_one(self) -> Result<R>
    where
        R: FromRow,
    {
        self.fetch_optional().await?.ok_or_else(|| RowNotFound.into())
    }

    /// Optionally fetch one row.
    ///
    /// The remaining rows are discarded, errors raised after the first row are still returned.
    pub async fn fetch_optional(self) -> Result<Option<R>>
    where
        R: FromRow,
    {
        let mut portal = self.portal().await?;
        let row = portal.next_row().await?;
        portal.finish().await?;
        match row {
            Some(row) => Ok(Some(R::from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Execute statement and return number of rows affected.
    pub async fn execute(self) -> Result<u64> {
        self.portal().await?.finish().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mixed_binding() {
        let q = query::<_, _, ()>("select @a, $1", ()).bind_named("a", 1i32).bind(2i32);
        assert!(q.mixed);

        let q = query::<_, _, ()>("select $1, $2", ()).bind(1i32).bind("b");
        assert!(!q.mixed);
        assert!(matches!(q.params, Params::Positional(ref p) if p.len() == 2));
    }
}
