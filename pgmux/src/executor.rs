//! The [`Executor`] trait.
use std::ops::Deref;

use crate::{
    Connection, Result,
    pool::{Pool, PooledConnection},
    transaction::Transaction,
};

/// A type that can hand out a connection to run a command on.
pub trait Executor {
    /// Acquire the connection.
    fn acquire(self) -> impl Future<Output = Result<Acquired>> + Send;
}

/// Connection held for the duration of one command.
///
/// A pooled connection returns to its pool when this is dropped.
#[derive(Debug)]
pub enum Acquired {
    Connection(Connection),
    Pooled(PooledConnection),
}

impl Deref for Acquired {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            Acquired::Connection(conn) => conn,
            Acquired::Pooled(conn) => conn,
        }
    }
}

impl From<Connection> for Acquired {
    fn from(value: Connection) -> Self {
        Self::Connection(value)
    }
}

impl From<PooledConnection> for Acquired {
    fn from(value: PooledConnection) -> Self {
        Self::Pooled(value)
    }
}

impl Executor for &Connection {
    fn acquire(self) -> impl Future<Output = Result<Acquired>> + Send {
        std::future::ready(Ok(self.clone().into()))
    }
}

impl Executor for Connection {
    fn acquire(self) -> impl Future<Output = Result<Acquired>> + Send {
        std::future::ready(Ok(self.into()))
    }
}

impl Executor for &PooledConnection {
    fn acquire(self) -> impl Future<Output = Result<Acquired>> + Send {
        // shares the checked out connection, the lease stays with `self`
        std::future::ready(Ok(Connection::clone(self).into()))
    }
}

impl Executor for PooledConnection {
    fn acquire(self) -> impl Future<Output = Result<Acquired>> + Send {
        std::future::ready(Ok(self.into()))
    }
}

impl Executor for &Pool {
    async fn acquire(self) -> Result<Acquired> {
        Ok(Pool::acquire(self).await?.into())
    }
}

impl Executor for &Transaction {
    fn acquire(self) -> impl Future<Output = Result<Acquired>> + Send {
        std::future::ready(Ok(self.connection().clone().into()))
    }
}
