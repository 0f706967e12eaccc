//! The [`Transaction`] type.
use crate::{Connection, Result, executor::Acquired};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    fn as_sql(&self) -> &'static str {
        match self {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        }
    }
}

/// An RAII implementation of transaction scope.
///
/// To begin a transaction, use [`Connection::begin`] or [`Pool::begin`][crate::Pool::begin].
///
/// To commit transaction, use [`Transaction::commit`].
///
/// If not commited, when this structure is dropped, transaction will be rolled back. The
/// `ROLLBACK` is sent before the next command on the connection, so a pooled connection is clean
/// when handed out again.
///
/// # Example
///
/// ```no_run
/// # async fn test(conn: pgmux::Connection) -> pgmux::Result<()> {
/// let tx = conn.begin().await?;
///
/// pgmux::execute("insert into post(name) values('foo')", &tx)
///     .execute()
///     .await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Transaction {
    conn: Acquired,
    done: bool,
}

impl Transaction {
    pub(crate) async fn begin(conn: Acquired, isolation: Option<Isolation>) -> Result<Transaction> {
        let sql = match isolation {
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
            None => "BEGIN".to_owned(),
        };
        conn.simple_query(&sql).await?;
        Ok(Transaction { conn, done: false })
    }

    /// Returns the underlying [`Connection`].
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Commit transaction.
    ///
    /// If the transaction already failed, the server answers `COMMIT` with a rollback.
    pub async fn commit(mut self) -> Result<()> {
        let result = self.conn.commit().await;
        self.done = true;
        result
    }

    /// Roll back transaction.
    pub async fn rollback(mut self) -> Result<()> {
        let result = self.conn.rollback().await;
        self.done = true;
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            self.conn.mux().schedule_rollback();
        }
    }
}

#[cfg(test)]
mod test {
    use super::Isolation;
    use crate::mock::MockServer;

    #[test]
    fn isolation_sql() {
        assert_eq!(Isolation::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(Isolation::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[tokio::test]
    async fn commit_and_isolation() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;

        let tx = conn.begin_with(Isolation::Serializable).await.unwrap();
        assert_eq!(tx.connection().mux().tx_status(), b'T');
        crate::execute("INSERT INTO t VALUES (1)", &tx).execute().await.unwrap();
        tx.commit().await.unwrap();

        let log = server.log();
        assert_eq!(log.queries("BEGIN ISOLATION LEVEL SERIALIZABLE"), 1);
        assert_eq!(log.queries("COMMIT"), 1);
        assert_eq!(log.queries("ROLLBACK"), 0);
        assert_eq!(conn.mux().tx_status(), b'I');
    }

    #[tokio::test]
    async fn drop_schedules_rollback() {
        let server = MockServer::trust().await;
        let conn = server.connect().await;

        let tx = conn.begin().await.unwrap();
        let err = crate::execute("SELECT fail", &tx).execute().await.unwrap_err();
        assert_eq!(err.code(), Some("22012"));
        drop(tx);
        assert!(conn.mux().needs_reset());
        assert_eq!(server.log().queries("ROLLBACK"), 0);

        let rows = crate::query::<_, _, (i32,)>("SELECT b", &conn).fetch_all().await.unwrap();
        assert_eq!(rows, [(10,), (20,)]);
        assert_eq!(server.log().queries("ROLLBACK"), 1);
        assert!(!conn.mux().needs_reset());
    }
}
