//! Multiplexing Postgres Driver
//!
//! One physical connection carries several open portals at once. Writes of each command are
//! serialized, reads are demultiplexed by a reader task so every portal can be consumed at its
//! own pace.
//!
//! # Examples
//!
//! Single connection:
//!
//! ```no_run
//! use pgmux::Connection;
//!
//! # async fn app() -> pgmux::Result<()> {
//! let conn = Connection::connect_env().await?;
//!
//! let res = pgmux::query::<_, _, (i32,String)>("SELECT 420,$1", &conn)
//!     .bind("Foo")
//!     .fetch_one()
//!     .await?;
//!
//! assert_eq!(res.0,420);
//! assert_eq!(res.1.as_str(),"Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Two portals on one connection:
//!
//! ```no_run
//! # async fn app(conn: pgmux::Connection) -> pgmux::Result<()> {
//! let mut users = pgmux::query_row("SELECT id FROM users", &conn).portal().await?;
//! let mut posts = pgmux::query_row("SELECT id FROM posts WHERE author = @id", &conn)
//!     .bind_named("id", 7)
//!     .portal()
//!     .await?;
//!
//! while let (Some(user), Some(post)) = (users.fetch_next().await?, posts.fetch_next().await?) {
//!     println!("{user:?} {post:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Database Pooling:
//!
//! ```no_run
//! use pgmux::Pool;
//!
//! # async fn app() -> pgmux::Result<()> {
//! let pool = Pool::connect("Host=localhost;Username=app;Max Pool Size=4").await?;
//!
//! pgmux::execute("CREATE TEMP TABLE foo(id int)", &pool)
//!     .execute()
//!     .await?;
//!
//! let tx = pool.begin().await?;
//! pgmux::execute("INSERT INTO foo(id) VALUES($1)", &tx)
//!     .bind(1)
//!     .execute()
//!     .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
mod net;
mod ext;

// Protocol
pub mod postgres;
pub mod auth;

// Encoding
pub mod types;
pub mod encode;

// Component
mod statement;
pub mod sql;
pub mod row;
pub mod portal;
mod mars;

// Operation
pub mod transport;
pub mod executor;
pub mod query;
pub mod transaction;

// Connection
pub mod connection;
pub mod pool;

mod error;

#[cfg(test)]
mod mock;

pub use encode::{Encode, Encoded};
pub use row::{Row, FromRow, Decode, DecodeError};
pub use sql::SqlExt;
pub use types::Value;

pub use executor::Executor;
pub use connection::{Connection, Config, CancelToken, ConnectionState};
pub use statement::Statement;
pub use portal::Portal;
pub use transaction::{Transaction, Isolation};
pub use pool::{Pool, PoolConfig, PoolRegistry, PooledConnection};
#[doc(inline)]
pub use query::{query, query_row, execute};
pub use error::{Error, ErrorKind, Result};
