use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use super::Config;
use crate::{
    Result,
    net::Socket,
    postgres::{backend::BackendKeyData, frontend::CancelRequest},
};

/// Handle to cancel the command currently running on a connection.
///
/// Cancellation is best effort, the server may finish the command before it notices the request.
/// The canceled command fails with SQLSTATE `57014`, surfaced as
/// [`ErrorKind::Cancelled`][crate::error::ErrorKind::Cancelled].
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: String,
    port: u16,
    socket: Option<String>,
    key: BackendKeyData,
}

impl CancelToken {
    pub(crate) fn new(config: &Config, key: BackendKeyData) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            socket: config.socket.clone(),
            key,
        }
    }

    /// Backend process id of the target connection.
    pub fn process_id(&self) -> u32 {
        self.key.process_id
    }

    /// Send the cancel request on a new, short lived connection.
    ///
    /// No response is read, the server closes the connection after reading the request.
    pub async fn cancel(&self) -> Result<()> {
        let mut socket = match &self.socket {
            Some(dir) => Socket::connect_socket(dir, self.port).await?,
            None => Socket::connect_tcp(&self.host, self.port).await?,
        };

        let mut buf = BytesMut::with_capacity(CancelRequest::LEN as usize);
        CancelRequest {
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        socket.flush().await?;
        socket.shutdown().await?;

        #[cfg(feature = "log")]
        log::debug!("cancel request sent to backend {}", self.key.process_id);

        Ok(())
    }
}
