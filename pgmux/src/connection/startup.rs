use std::collections::HashMap;

use super::Config;
use crate::{
    Error, Result,
    auth::{AuthError, AuthStep, Authenticator},
    common::verbose,
    error::ErrorKind,
    postgres::{
        BackendMessage,
        backend::{Authentication, BackendKeyData},
        frontend,
    },
    transport::{PgTransport, PgTransportExt},
};

/// Startup phase successful response.
#[derive(Debug)]
pub struct StartupResponse {
    /// Secret-key data required to issue cancel requests later.
    ///
    /// Some poolers in front of postgres never send it.
    pub backend_key_data: Option<BackendKeyData>,
    /// Initial setting of backend parameters, such as `client_encoding` or `server_version`.
    pub params: HashMap<String, String>,
    /// Newest minor protocol version the server supports, when it declined ours.
    pub minor_version: Option<u32>,
}

/// Perform startup and authentication.
///
/// <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
pub async fn startup<IO: PgTransport>(config: &Config, mut io: IO) -> Result<StartupResponse> {
    let mut params = vec![("client_encoding", "UTF8")];
    if let Some(name) = &config.application_name {
        params.push(("application_name", name));
    }

    io.send_startup(frontend::Startup {
        user: &config.user,
        database: Some(config.database()),
        replication: None,
        params: &params,
    });
    io.flush().await?;

    // One request and one response for cleartext and md5, several round trips for SASL.

    let mut auth = Authenticator::new(&config.user, config.password.as_deref());

    loop {
        let request = match io.recv::<Authentication>().await {
            Ok(ok) => ok,
            Err(err) => return Err(rejected(err)),
        };
        verbose!(method = request.method_name(), "authentication request");

        match auth.step(request)? {
            AuthStep::Done => break,
            AuthStep::Respond(response) => {
                response.send(&mut io);
                io.flush().await?;
            }
            AuthStep::Wait => {}
        }
    }

    // After AuthenticationOk the backend process is being started, it may still fail with
    // ErrorResponse or decline our minor protocol version.

    let mut response = StartupResponse {
        backend_key_data: None,
        params: HashMap::new(),
        minor_version: None,
    };

    loop {
        match io.recv().await? {
            BackendMessage::ReadyForQuery(_) => break,
            BackendMessage::BackendKeyData(key) => response.backend_key_data = Some(key),
            BackendMessage::ParameterStatus(param) => {
                response.params.insert(param.name, param.value);
            }
            BackendMessage::NegotiateProtocolVersion(v) => response.minor_version = Some(v.minor),
            f => Err(f.unexpected("startup phase"))?,
        }
    }

    Ok(response)
}

/// Server rejection during authentication is an authentication error.
fn rejected(err: Error) -> Error {
    match err.into_kind() {
        ErrorKind::Database(db) if db.is_auth_failure() => AuthError::Rejected(db).into(),
        kind => kind.into(),
    }
}
