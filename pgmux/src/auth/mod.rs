//! Authentication negotiation.
//!
//! [`Authenticator`] consumes each authentication request the server sends during startup and
//! produces the matching response. Supported methods are cleartext password, MD5 and SCRAM-SHA-256.
use std::{borrow::Cow, fmt};

use crate::{
    postgres::{
        DatabaseError,
        backend::Authentication,
        frontend::{PasswordMessage, SaslInitialResponse, SaslResponse},
    },
    transport::PgTransport,
};

mod md5;
mod pbkdf2;
mod scram;

pub use md5::md5_password;
pub use pbkdf2::pbkdf2_hmac_sha256;
pub use scram::{SCRAM_SHA_256, ScramClient};

/// Overwrite buffer with zeros in a way the optimizer keeps.
pub(crate) fn scrub(buf: &mut [u8]) {
    buf.fill(0);
    std::hint::black_box(buf);
}

/// Drives the authentication exchange for one startup.
pub struct Authenticator<'a> {
    user: &'a str,
    password: Option<&'a str>,
    scram: Option<ScramClient>,
}

/// Outcome of one authentication request.
#[derive(Debug)]
pub enum AuthStep {
    /// Authentication succeeded.
    Done,
    /// Send the response and wait for next request.
    Respond(AuthResponse),
    /// Nothing to send, wait for next request.
    Wait,
}

/// A response to authentication request.
pub enum AuthResponse {
    Password(String),
    SaslInitial {
        mechanism: &'static str,
        data: Vec<u8>,
    },
    Sasl(Vec<u8>),
}

impl AuthResponse {
    /// Buffer the response as frontend message.
    pub fn send<IO: PgTransport>(&self, io: &mut IO) {
        match self {
            AuthResponse::Password(password) => io.send(PasswordMessage { password }),
            AuthResponse::SaslInitial { mechanism, data } => {
                io.send(SaslInitialResponse { mechanism, data })
            }
            AuthResponse::Sasl(data) => io.send(SaslResponse { data }),
        }
    }
}

impl Drop for AuthResponse {
    fn drop(&mut self) {
        match self {
            AuthResponse::Password(password) => scrub(&mut std::mem::take(password).into_bytes()),
            AuthResponse::SaslInitial { data, .. } | AuthResponse::Sasl(data) => scrub(data),
        }
    }
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthResponse::Password(_) => f.write_str("Password(..)"),
            AuthResponse::SaslInitial { mechanism, .. } => write!(f, "SaslInitial({mechanism})"),
            AuthResponse::Sasl(_) => f.write_str("Sasl(..)"),
        }
    }
}

impl<'a> Authenticator<'a> {
    pub fn new(user: &'a str, password: Option<&'a str>) -> Self {
        Self { user, password, scram: None }
    }

    /// Handle one authentication request.
    pub fn step(&mut self, request: Authentication) -> Result<AuthStep, AuthError> {
        match request {
            Authentication::Ok => {
                if self.scram.as_ref().is_some_and(|e| !e.is_done()) {
                    return Err(AuthError::Scram("server completed without SASL final message".into()));
                }
                Ok(AuthStep::Done)
            }
            Authentication::CleartextPassword => {
                let password = self.password()?;
                Ok(AuthStep::Respond(AuthResponse::Password(password.to_owned())))
            }
            Authentication::MD5Password { salt } => {
                let password = self.password()?;
                Ok(AuthStep::Respond(AuthResponse::Password(md5_password(self.user, password, salt))))
            }
            Authentication::SASL { mechanisms } => {
                if !mechanisms.iter().any(|e| e == SCRAM_SHA_256) {
                    return Err(AuthError::UnsupportedMechanism(mechanisms));
                }
                let scram = ScramClient::new("", self.password()?);
                let data = scram.client_first();
                self.scram = Some(scram);
                Ok(AuthStep::Respond(AuthResponse::SaslInitial { mechanism: SCRAM_SHA_256, data }))
            }
            Authentication::SASLContinue { data } => {
                let Some(scram) = self.scram.as_mut() else {
                    return Err(AuthError::Scram("SASL continue before SASL start".into()));
                };
                Ok(AuthStep::Respond(AuthResponse::Sasl(scram.server_first(&data)?)))
            }
            Authentication::SASLFinal { data } => {
                let Some(scram) = self.scram.as_mut() else {
                    return Err(AuthError::Scram("SASL final before SASL start".into()));
                };
                scram.server_final(&data)?;
                Ok(AuthStep::Wait)
            }
            other => Err(AuthError::Unsupported(other.method_name())),
        }
    }

    fn password(&self) -> Result<&'a str, AuthError> {
        self.password.ok_or(AuthError::MissingPassword)
    }
}

/// Authentication failure.
pub enum AuthError {
    /// Server requested a password but none configured.
    MissingPassword,
    /// Server requested an unsupported authentication method.
    Unsupported(&'static str),
    /// None of the SASL mechanisms offered by server is supported.
    UnsupportedMechanism(Vec<String>),
    /// Malformed or out of order SCRAM exchange.
    Scram(Cow<'static, str>),
    /// Server failed to prove knowledge of the password.
    ServerSignature,
    /// Server rejected the credentials.
    Rejected(DatabaseError),
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingPassword => f.write_str("server requested a password but none was provided"),
            AuthError::Unsupported(method) => write!(f, "unsupported authentication method: {method}"),
            AuthError::UnsupportedMechanism(m) => write!(f, "unsupported SASL mechanisms: {}", m.join(", ")),
            AuthError::Scram(reason) => write!(f, "SCRAM exchange failed: {reason}"),
            AuthError::ServerSignature => f.write_str("SCRAM server signature mismatch"),
            AuthError::Rejected(err) => write!(f, "authentication rejected: {err}"),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cleartext() {
        let mut auth = Authenticator::new("alice", Some("pw"));
        let step = auth.step(Authentication::CleartextPassword).unwrap();
        let AuthStep::Respond(AuthResponse::Password(pw)) = &step else {
            panic!("expected password")
        };
        assert_eq!(pw, "pw");
        assert!(matches!(auth.step(Authentication::Ok).unwrap(), AuthStep::Done));
    }

    #[test]
    fn missing_password() {
        let mut auth = Authenticator::new("alice", None);
        let err = auth.step(Authentication::MD5Password { salt: [0; 4] }).unwrap_err();
        assert!(matches!(err, AuthError::MissingPassword));
    }

    #[test]
    fn unsupported() {
        let mut auth = Authenticator::new("alice", Some("pw"));
        assert!(matches!(auth.step(Authentication::GSS), Err(AuthError::Unsupported("gssapi"))));
        let err = auth.step(Authentication::SASL { mechanisms: vec!["OAUTHBEARER".into()] }).unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedMechanism(_)));
    }

    #[test]
    fn ok_before_sasl_final() {
        let mut auth = Authenticator::new("alice", Some("pw"));
        auth.step(Authentication::SASL { mechanisms: vec![SCRAM_SHA_256.into()] }).unwrap();
        assert!(auth.step(Authentication::Ok).is_err());
    }
}
