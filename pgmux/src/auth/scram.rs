//! SCRAM-SHA-256 client, RFC 5802 and RFC 7677, without channel binding.
//!
//! ```text
//! client-first  n,,n=<user>,r=<client nonce>
//! server-first  r=<client nonce + server nonce>,s=<base64 salt>,i=<iterations>
//! client-final  c=biws,r=<nonce>,p=<base64 proof>
//! server-final  v=<base64 server signature>
//! ```
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use rand::distr::{Alphanumeric, SampleString};
use sha2::{Digest, Sha256};
use std::borrow::Cow;

use super::{AuthError, pbkdf2::pbkdf2_hmac_sha256, scrub};

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name advertised by the server.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Length of generated client nonce.
const NONCE_LEN: usize = 24;

/// gs2 header `n,,` in base64, no channel binding.
const CHANNEL_BINDING: &str = "c=biws";

const KEY_LEN: usize = 32;

enum State {
    Initial,
    /// client-final sent, waiting for server signature.
    Final {
        server_key: [u8; KEY_LEN],
        auth_message: String,
    },
    Done,
}

/// SCRAM-SHA-256 exchange state.
///
/// Password and derived keys are zeroed on drop.
pub struct ScramClient {
    password: Vec<u8>,
    client_first_bare: String,
    nonce: String,
    state: State,
}

impl ScramClient {
    /// Create client with random nonce.
    ///
    /// Postgres ignores the SCRAM user name in favor of the startup user, so it may be empty.
    pub fn new(user: &str, password: &str) -> ScramClient {
        let nonce = Alphanumeric.sample_string(&mut rand::rng(), NONCE_LEN);
        Self::with_nonce(user, password, nonce)
    }

    pub(crate) fn with_nonce(user: &str, password: &str, nonce: String) -> ScramClient {
        let password = match stringprep::saslprep(password) {
            Ok(prepared) => prepared.into_owned().into_bytes(),
            // postgres falls back to the raw password when it is not valid for SASLprep
            Err(_) => password.as_bytes().to_vec(),
        };
        let client_first_bare = format!("n={},r={nonce}", escape_user(user));
        Self { password, client_first_bare, nonce, state: State::Initial }
    }

    /// The client-first message.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consume server-first message, returns client-final message.
    pub fn server_first(&mut self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        if !matches!(self.state, State::Initial) {
            return Err(scram_error("unexpected server-first message"));
        }

        let server_first = std::str::from_utf8(data).map_err(|_| scram_error("server-first is not utf8"))?;
        let mut parts = server_first.split(',');

        let nonce = attribute(parts.next(), 'r')?;
        let salt = attribute(parts.next(), 's')?;
        let iterations = attribute(parts.next(), 'i')?;

        if !nonce.starts_with(&self.nonce) || nonce.len() <= self.nonce.len() {
            return Err(scram_error("server nonce does not extend client nonce"));
        }
        let salt = STANDARD.decode(salt).map_err(|_| scram_error("invalid salt encoding"))?;
        let iterations: u32 = match iterations.parse() {
            Ok(n) if n > 0 => n,
            _ => return Err(scram_error("invalid iteration count")),
        };

        let mut salted = [0u8; KEY_LEN];
        pbkdf2_hmac_sha256(&self.password, &salt, iterations, &mut salted);

        let mut client_key = hmac(&salted, b"Client Key");
        let mut stored_key = [0u8; KEY_LEN];
        stored_key.copy_from_slice(&Sha256::digest(client_key));
        let server_key = hmac(&salted, b"Server Key");
        scrub(&mut salted);

        let without_proof = format!("{CHANNEL_BINDING},r={nonce}");
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);

        let mut signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        proof.iter_mut().zip(signature).for_each(|(p, s)| *p ^= s);

        let client_final = format!("{without_proof},p={}", STANDARD.encode(proof)).into_bytes();

        scrub(&mut client_key);
        scrub(&mut stored_key);
        scrub(&mut signature);
        scrub(&mut proof);

        self.state = State::Final { server_key, auth_message };
        Ok(client_final)
    }

    /// Verify server-final message.
    pub fn server_final(&mut self, data: &[u8]) -> Result<(), AuthError> {
        let State::Final { server_key, auth_message } = &self.state else {
            return Err(scram_error("unexpected server-final message"));
        };

        let server_final = std::str::from_utf8(data).map_err(|_| scram_error("server-final is not utf8"))?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(scram_error(format!("server error: {err}")));
        }

        let verifier = attribute(server_final.split(',').next(), 'v')?;
        let verifier = STANDARD.decode(verifier).map_err(|_| scram_error("invalid verifier encoding"))?;

        let mut mac = HmacSha256::new_from_slice(server_key).expect("HMAC can take key of any size");
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&verifier).map_err(|_| AuthError::ServerSignature)?;

        self.finish();
        Ok(())
    }

    /// Returns `true` once server signature has been verified.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn finish(&mut self) {
        if let State::Final { server_key, .. } = &mut self.state {
            scrub(server_key);
        }
        self.state = State::Done;
    }
}

impl Drop for ScramClient {
    fn drop(&mut self) {
        self.finish();
        scrub(&mut self.password);
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; KEY_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn attribute(part: Option<&str>, name: char) -> Result<&str, AuthError> {
    let Some(part) = part else {
        return Err(scram_error(format!("missing attribute `{name}`")));
    };
    match part.strip_prefix(name).and_then(|e| e.strip_prefix('=')) {
        Some(value) => Ok(value),
        None => Err(scram_error(format!("expected attribute `{name}`"))),
    }
}

fn escape_user(user: &str) -> Cow<'_, str> {
    if user.contains(['=', ',']) {
        Cow::Owned(user.replace('=', "=3D").replace(',', "=2C"))
    } else {
        Cow::Borrowed(user)
    }
}

fn scram_error(reason: impl Into<Cow<'static, str>>) -> AuthError {
    AuthError::Scram(reason.into())
}
