//! `md5` password challenge.
use md5::{Digest, Md5};
use std::fmt::Write;

/// Compute the response for an MD5 password request.
///
/// The response is `"md5"` followed by the hex of `md5(hex(md5(password + user)) + salt)`.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let mut inner = hex(&md5.finalize_reset()).into_bytes();

    md5.update(&inner);
    md5.update(salt);
    super::scrub(&mut inner);

    format!("md5{}", hex(&md5.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            md5_password("postgres", "mysecretpassword", *b"abcd"),
            "md5acd5aad79098556ede381bf1229370bb",
        );
        assert_eq!(
            md5_password("alice", "secret", [1, 2, 3, 4]),
            "md598a0412b9c31436fc53776e863350083",
        );
    }

    #[test]
    fn salt_changes_output() {
        let a = md5_password("alice", "secret", [0; 4]);
        let b = md5_password("alice", "secret", [0, 0, 0, 1]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 3 + 32);
    }
}
