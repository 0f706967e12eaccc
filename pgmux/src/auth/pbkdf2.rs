//! PBKDF2 with HMAC-SHA-256 as the pseudorandom function, RFC 8018 section 5.2.
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::scrub;

type HmacSha256 = Hmac<Sha256>;

const BLOCK_LEN: usize = 32;

/// Derive `out.len()` bytes of key from `password` and `salt`.
///
/// Intermediate blocks are zeroed before returning.
pub fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    let prf = HmacSha256::new_from_slice(password).expect("HMAC can take key of any size");

    for (i, chunk) in out.chunks_mut(BLOCK_LEN).enumerate() {
        let block = i as u32 + 1;

        let mut mac = prf.clone();
        mac.update(salt);
        mac.update(&block.to_be_bytes());

        let mut u = [0u8; BLOCK_LEN];
        u.copy_from_slice(&mac.finalize().into_bytes());
        let mut t = u;

        for _ in 1..iterations {
            let mut mac = prf.clone();
            mac.update(&u);
            u.copy_from_slice(&mac.finalize().into_bytes());
            t.iter_mut().zip(u).for_each(|(t, u)| *t ^= u);
        }

        chunk.copy_from_slice(&t[..chunk.len()]);

        scrub(&mut u);
        scrub(&mut t);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn derive(password: &[u8], salt: &[u8], iterations: u32, len: usize) -> String {
        let mut out = vec![0; len];
        pbkdf2_hmac_sha256(password, salt, iterations, &mut out);
        out.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn single_block_vectors() {
        assert_eq!(
            derive(b"password", b"salt", 1, 32),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b",
        );
        assert_eq!(
            derive(b"password", b"salt", 2, 32),
            "ae4d0c95af6b46d32d0adff928f06dd02a303f8ef3c251dfd6e2d85a95474c43",
        );
        assert_eq!(
            derive(b"password", b"salt", 4096, 32),
            "c5e478d59288c841aa530db6845c4c8d962893a001ce4e11a4963873aa98134a",
        );
    }

    #[test]
    fn multi_block_vectors() {
        assert_eq!(
            derive(b"passwd", b"salt", 1, 64),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc\
             49ca9cccf179b645991664b39d77ef317c71b845b1e30bd509112041d3a19783",
        );
        assert_eq!(
            derive(b"passwordPASSWORDpassword", b"saltSALTsaltSALTsaltSALTsaltSALTsalt", 4096, 40),
            "348c89dbcbd32b2f32d814b8116e84cf2b17347ebc1800181c4e2a1fb8dd53e1c635518c7dac47e9",
        );
    }
}
