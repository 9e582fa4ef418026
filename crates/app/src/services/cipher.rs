//! Key generation and the challenge-response primitive.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroize;

use bandlink_domain::key::{AuthKey, KEY_LEN};

use crate::protocol::codec::CHALLENGE_LEN;

/// Draw a fresh key from the operating system's CSPRNG.
#[must_use]
pub fn generate_key() -> AuthKey {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    let key = AuthKey::new(bytes);
    bytes.zeroize();
    key
}

/// Answer a pairing challenge: AES-128-ECB of the single challenge block.
#[must_use]
pub fn respond(key: &AuthKey, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(challenge);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(&block);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_match_fips_197_vector() {
        let key = AuthKey::new([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ]);
        let challenge = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        assert_eq!(
            respond(&key, &challenge),
            [
                0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
                0xc5, 0x5a
            ]
        );
    }

    #[test]
    fn should_generate_distinct_keys() {
        assert_ne!(generate_key(), generate_key());
    }

    #[test]
    fn should_depend_on_key() {
        let challenge = [7u8; CHALLENGE_LEN];
        let a = respond(&AuthKey::new([1; KEY_LEN]), &challenge);
        let b = respond(&AuthKey::new([2; KEY_LEN]), &challenge);
        assert_ne!(a, b);
    }
}
