//! NIP-04 encrypted payloads, used to hand the payment preimage to the
//! counterpart of an outbound transaction.

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use secp256k1::{ecdh, Parity, PublicKey, SecretKey, XOnlyPublicKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// Derive the shared AES key between `secret` and the hex x-only `pubkey`.
fn shared_key(secret: &SecretKey, pubkey_hex: &str) -> Result<[u8; 32]> {
    let xonly = XOnlyPublicKey::from_slice(&hex::decode(pubkey_hex)?)?;
    let public = PublicKey::from_x_only_public_key(xonly, Parity::Even);
    let point = ecdh::shared_secret_point(&public, secret);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

/// Encrypt `plaintext` for `pubkey_hex`, returning `<base64>?iv=<base64>`.
pub fn encrypt(secret: &SecretKey, pubkey_hex: &str, plaintext: &str) -> Result<String> {
    let key = shared_key(secret, pubkey_hex)?;
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!(
        "{}?iv={}",
        STANDARD.encode(ciphertext),
        STANDARD.encode(iv)
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aes::cipher::BlockDecryptMut;
    use anyhow::anyhow;

    use crate::event::tests::test_keys;

    type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

    /// Decrypt a payload produced by [`encrypt`] by the holder of `pubkey_hex`.
    pub(crate) fn decrypt(secret: &SecretKey, pubkey_hex: &str, payload: &str) -> Result<String> {
        let (data, iv) = payload
            .split_once("?iv=")
            .ok_or_else(|| anyhow!("missing iv"))?;
        let ciphertext = STANDARD.decode(data)?;
        let iv: [u8; 16] = STANDARD
            .decode(iv)?
            .try_into()
            .map_err(|_| anyhow!("iv must be 16 bytes"))?;
        let key = shared_key(secret, pubkey_hex)?;
        let plain = Aes256CbcDec::new(&key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| anyhow!("bad padding"))?;
        Ok(String::from_utf8(plain)?)
    }

    #[test]
    fn counterpart_can_decrypt() {
        let service = test_keys(3);
        let user = test_keys(4);
        let payload = encrypt(service.secret(), user.public_hex(), "abc123").unwrap();
        assert!(payload.contains("?iv="));
        let plain = decrypt(user.secret(), service.public_hex(), &payload).unwrap();
        assert_eq!(plain, "abc123");
    }

    #[test]
    fn third_party_cannot_decrypt() {
        let service = test_keys(3);
        let user = test_keys(4);
        let other = test_keys(5);
        let payload = encrypt(service.secret(), user.public_hex(), "abc123").unwrap();
        let res = decrypt(other.secret(), service.public_hex(), &payload);
        assert!(res.map(|p| p != "abc123").unwrap_or(true));
    }

    #[test]
    fn rejects_payload_without_iv() {
        let service = test_keys(3);
        let user = test_keys(4);
        assert!(decrypt(user.secret(), service.public_hex(), "Zm9v").is_err());
    }
}
