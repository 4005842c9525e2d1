//! Password protected signing keys.
//!
//! Keyfiles use the Topl JSON layout: every binary field is Base58, the key
//! is derived with scrypt, the secret and public key are encrypted with
//! AES-256-CTR and the MAC is Blake2b-256 over the upper half of the derived
//! key followed by the cipher text.

use std::fs;
use std::path::Path;

use aes::Aes256;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signer as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::topl::{Network, RawTransaction, SignedTransaction};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Blake2b256 = Blake2b<U32>;

const KDF: &str = "scrypt";
const CIPHER: &str = "aes-256-ctr";
const KEY_LEN: usize = 32;

/// Type prefix of ed25519 propositions and proofs on the wire.
pub const ED25519_TYPE_PREFIX: u8 = 3;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Keyfile could not be read: {0}")]
    Io(#[from] std::io::Error),
    #[error("Keyfile is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Keyfile field {field} is not valid Base58: {source}")]
    Encoding {
        field: &'static str,
        source: bs58::decode::Error,
    },
    #[error("Unsupported keyfile: {0}")]
    Unsupported(String),
    #[error("Key derivation failed: {0}")]
    Kdf(String),
    #[error("Wrong keyfile password")]
    BadPassword,
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
    #[error("Address {address} does not belong to the {network:?} network")]
    WrongNetwork { address: String, network: Network },
    #[error("Message to sign is not valid Base58: {0}")]
    Message(bs58::decode::Error),
    #[error("Raw transaction is not a JSON object")]
    MalformedTransaction,
}

/// scrypt cost, as `log2(N)`, `r` and `p`. Topl keyfiles leave it implicit.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            log_n: 18,
            r: 8,
            p: 1,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct CipherParams {
    pub iv: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct KeyfileCrypto {
    pub mac: String,
    pub kdf: String,
    pub cipher_text: String,
    pub kdf_salt: String,
    pub cipher: String,
    pub cipher_params: CipherParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf_params: Option<KdfParams>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Keyfile {
    pub crypto: KeyfileCrypto,
    pub address: String,
}

fn base58(field: &'static str, value: &str) -> Result<Vec<u8>, SignerError> {
    bs58::decode(value)
        .into_vec()
        .map_err(|source| SignerError::Encoding { field, source })
}

fn derive_key(
    password: &str,
    salt: &[u8],
    params: KdfParams,
) -> Result<[u8; KEY_LEN], SignerError> {
    let params = scrypt::Params::new(params.log_n, params.r, params.p, KEY_LEN)
        .map_err(|e| SignerError::Kdf(e.to_string()))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .map_err(|e| SignerError::Kdf(e.to_string()))?;
    Ok(key)
}

fn apply_cipher(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), SignerError> {
    let mut cipher = Aes256Ctr::new_from_slices(key, iv)
        .map_err(|e| SignerError::Unsupported(format!("cipher parameters: {}", e)))?;
    cipher.apply_keystream(data);
    Ok(())
}

fn mac(key: &[u8; KEY_LEN], cipher_text: &[u8]) -> Vec<u8> {
    Blake2b256::new()
        .chain_update(&key[KEY_LEN / 2..])
        .chain_update(cipher_text)
        .finalize()
        .to_vec()
}

/// Network prefix byte of a Base58 Topl address.
pub fn address_prefix(address: &str) -> Result<u8, SignerError> {
    base58("address", address)?
        .first()
        .copied()
        .ok_or_else(|| SignerError::InvalidKey(format!("empty address {}", address)))
}

impl Keyfile {
    pub fn load(path: &Path) -> Result<Self, SignerError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn unlock(&self, password: &str) -> Result<KeyfileSigner, SignerError> {
        let crypto = &self.crypto;
        if crypto.kdf != KDF || crypto.cipher != CIPHER {
            return Err(SignerError::Unsupported(format!(
                "{} with {}",
                crypto.kdf, crypto.cipher
            )));
        }
        let salt = base58("kdfSalt", &crypto.kdf_salt)?;
        let iv = base58("cipherParams.iv", &crypto.cipher_params.iv)?;
        let cipher_text = base58("cipherText", &crypto.cipher_text)?;
        let expected_mac = base58("mac", &crypto.mac)?;

        let key = derive_key(password, &salt, crypto.kdf_params.unwrap_or_default())?;
        if mac(&key, &cipher_text) != expected_mac {
            return Err(SignerError::BadPassword);
        }
        let mut plain = cipher_text;
        apply_cipher(&key, &iv, &mut plain)?;
        if plain.len() != 2 * KEY_LEN {
            return Err(SignerError::InvalidKey(format!(
                "expected {} key bytes, found {}",
                2 * KEY_LEN,
                plain.len()
            )));
        }
        let (secret, stored_public) = plain.split_at(KEY_LEN);
        let secret =
            SecretKey::from_bytes(secret).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let public: PublicKey = (&secret).into();
        if public.as_bytes() != stored_public {
            return Err(SignerError::InvalidKey(
                "public key does not match the secret".to_owned(),
            ));
        }
        Ok(KeyfileSigner {
            address: self.address.clone(),
            keypair: Keypair { secret, public },
        })
    }
}

pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> &str;

    fn sign(&self, raw: &RawTransaction) -> Result<SignedTransaction, SignerError>;
}

pub struct KeyfileSigner {
    address: String,
    keypair: Keypair,
}

impl KeyfileSigner {
    /// Fails unless the key's address was issued for `network`.
    pub fn check_network(&self, network: Network) -> Result<(), SignerError> {
        // PRECONDITION: the first address byte is the network prefix
        if address_prefix(&self.address)? != network.prefix() {
            return Err(SignerError::WrongNetwork {
                address: self.address.clone(),
                network,
            });
        }
        Ok(())
    }
}

fn prefixed(bytes: &[u8]) -> String {
    let mut encoded = Vec::with_capacity(bytes.len() + 1);
    encoded.push(ED25519_TYPE_PREFIX);
    encoded.extend_from_slice(bytes);
    bs58::encode(encoded).into_string()
}

impl TransactionSigner for KeyfileSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, raw: &RawTransaction) -> Result<SignedTransaction, SignerError> {
        let message = bs58::decode(&raw.message_to_sign)
            .into_vec()
            .map_err(SignerError::Message)?;
        let signature = self.keypair.sign(&message);
        let mut tx = raw.raw_tx.clone();
        let fields = tx.as_object_mut().ok_or(SignerError::MalformedTransaction)?;
        let mut signatures = serde_json::Map::new();
        signatures.insert(
            prefixed(self.keypair.public.as_bytes()),
            Value::String(prefixed(&signature.to_bytes())),
        );
        // POSTCONDITION: the proposition maps to its proof
        fields.insert("signatures".to_owned(), Value::Object(signatures));
        Ok(SignedTransaction { tx })
    }
}


#[cfg(test)]
mod test {
    use super::seal::*;
    use super::*;
    use ed25519_dalek::{Signature, Verifier};
    use serde_json::json;

    const SECRET: [u8; 32] = [7u8; 32];

    fn keyfile() -> Keyfile {
        seal(&address_for(Network::ValhallaTestNet), &SECRET, "hunter2")
    }

    fn public_key() -> PublicKey {
        (&SecretKey::from_bytes(&SECRET).unwrap()).into()
    }

    #[test]
    fn unlock_with_the_right_password() {
        let signer = keyfile().unlock("hunter2").unwrap();
        assert_eq!(signer.address(), address_for(Network::ValhallaTestNet));
        assert_eq!(signer.keypair.public, public_key());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let result = keyfile().unlock("hunter3");
        assert!(matches!(result, Err(SignerError::BadPassword)));
    }

    #[test]
    fn keyfile_uses_the_topl_json_layout() {
        let encoded = serde_json::to_value(keyfile()).unwrap();
        assert_eq!(encoded["crypto"]["kdf"], json!("scrypt"));
        assert_eq!(encoded["crypto"]["cipher"], json!("aes-256-ctr"));
        assert!(encoded["crypto"]["cipherParams"]["iv"].is_string());
        assert!(encoded["crypto"]["kdfSalt"].is_string());
    }

    #[test]
    fn keyfile_without_cost_parameters_uses_topl_defaults() {
        let mut raw = serde_json::to_value(keyfile()).unwrap();
        raw["crypto"].as_object_mut().unwrap().remove("kdfParams");
        let keyfile: Keyfile = serde_json::from_value(raw).unwrap();
        assert_eq!(keyfile.crypto.kdf_params, None);
        assert_eq!(keyfile.crypto.kdf_params.unwrap_or_default(), KdfParams::default());
    }

    #[test]
    fn keyfile_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        std::fs::write(&path, serde_json::to_string_pretty(&keyfile()).unwrap()).unwrap();
        assert_eq!(Keyfile::load(&path).unwrap(), keyfile());
    }

    #[test]
    fn missing_keyfile_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Keyfile::load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(SignerError::Io(_))));
    }

    #[test]
    fn other_ciphers_are_unsupported() {
        let mut keyfile = keyfile();
        keyfile.crypto.cipher = "aes-128-cbc".to_owned();
        assert!(matches!(
            keyfile.unlock("hunter2"),
            Err(SignerError::Unsupported(_))
        ));
    }

    #[test]
    fn address_must_match_the_network() {
        let signer = keyfile().unlock("hunter2").unwrap();
        assert!(signer.check_network(Network::ValhallaTestNet).is_ok());
        assert!(matches!(
            signer.check_network(Network::PrivateTestNet),
            Err(SignerError::WrongNetwork { .. })
        ));
    }

    #[test]
    fn base58_message_is_signed_under_the_prefixed_proposition() {
        let signer = keyfile().unlock("hunter2").unwrap();
        let message = b"transfer 100 polys";
        let raw = RawTransaction {
            raw_tx: json!({"fee": "10"}),
            message_to_sign: bs58::encode(message).into_string(),
        };
        let signed = signer.sign(&raw).unwrap();

        assert_eq!(signed.tx["fee"], json!("10"));
        let mut proposition = vec![ED25519_TYPE_PREFIX];
        proposition.extend_from_slice(public_key().as_bytes());
        let key = bs58::encode(proposition).into_string();
        let proof = signed.tx["signatures"][&key].as_str().unwrap();
        let bytes = bs58::decode(proof).into_vec().unwrap();
        assert_eq!(bytes[0], ED25519_TYPE_PREFIX);
        let signature = Signature::try_from(&bytes[1..]).unwrap();
        assert!(public_key().verify(message, &signature).is_ok());
    }

    #[test]
    fn base64_message_is_rejected() {
        let signer = keyfile().unlock("hunter2").unwrap();
        let raw = RawTransaction {
            raw_tx: json!({}),
            message_to_sign: "dHJhbnNmZXI=".to_owned(),
        };
        assert!(matches!(signer.sign(&raw), Err(SignerError::Message(_))));
    }

    #[test]
    fn non_object_raw_tx_cannot_be_signed() {
        let signer = keyfile().unlock("hunter2").unwrap();
        let raw = RawTransaction {
            raw_tx: json!("not an object"),
            message_to_sign: bs58::encode(b"m").into_string(),
        };
        assert!(matches!(
            signer.sign(&raw),
            Err(SignerError::MalformedTransaction)
        ));
    }
}
