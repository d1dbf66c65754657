use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::crypto::{AesGcmCipher, EncryptedData};
use crate::error::{EnvelopeError, Result};
use crate::key_store::{KeyStore, ResolvedKey};
use crate::label;
use crate::readiness::ReadinessProbe;
use crate::write_label::WriteLabelRegistry;

const FIELD_PREFIX: &str = "enc1";
const DELIMITER: char = '$';

/// A protected field value: `{label, nonce, ciphertext, tag}`
///
/// Stored as one text column, `enc1$<label>$<nonce>$<ciphertext>$<tag>` with
/// base64 parts. The label selects the decrypting key and is bound into the
/// ciphertext as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EncryptedField {
    pub label: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl EncryptedField {
    pub fn encode(&self) -> String {
        format!(
            "{prefix}{d}{label}{d}{nonce}{d}{ciphertext}{d}{tag}",
            prefix = FIELD_PREFIX,
            d = DELIMITER,
            label = self.label,
            nonce = STANDARD.encode(&self.nonce),
            ciphertext = STANDARD.encode(&self.ciphertext),
            tag = STANDARD.encode(&self.tag),
        )
    }

    pub fn parse(stored: &str) -> Result<Self> {
        let parts: Vec<&str> = stored.split(DELIMITER).collect();
        let [prefix, label, nonce, ciphertext, tag] = parts.as_slice() else {
            return Err(EnvelopeError::InvalidCiphertext("not an encrypted field".into()));
        };
        if *prefix != FIELD_PREFIX {
            return Err(EnvelopeError::InvalidCiphertext(format!("unsupported field format {:?}", prefix)));
        }
        label::validate(label).map_err(|_| EnvelopeError::InvalidCiphertext("malformed label".into()))?;

        let decode = |name: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| EnvelopeError::InvalidCiphertext(format!("bad {} encoding: {}", name, e)))
        };
        Ok(Self {
            label: label.to_string(),
            nonce: decode("nonce", nonce)?,
            ciphertext: decode("ciphertext", ciphertext)?,
            tag: decode("tag", tag)?,
        })
    }

    /// Label of a stored value without decoding the rest
    pub fn peek_label(stored: &str) -> Option<&str> {
        let mut parts = stored.splitn(3, DELIMITER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(FIELD_PREFIX), Some(label), Some(_)) => Some(label),
            _ => None,
        }
    }

    fn sealed(&self) -> EncryptedData {
        EncryptedData { nonce: self.nonce.clone(), ciphertext: self.ciphertext.clone(), tag: self.tag.clone() }
    }
}

impl fmt::Display for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for EncryptedField {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EncryptedField {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<EncryptedField> for String {
    fn from(field: EncryptedField) -> Self {
        field.encode()
    }
}

/// Field-level AES-256-GCM encryption under the current write label
///
/// Every call first consults the readiness gate: a process that could not
/// prove it can unwrap the active key refuses both reads and writes.
pub struct FieldCipher {
    keys: Arc<KeyStore>,
    write_labels: Arc<WriteLabelRegistry>,
    readiness: Arc<ReadinessProbe>,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyStore>, write_labels: Arc<WriteLabelRegistry>, readiness: Arc<ReadinessProbe>) -> Self {
        Self { keys, write_labels, readiness }
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedField> {
        self.readiness.ensure_ready()?;
        let write_label = self.write_labels.current_write_label().await?;
        let key = self.keys.resolve_key(&write_label).await?;
        Self::seal(&key, plaintext)
    }

    pub async fn decrypt(&self, field: &EncryptedField) -> Result<Vec<u8>> {
        self.readiness.ensure_ready()?;
        let dek = self.keys.resolve(&field.label).await?;
        AesGcmCipher::decrypt(&dek, &field.sealed(), field.label.as_bytes())
    }

    /// Encrypt text into its stored column form
    pub async fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        Ok(self.encrypt(plaintext.as_bytes()).await?.encode())
    }

    /// Decrypt a stored column value back to text
    pub async fn decrypt_str(&self, stored: &str) -> Result<String> {
        let field = EncryptedField::parse(stored)?;
        let plaintext = self.decrypt(&field).await?;
        String::from_utf8(plaintext)
            .map_err(|_| EnvelopeError::InvalidCiphertext("decrypted field is not UTF-8".into()))
    }

    /// Encrypt under an explicitly resolved key
    pub fn seal(key: &ResolvedKey, plaintext: &[u8]) -> Result<EncryptedField> {
        let sealed = AesGcmCipher::encrypt(&key.dek, plaintext, key.label.as_bytes())?;
        Ok(EncryptedField {
            label: key.label.clone(),
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            tag: sealed.tag,
        })
    }

    /// Move a stored value from `from` to `to`
    ///
    /// Values already under `to`, or under any key other than `from`, are
    /// reported as `None` and must be left as they are.
    pub fn reencrypt(stored: &str, from: &ResolvedKey, to: &ResolvedKey) -> Result<Option<String>> {
        let field = EncryptedField::parse(stored)?;
        if field.label == to.label || field.label != from.label {
            return Ok(None);
        }
        let plaintext = AesGcmCipher::decrypt(&from.dek, &field.sealed(), field.label.as_bytes())?;
        Ok(Some(Self::seal(to, &plaintext)?.encode()))
    }
}
