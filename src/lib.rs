pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod field_cipher;
pub mod kek;
pub mod key_store;
pub mod kms_http;
pub mod label;
pub mod readiness;
pub mod rotation;
pub mod service;
pub mod storage;
pub mod write_label;

// PostgreSQL backend
pub mod postgres_storage;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EncryptionConfig, KekConfig, KekMode};
pub use crypto::{AesGcmCipher, EncryptedData, SecureKey, AES_256_KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{EnvelopeError, Result};
pub use field_cipher::{EncryptedField, FieldCipher};
pub use kek::{KekProvider, KekRing, KekSpec, KmsClient, KmsKekProvider, LocalKekProvider, WrapAlgorithm, WrappedKey};
pub use key_store::{KeyStore, ResolvedKey, RewrapReport};
pub use kms_http::HttpKmsClient;
pub use readiness::{NotReadyReason, Readiness, ReadinessProbe};
pub use rotation::{FinalizeReport, RotationOrchestrator, RotationProgress, RotationState};
pub use service::{CryptoStatus, EncryptionService};
pub use storage::{
    EncryptionKey, InMemoryCatalog, InMemoryProtectedStore, KeyCatalog, ProtectedColumn, ProtectedStore,
};
pub use write_label::WriteLabelRegistry;

// PostgreSQL exports
pub use postgres_storage::{PgKeyCatalog, PgProtectedStore};
