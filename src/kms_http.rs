//! REST KMS client
//!
//! Speaks the Cloud KMS style JSON protocol:
//! `POST {endpoint}/{key}:encrypt` with `{"plaintext", "additionalAuthenticatedData"}`
//! and `POST {endpoint}/{key}:decrypt` with `{"ciphertext", "additionalAuthenticatedData"}`,
//! all binary fields base64 encoded.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{EnvelopeError, Result};
use crate::kek::KmsClient;

pub const DEFAULT_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest {
    plaintext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_authenticated_data: Option<String>,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest {
    ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_authenticated_data: Option<String>,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

pub struct HttpKmsClient {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
}

impl HttpKmsClient {
    pub fn new(endpoint: impl Into<String>, access_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnvelopeError::Config(format!("KMS client init failed: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn url(&self, key_name: &str, verb: &str) -> String {
        format!("{}/{}:{}", self.endpoint, key_name.trim_start_matches('/'), verb)
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(&self, url: &str, body: &B, verb: &str) -> Result<R> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EnvelopeError::KmsUnavailable(format!("{} request failed: {}", verb, e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| EnvelopeError::KmsUnavailable(format!("{} response unreadable: {}", verb, e)));
        }

        let detail = response.text().await.unwrap_or_default();
        Err(classify(status, verb, &detail))
    }
}

impl std::fmt::Debug for HttpKmsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpKmsClient")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.access_token.is_some())
            .finish()
    }
}

/// Map a KMS HTTP failure onto the error taxonomy
fn classify(status: StatusCode, verb: &str, detail: &str) -> EnvelopeError {
    let detail = detail.chars().take(200).collect::<String>();
    match status {
        // KMS reports a ciphertext/AAD mismatch as a bad request
        StatusCode::BAD_REQUEST if verb == "decrypt" => {
            EnvelopeError::UnwrapAuthFailure(format!("KMS rejected ciphertext: {}", detail))
        }
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            EnvelopeError::Config(format!("KMS {} failed ({}): {}", verb, status, detail))
        }
        _ => EnvelopeError::KmsUnavailable(format!("KMS {} failed ({}): {}", verb, status, detail)),
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| EnvelopeError::KmsUnavailable(format!("KMS returned invalid base64 {}: {}", field, e)))
}

#[async_trait]
impl KmsClient for HttpKmsClient {
    async fn encrypt(&self, key_name: &str, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let body = EncryptRequest {
            plaintext: STANDARD.encode(plaintext),
            additional_authenticated_data: aad.map(|a| STANDARD.encode(a)),
        };
        let response: EncryptResponse = self.post(&self.url(key_name, "encrypt"), &body, "encrypt").await?;
        decode("ciphertext", &response.ciphertext)
    }

    async fn decrypt(&self, key_name: &str, ciphertext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let body = DecryptRequest {
            ciphertext: STANDARD.encode(ciphertext),
            additional_authenticated_data: aad.map(|a| STANDARD.encode(a)),
        };
        let response: DecryptResponse = self.post(&self.url(key_name, "decrypt"), &body, "decrypt").await?;
        decode("plaintext", &response.plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = HttpKmsClient::new("https://kms.example/v1/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.url("projects/p/locations/l/keyRings/r/cryptoKeys/k", "encrypt"),
            "https://kms.example/v1/projects/p/locations/l/keyRings/r/cryptoKeys/k:encrypt"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "decrypt", "Decryption failed"),
            EnvelopeError::UnwrapAuthFailure(_)
        ));
        assert!(matches!(classify(StatusCode::FORBIDDEN, "decrypt", ""), EnvelopeError::KmsUnavailable(_)));
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, "encrypt", ""),
            EnvelopeError::KmsUnavailable(_)
        ));
        assert!(matches!(classify(StatusCode::NOT_FOUND, "encrypt", ""), EnvelopeError::Config(_)));
    }

    #[test]
    fn test_request_shape() {
        let body = EncryptRequest {
            plaintext: STANDARD.encode(b"k"),
            additional_authenticated_data: Some(STANDARD.encode(b"env=prod")),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["plaintext"], "aw==");
        assert_eq!(json["additionalAuthenticatedData"], STANDARD.encode(b"env=prod"));

        let bare = DecryptRequest { ciphertext: "AA==".into(), additional_authenticated_data: None };
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("additionalAuthenticatedData").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let client = HttpKmsClient::new("http://127.0.0.1:9", None, Duration::from_millis(200)).unwrap();
        let result = client.decrypt("k", b"x", None).await;
        assert!(matches!(result, Err(EnvelopeError::KmsUnavailable(_))));
    }
}
