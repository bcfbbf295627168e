//! Proof artifacts and the service that produces them.
//!
//! The proving system itself is out of scope: a [`ProofService`] takes a model
//! file and an input shape and returns three opaque, already compressed
//! artifacts which are stored verbatim as `proof.zlib`,
//! `verification_key.zlib` and `settings.zlib`.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::blocking::multipart::Form;
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Proof, verification key and settings produced for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofBundle {
    pub proof: Vec<u8>,
    pub verification_key: Vec<u8>,
    pub settings: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("failed to read model {path}: {source}")]
    Model {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("proof service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("proof service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("proof service response field `{field}` is not valid base64: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
}

pub trait ProofService {
    fn prove(
        &self,
        model: &Path,
        input_dims: &[usize],
        backend: &str,
    ) -> Result<ProofBundle, ProofError>;
}

/// Client for the ZKML proving server's `/upload` endpoint.
#[derive(Debug, Clone)]
pub struct HttpProofService {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ProveResponse {
    proof: String,
    verification_key: String,
    settings: String,
}

impl HttpProofService {
    pub fn new(config: &Config) -> Result<Self, ProofError> {
        // Proving is slow; the ledger timeout does not apply here.
        let client = Client::builder().build()?;
        Ok(HttpProofService {
            client,
            base_url: config.zkml_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ProofService for HttpProofService {
    fn prove(
        &self,
        model: &Path,
        input_dims: &[usize],
        backend: &str,
    ) -> Result<ProofBundle, ProofError> {
        let dimensions = serde_json::json!({ "input_dims": input_dims }).to_string();
        let form = Form::new()
            .text("dimensions", dimensions)
            .text("backend", backend.to_string())
            .file("file", model)
            .map_err(|source| ProofError::Model {
                path: model.display().to_string(),
                source,
            })?;
        debug!(model = %model.display(), backend, "requesting proof");
        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(ProofError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let body: ProveResponse = response.json()?;
        Ok(ProofBundle {
            proof: decode_field("proof", &body.proof)?,
            verification_key: decode_field("verification_key", &body.verification_key)?,
            settings: decode_field("settings", &body.settings)?,
        })
    }
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, ProofError> {
    STANDARD
        .decode(value.trim())
        .map_err(|source| ProofError::Encoding { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_fields() {
        let encoded = STANDARD.encode(b"\x78\x9c\x01");
        assert_eq!(decode_field("proof", &encoded).unwrap(), b"\x78\x9c\x01");
        assert!(matches!(
            decode_field("proof", "not base64!"),
            Err(ProofError::Encoding { field: "proof", .. })
        ));
    }
}
