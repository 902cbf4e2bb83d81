//! Envelope Codec
//!
//! Encode/decode between JSON documents and the encrypted envelope string.
//! Requests are never gzip-compressed, responses always are. The client
//! rejects anything else, so the asymmetry is part of the wire format.

use std::io::{Read, Write};

use aes::Aes256;
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

type EnvelopeEncryptor = cbc::Encryptor<Aes256>;
type EnvelopeDecryptor = cbc::Decryptor<Aes256>;

// =============================================================================
// WIRE CONSTANTS
// =============================================================================

/// AES-256 key baked into the client.
///
/// Wire-compatibility constant only. Never reuse it for anything that needs
/// confidentiality.
pub const ENVELOPE_KEY: [u8; 32] = *b"k8Vq3ZrT1mWc6Yh0PaLx2Ns9Df4Gj7Eb";

/// CBC initialization vector (all zero).
pub const ENVELOPE_IV: [u8; 16] = [0u8; 16];

/// Size of the unused header that precedes every plaintext payload.
pub const HEADER_LEN: usize = 16;

/// AES block size.
const BLOCK_LEN: usize = 16;

/// Base64 with `-_` in place of `+/`. Padding is written on encode and
/// optional on decode.
const ENVELOPE_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// =============================================================================
// ERRORS
// =============================================================================

/// Envelope codec errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Envelope is not valid base64 in the envelope alphabet.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Ciphertext length or PKCS#7 padding is invalid.
    #[error("invalid ciphertext: {0}")]
    Cipher(&'static str),

    /// Plaintext is shorter than the fixed header.
    #[error("plaintext too short: {0} bytes")]
    Truncated(usize),

    /// gzip stream could not be produced or read.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Payload is not a JSON document.
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// CODEC
// =============================================================================

/// Decode an envelope into its JSON document.
///
/// `is_response` selects whether the payload is gzip-compressed.
pub fn decode(envelope: &[u8], is_response: bool) -> Result<Value, TransportError> {
    let text = envelope.trim_ascii();
    let ciphertext = ENVELOPE_BASE64.decode(text)?;

    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(TransportError::Cipher("length is not a multiple of the block size"));
    }

    let plaintext = EnvelopeDecryptor::new(&ENVELOPE_KEY.into(), &ENVELOPE_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| TransportError::Cipher("bad padding"))?;

    if plaintext.len() < HEADER_LEN {
        return Err(TransportError::Truncated(plaintext.len()));
    }
    let payload = &plaintext[HEADER_LEN..];

    let json = if is_response {
        let mut inflated = Vec::with_capacity(payload.len() * 4);
        GzDecoder::new(payload).read_to_end(&mut inflated)?;
        inflated
    } else {
        payload.to_vec()
    };

    trace!("decoded envelope payload prefix: {}", hex::encode(&json[..json.len().min(32)]));

    Ok(serde_json::from_slice(&json)?)
}

/// Encode a JSON document into an envelope string.
pub fn encode(document: &Value, is_response: bool) -> Result<String, TransportError> {
    let json = serde_json::to_vec(document)?;

    let body = if is_response {
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?
    } else {
        json
    };

    let mut plaintext = Vec::with_capacity(HEADER_LEN + body.len() + BLOCK_LEN);
    plaintext.extend_from_slice(&[0u8; HEADER_LEN]);
    plaintext.extend_from_slice(&body);

    let ciphertext = EnvelopeEncryptor::new(&ENVELOPE_KEY.into(), &ENVELOPE_IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

    Ok(ENVELOPE_BASE64.encode(ciphertext))
}

// =============================================================================
// TESTS
// =============================================================================
