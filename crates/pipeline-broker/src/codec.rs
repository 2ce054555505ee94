// SPDX-License-Identifier: MIT OR Apache-2.0
//! `MessageEnvelope` <-> UTF-8 JSON wire codec.

use pipeline_envelope::MessageEnvelope;
use pipeline_error::{ErrorCode, PipelineError};

/// Serialise an envelope to its UTF-8 JSON wire form.
pub fn encode(envelope: &MessageEnvelope) -> Result<Vec<u8>, PipelineError> {
    serde_json::to_vec(envelope).map_err(|e| {
        PipelineError::new(ErrorCode::EnvelopeInvalid, format!("encode failed: {e}"))
    })
}

/// Parse an envelope from its UTF-8 JSON wire form.
///
/// Per `spec.md` §4.8, decode failures are a distinct failure mode from
/// handler errors: the caller logs and commits the offset without retrying
/// or dead-lettering, since there is no well-formed envelope to dead-letter.
pub fn decode(bytes: &[u8]) -> Result<MessageEnvelope, PipelineError> {
    serde_json::from_slice(bytes).map_err(|e| {
        PipelineError::new(
            ErrorCode::MessageNotDecodable,
            format!("not valid MessageEnvelope JSON: {e}"),
        )
    })
}
