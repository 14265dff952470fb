//! Vocabulary tokenizer and chat-template rendering.
//!
//! The vocabulary ships inside the GGUF container (`tokenizer.ggml.tokens`),
//! so the tokenizer is built from model metadata rather than a sidecar file.
//! Encoding is greedy longest-match over vocabulary pieces with llama.cpp
//! style `<0xNN>` byte tokens as the fallback for uncovered bytes; decoding
//! concatenates piece bytes. The pair is a byte-exact round trip for any
//! input the vocabulary covers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::gguf::GgufFile;

/// Special token pieces of the llama3-style chat template.
pub mod special {
    /// Beginning-of-sequence marker prepended by the template.
    pub const BOS: &str = "<|begin_of_text|>";
    /// End-of-sequence token.
    pub const EOS: &str = "<|end_of_text|>";
    /// Opens a role header.
    pub const START_HEADER: &str = "<|start_header_id|>";
    /// Closes a role header.
    pub const END_HEADER: &str = "<|end_header_id|>";
    /// End-of-turn token, also a generation stop.
    pub const EOT: &str = "<|eot_id|>";
}

/// One (role, content) turn of a conversation. Order is caller-defined and
/// preserved by the template renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role, e.g. `system`, `user`, `assistant`.
    pub role: String,
    /// Message body.
    pub content: String,
}

impl ChatMessage {
    /// A `system` role message.
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".into(),
            content: content.into(),
        }
    }

    /// A `user` role message.
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".into(),
            content: content.into(),
        }
    }

    /// An `assistant` role message.
    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Immutable tokenizer over the model vocabulary.
pub struct Tokenizer {
    /// token id -> piece string.
    pieces: Vec<String>,
    /// piece string -> token id (first occurrence wins on duplicates).
    piece_to_id: HashMap<String, u32>,
    /// raw byte -> id of its `<0xNN>` byte token, where present.
    byte_to_id: [Option<u32>; 256],
    /// Longest piece length in bytes, bounds the match window.
    max_piece_len: usize,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
    eot_id: Option<u32>,
}

/// Parse a `<0xNN>` byte-token piece.
fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

impl Tokenizer {
    /// Build a tokenizer from the metadata of a parsed GGUF container.
    pub fn from_gguf(gguf: &GgufFile) -> Result<Self> {
        let tokens = gguf
            .get("tokenizer.ggml.tokens")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::Broken("missing tokenizer.ggml.tokens array".into()))?;

        let mut pieces = Vec::with_capacity(tokens.len());
        for (id, value) in tokens.iter().enumerate() {
            let piece = value.as_str().ok_or_else(|| {
                EngineError::Broken(format!("vocabulary entry {id} is not a string"))
            })?;
            pieces.push(piece.to_string());
        }
        if pieces.is_empty() {
            return Err(EngineError::Broken("empty vocabulary".into()));
        }

        let mut tokenizer = Self::from_pieces(pieces);
        if let Some(id) = gguf
            .get("tokenizer.ggml.bos_token_id")
            .and_then(|v| v.as_u64())
        {
            tokenizer.bos_id = Some(id as u32);
        }
        if let Some(id) = gguf
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|v| v.as_u64())
        {
            tokenizer.eos_id = Some(id as u32);
        }
        Ok(tokenizer)
    }

    /// Build a tokenizer directly from a piece list.
    pub fn from_pieces(pieces: Vec<String>) -> Self {
        let mut piece_to_id = HashMap::with_capacity(pieces.len());
        let mut byte_to_id = [None; 256];
        let mut max_piece_len = 1;

        for (id, piece) in pieces.iter().enumerate() {
            let id = id as u32;
            piece_to_id.entry(piece.clone()).or_insert(id);
            if let Some(byte) = parse_byte_piece(piece) {
                if byte_to_id[byte as usize].is_none() {
                    byte_to_id[byte as usize] = Some(id);
                }
            } else {
                max_piece_len = max_piece_len.max(piece.len());
            }
        }

        let bos_id = piece_to_id.get(special::BOS).copied();
        let eos_id = piece_to_id.get(special::EOS).copied();
        let eot_id = piece_to_id.get(special::EOT).copied();

        Tokenizer {
            pieces,
            piece_to_id,
            byte_to_id,
            max_piece_len,
            bos_id,
            eos_id,
            eot_id,
        }
    }

    /// Number of vocabulary entries.
    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    /// Token ids that terminate generation.
    pub fn stop_tokens(&self) -> Vec<u32> {
        self.eos_id.into_iter().chain(self.eot_id).collect()
    }

    /// Beginning-of-sequence token id, when the vocabulary declares one.
    pub fn bos_id(&self) -> Option<u32> {
        self.bos_id
    }

    /// Encode UTF-8 text into token ids.
    ///
    /// Greedy longest-match: at each position the longest vocabulary piece
    /// that is a prefix of the remaining input wins. Byte tokens `<0xNN>`
    /// cover anything the piece table misses; a byte with neither coverage
    /// is an [`EngineError::InvalidArgument`]. The empty string encodes to
    /// an empty sequence.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let bytes = text.as_bytes();
        let mut ids = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let window_end = (pos + self.max_piece_len).min(bytes.len());
            let mut matched = None;
            // Longest candidate first; piece boundaries must fall on valid
            // UTF-8 boundaries for the str lookup, which the windowing below
            // guarantees because pieces are themselves strings.
            for end in (pos + 1..=window_end).rev() {
                let Ok(candidate) = std::str::from_utf8(&bytes[pos..end]) else {
                    continue;
                };
                if let Some(&id) = self.piece_to_id.get(candidate) {
                    matched = Some((id, end - pos));
                    break;
                }
            }

            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    let byte = bytes[pos];
                    let id = self.byte_to_id[byte as usize].ok_or_else(|| {
                        EngineError::InvalidArgument(format!(
                            "byte 0x{byte:02x} at offset {pos} is not covered by the vocabulary"
                        ))
                    })?;
                    ids.push(id);
                    pos += 1;
                }
            }
        }

        Ok(ids)
    }

    /// Number of tokens `text` encodes to.
    pub fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.encode(text)?.len())
    }

    /// Raw bytes for one token id. Byte tokens yield their single raw byte.
    ///
    /// The output is bytes, not `String`: one token may carry a fragment of
    /// a multi-byte UTF-8 sequence that only becomes decodable once later
    /// tokens arrive.
    pub fn token_bytes(&self, id: u32) -> Result<Vec<u8>> {
        let piece = self.pieces.get(id as usize).ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "token id {id} out of range (vocab {})",
                self.pieces.len()
            ))
        })?;
        match parse_byte_piece(piece) {
            Some(byte) => Ok(vec![byte]),
            None => Ok(piece.clone().into_bytes()),
        }
    }

    /// Decode a token sequence back into bytes.
    pub fn decode(&self, ids: &[u32]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for &id in ids {
            out.extend_from_slice(&self.token_bytes(id)?);
        }
        Ok(out)
    }

    /// Render messages with the llama3-style chat template.
    ///
    /// Message order is preserved; the assistant header is appended so the
    /// model continues in the assistant role.
    pub fn apply_chat_template(&self, messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        out.push_str(special::BOS);
        for msg in messages {
            out.push_str(special::START_HEADER);
            out.push_str(&msg.role);
            out.push_str(special::END_HEADER);
            out.push_str("\n\n");
            out.push_str(&msg.content);
            out.push_str(special::EOT);
        }
        out.push_str(special::START_HEADER);
        out.push_str("assistant");
        out.push_str(special::END_HEADER);
        out.push_str("\n\n");
        out
    }

    /// Template + encode in one step.
    pub fn encode_chat(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
        self.encode(&self.apply_chat_template(messages))
    }
}
