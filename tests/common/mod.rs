//! Shared fixture: a tiny but fully valid GGUF model.
//!
//! The container carries a one-block llama-style architecture with an
//! 8-wide embedding, grouped-query attention (2 query heads over 1 KV
//! head), and a vocabulary of the five chat-template specials plus full
//! `<0xNN>` byte coverage. Weights are seeded pseudo-random F32 values, so
//! every test run loads byte-identical tensors.

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

pub const CONTEXT_LENGTH: u32 = 32;
pub const EMBEDDING_LENGTH: usize = 8;
pub const HEAD_COUNT: u32 = 2;
pub const HEAD_COUNT_KV: u32 = 1;
pub const FFN_INNER: usize = 16;

/// Template specials first, then one byte token per possible byte.
pub fn vocab() -> Vec<String> {
    let mut pieces: Vec<String> = [
        "<|begin_of_text|>",
        "<|end_of_text|>",
        "<|start_header_id|>",
        "<|end_header_id|>",
        "<|eot_id|>",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for b in 0..=255u8 {
        pieces.push(format!("<0x{b:02X}>"));
    }
    pieces
}

/// Write the fixture model into a fresh temp directory. The directory must
/// outlive every session opened on the returned path.
pub fn tiny_model() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("tiny-llama.gguf");
    std::fs::write(&path, build_container()).expect("write fixture model");
    (dir, path)
}

struct Lcg(u64);

impl Lcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 32) as u32 as f32 / u32::MAX as f32 - 0.5) * 0.2
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u64(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn kv_str(buf: &mut Vec<u8>, key: &str, value: &str) {
    put_str(buf, key);
    put_u32(buf, 8);
    put_str(buf, value);
}

fn kv_u32(buf: &mut Vec<u8>, key: &str, value: u32) {
    put_str(buf, key);
    put_u32(buf, 4);
    put_u32(buf, value);
}

fn kv_f32(buf: &mut Vec<u8>, key: &str, value: f32) {
    put_str(buf, key);
    put_u32(buf, 6);
    put_f32(buf, value);
}

fn kv_str_array(buf: &mut Vec<u8>, key: &str, items: &[String]) {
    put_str(buf, key);
    put_u32(buf, 9);
    put_u32(buf, 8); // element type: string
    put_u64(buf, items.len() as u64);
    for item in items {
        put_str(buf, item);
    }
}

fn build_container() -> Vec<u8> {
    const ALIGN: u64 = 32;
    let embd = EMBEDDING_LENGTH;
    let pieces = vocab();
    let vocab_size = pieces.len();
    let kv_dim = embd / HEAD_COUNT as usize * HEAD_COUNT_KV as usize;
    let inner = FFN_INNER;

    let mut rng = Lcg(0x5eed_1234_5678);
    let mut rand = |n: usize| (0..n).map(|_| rng.next_f32()).collect::<Vec<f32>>();
    let ones = |n: usize| vec![1.0f32; n];

    // (name, dims innermost-first, data)
    let tensors: Vec<(String, Vec<usize>, Vec<f32>)> = vec![
        (
            "token_embd.weight".into(),
            vec![embd, vocab_size],
            rand(embd * vocab_size),
        ),
        ("blk.0.attn_norm.weight".into(), vec![embd], ones(embd)),
        (
            "blk.0.attn_q.weight".into(),
            vec![embd, embd],
            rand(embd * embd),
        ),
        (
            "blk.0.attn_k.weight".into(),
            vec![embd, kv_dim],
            rand(embd * kv_dim),
        ),
        (
            "blk.0.attn_v.weight".into(),
            vec![embd, kv_dim],
            rand(embd * kv_dim),
        ),
        (
            "blk.0.attn_output.weight".into(),
            vec![embd, embd],
            rand(embd * embd),
        ),
        ("blk.0.ffn_norm.weight".into(), vec![embd], ones(embd)),
        (
            "blk.0.ffn_gate.weight".into(),
            vec![embd, inner],
            rand(embd * inner),
        ),
        (
            "blk.0.ffn_up.weight".into(),
            vec![embd, inner],
            rand(embd * inner),
        ),
        (
            "blk.0.ffn_down.weight".into(),
            vec![inner, embd],
            rand(inner * embd),
        ),
        ("output_norm.weight".into(), vec![embd], ones(embd)),
        (
            "output.weight".into(),
            vec![embd, vocab_size],
            rand(embd * vocab_size),
        ),
    ];

    let mut buf = Vec::new();
    buf.extend_from_slice(b"GGUF");
    put_u32(&mut buf, 3);
    put_u64(&mut buf, tensors.len() as u64);
    put_u64(&mut buf, 11); // metadata entries below

    kv_str(&mut buf, "general.architecture", "llama");
    kv_u32(&mut buf, "llama.context_length", CONTEXT_LENGTH);
    kv_u32(&mut buf, "llama.embedding_length", embd as u32);
    kv_u32(&mut buf, "llama.block_count", 1);
    kv_u32(&mut buf, "llama.attention.head_count", HEAD_COUNT);
    kv_u32(&mut buf, "llama.attention.head_count_kv", HEAD_COUNT_KV);
    kv_f32(&mut buf, "llama.attention.layer_norm_rms_epsilon", 1e-5);
    kv_f32(&mut buf, "llama.rope.freq_base", 10_000.0);
    kv_u32(&mut buf, "tokenizer.ggml.bos_token_id", 0);
    kv_u32(&mut buf, "tokenizer.ggml.eos_token_id", 1);
    kv_str_array(&mut buf, "tokenizer.ggml.tokens", &pieces);

    // Tensor infos with 32-byte-aligned offsets into the data region.
    let mut offset = 0u64;
    let mut offsets = Vec::with_capacity(tensors.len());
    for (_, _, data) in &tensors {
        offsets.push(offset);
        offset = (offset + data.len() as u64 * 4).div_ceil(ALIGN) * ALIGN;
    }
    for ((name, dims, _), &tensor_offset) in tensors.iter().zip(&offsets) {
        put_str(&mut buf, name);
        put_u32(&mut buf, dims.len() as u32);
        for &dim in dims {
            put_u64(&mut buf, dim as u64);
        }
        put_u32(&mut buf, 0); // GGML_TYPE_F32
        put_u64(&mut buf, tensor_offset);
    }

    let data_start = (buf.len() as u64).div_ceil(ALIGN) * ALIGN;
    buf.resize(data_start as usize, 0);
    for ((_, _, data), &tensor_offset) in tensors.iter().zip(&offsets) {
        buf.resize((data_start + tensor_offset) as usize, 0);
        for &value in data {
            put_f32(&mut buf, value);
        }
    }

    buf
}
