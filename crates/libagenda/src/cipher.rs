use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use thiserror::Error;

/// Knobs for the shift-and-hash cipher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherSettings {
    /// Positions each letter or digit moves per round.
    pub shift: i32,
    /// Shift rounds applied before hashing.
    pub shift_count: u32,
    /// Rounds of SHA-256 over the running text.
    pub hash_count: u32,
    /// Odd positions shift the opposite way.
    pub alternate: bool,
    /// Strip whitespace from the input before shifting.
    pub ign_space: bool,
    /// Leave the hex digest untouched; otherwise it gets one more shift round.
    pub restrict_hash: bool,
}

impl Default for CipherSettings {
    fn default() -> Self {
        Self {
            shift: 7,
            shift_count: 3,
            hash_count: 2,
            alternate: true,
            ign_space: true,
            restrict_hash: true,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    #[error("nothing to encode")]
    EmptyInput,
}

/// Runs `text` through the cipher.
pub fn zyph(text: &str, settings: &CipherSettings) -> Result<String, CipherError> {
    if text.trim().is_empty() {
        return Err(CipherError::EmptyInput);
    }
    Ok(apply(text, settings))
}

/// Stable opaque requester id for a network address.
pub fn derive_id(addr: &IpAddr, settings: &CipherSettings) -> String {
    apply(&addr.to_string(), settings)
}

fn apply(text: &str, settings: &CipherSettings) -> String {
    let mut out: String = if settings.ign_space {
        text.chars().filter(|c| !c.is_whitespace()).collect()
    } else {
        text.to_string()
    };

    for _ in 0..settings.shift_count {
        out = shift_round(&out, settings.shift, settings.alternate);
    }

    for _ in 0..settings.hash_count {
        out = hex::encode(Sha256::digest(out.as_bytes()));
    }

    if settings.hash_count > 0 && !settings.restrict_hash {
        out = shift_round(&out, settings.shift, settings.alternate);
    }
    out
}

fn shift_round(text: &str, shift: i32, alternate: bool) -> String {
    text.chars()
        .enumerate()
        .map(|(i, c)| {
            let by = if alternate && i % 2 == 1 { -shift } else { shift };
            shift_char(c, by)
        })
        .collect()
}

fn shift_char(c: char, by: i32) -> char {
    let rotate = |base: u8, span: i32| {
        let offset = (c as i32 - i32::from(base) + by).rem_euclid(span);
        char::from(base + offset as u8)
    };
    match c {
        'a'..='z' => rotate(b'a', 26),
        'A'..='Z' => rotate(b'A', 26),
        '0'..='9' => rotate(b'0', 10),
        _ => c,
    }
}
