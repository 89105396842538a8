//! Shape and generation of relay tokens.
//!
//! A token is 16 symbols drawn from a 64-symbol URL-safe alphabet. Its shape
//! can be checked without touching storage, which lets the HTTP layer reject
//! garbage paths before any lookup.

use rand::Rng;

pub const TOKEN_LENGTH: usize = 16;
pub const TOKEN_ALPHABET: &[u8; 64] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-";

pub fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// True when `candidate` has exactly the token length and alphabet.
pub fn is_valid_token(candidate: &str) -> bool {
    candidate.len() == TOKEN_LENGTH && candidate.chars().all(is_token_char)
}

pub fn generate_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..TOKEN_LENGTH)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

pub fn random_token() -> String {
    generate_token(&mut rand::thread_rng())
}

/// Shortened form for log lines, e.g. `aB3x…`.
pub fn mask_token(token: &str) -> String {
    let head: String = token.chars().take(4).collect();
    format!("{head}…")
}
