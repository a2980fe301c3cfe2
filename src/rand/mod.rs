
use rand::{thread_rng, Rng};

// ice-char = ALPHA / DIGIT / "+" / "/" (RFC 8839 section 5.4)
const RUNES_ICE_CHAR: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";

// 3 random bytes worth of ice-chars; RFC 8445 requires at least 24 bits.
const LEN_UFRAG: usize = 4;
// 16 random bytes worth of ice-chars; RFC 8445 requires at least 128 bits.
const LEN_PWD: usize = 24;

pub fn generate_rand_string(n: usize, runes: &[u8]) -> String {
    let mut rng = thread_rng();

    (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..runes.len());
            runes[idx] as char
        })
        .collect()
}

/// candidate-id = "candidate" ":" foundation
/// foundation   = 1*32ice-char
pub fn generate_cand_id() -> String {
    format!("candidate:{}", generate_rand_string(32, RUNES_ICE_CHAR))
}

/// Generates the local ICE password.
pub fn generate_pwd() -> String {
    generate_rand_string(LEN_PWD, RUNES_ICE_CHAR)
}

/// Generates the local ICE username fragment.
pub fn generate_ufrag() -> String {
    generate_rand_string(LEN_UFRAG, RUNES_ICE_CHAR)
}
