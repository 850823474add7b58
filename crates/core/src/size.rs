//! Encrypted-size arithmetic for attachments.

pub const KIBIBYTE: u64 = 1024;

const PADDING_FLOOR: u64 = 541;
const PADDING_BASE: f64 = 1.05;
const IV_LENGTH: u64 = 16;
const MAC_LENGTH: u64 = 32;
const AES_BLOCK: u64 = 16;

/// Bucketed plaintext size that hides the exact length on the wire.
pub fn padded_size(size: u64) -> u64 {
    if size == 0 {
        return PADDING_FLOOR;
    }
    let exponent = ((size as f64).ln() / PADDING_BASE.ln()).ceil();
    let bucket = PADDING_BASE.powf(exponent).floor() as u64;
    bucket.max(PADDING_FLOOR).max(size)
}

/// Length of AES-CBC output for `size` bytes of input (PKCS#7 always pads).
pub fn aes_cbc_size(size: u64) -> u64 {
    (size / AES_BLOCK + 1) * AES_BLOCK
}

/// Expected ciphertext length of an attachment with the given plaintext size.
pub fn ciphertext_length(plaintext_size: u64) -> u64 {
    IV_LENGTH + aes_cbc_size(padded_size(plaintext_size)) + MAC_LENGTH
}
