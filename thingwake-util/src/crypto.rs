use rand::Rng;
use sha2::{Digest as _, Sha256};

/// All letters and digits.
pub const ALPHA_NUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn sha256_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Sha256::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

/// Returns a string of `len` characters picked at random from `charset`.
///
/// Not suitable for secrets.
pub fn pseudorandom_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_hashes_the_empty_payload() {
        assert_eq!(
            sha256_hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn it_generates_strings_from_the_charset() {
        let s = pseudorandom_string(b"ab", 16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c == 'a' || c == 'b'));
    }
}
