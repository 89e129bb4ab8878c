//! Correlation ID generation (§4.5: at least 16 bytes of entropy).

use rand::RngCore;

/// Generate a new correlation ID: 20 random bytes, hex-encoded.
pub fn new_correlation_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_long_enough() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_ne!(a, b);
        assert!(a.len() >= 32);
    }
}
