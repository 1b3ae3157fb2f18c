use rand::Rng;
use uuid::Uuid;

pub const CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub const MIN_CODE_LEN: usize = 8;
pub const MAX_CODE_LEN: usize = 10;

/// Produce a candidate invite code: 8-10 uppercase alphanumeric characters,
/// taken from a random 128-bit identifier encoded in base 36. Candidates are
/// not guaranteed unique; the store's constraint on `code` decides that.
pub fn generate_code() -> String {
    let len = rand::thread_rng().gen_range(MIN_CODE_LEN..=MAX_CODE_LEN);
    let mut n = Uuid::new_v4().as_u128();

    let mut code = String::with_capacity(len);
    for _ in 0..len {
        code.push(CODE_ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_within_length_bounds() {
        for _ in 0..1000 {
            let code = generate_code();
            assert!((MIN_CODE_LEN..=MAX_CODE_LEN).contains(&code.len()));
        }
    }

    #[test]
    fn codes_use_uppercase_alphanumeric_alphabet() {
        for _ in 0..1000 {
            let code = generate_code();
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)), "bad code: {code}");
        }
    }

    #[test]
    fn codes_rarely_collide() {
        // 36^8 candidates; 1000 draws colliding would mean a broken source
        let codes: HashSet<String> = (0..1000).map(|_| generate_code()).collect();
        assert_eq!(codes.len(), 1000);
    }
}
