use tessera_core::{CACHE_TOKEN_LEN, CacheToken};

// TOKEN HASHER
// ================================================================================================

/// Incrementally computes a compilation cache token.
///
/// A hasher is live only when the client supplied a token of its own; without
/// one there is nothing to key the cache on and every update is a no-op. The
/// planner feeds in, per step: the source graph index and the index of every
/// operation included in the step (while the step model is assembled), then
/// the device name, device version, preference, and priority (when the step
/// is compiled). The digest is a fixed 32 bytes and opaque to everyone else.
#[derive(Debug, Clone)]
pub struct TokenHasher {
    hasher: Option<blake3::Hasher>,
}

impl TokenHasher {
    /// Creates a hasher seeded with the client-supplied token, or an inert
    /// hasher when the client did not provide one.
    pub fn new(client_token: Option<&CacheToken>) -> Self {
        let hasher = client_token.map(|token| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(token.as_ref());
            hasher
        });
        Self { hasher }
    }

    /// Whether this hasher will produce a token.
    pub fn is_live(&self) -> bool {
        self.hasher.is_some()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(bytes);
        }
    }

    /// Hashes a length-prefixed string, so that adjacent fields cannot run
    /// into each other.
    pub fn update_str(&mut self, value: &str) {
        self.update(&(value.len() as u32).to_le_bytes());
        self.update(value.as_bytes());
    }

    pub fn update_u32(&mut self, value: u32) {
        self.update(&value.to_le_bytes());
    }

    /// Produces the finished token, if the hasher is live.
    pub fn finish(&self) -> Option<CacheToken> {
        self.hasher.as_ref().map(|hasher| {
            let digest = hasher.finalize();
            let mut token = [0u8; CACHE_TOKEN_LEN];
            token.copy_from_slice(digest.as_bytes());
            CacheToken(token)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_token() -> CacheToken {
        CacheToken([7u8; CACHE_TOKEN_LEN])
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let make = || {
            let token = client_token();
            let mut hasher = TokenHasher::new(Some(&token));
            hasher.update_str("device");
            hasher.update_u32(3);
            hasher.finish().unwrap()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn sensitive_to_every_field() {
        let token = client_token();
        let mut base = TokenHasher::new(Some(&token));
        base.update_str("device");
        base.update_u32(3);
        let base = base.finish().unwrap();

        let mut other_name = TokenHasher::new(Some(&token));
        other_name.update_str("devicf");
        other_name.update_u32(3);
        assert_ne!(base, other_name.finish().unwrap());

        let other_client = CacheToken([8u8; CACHE_TOKEN_LEN]);
        let mut other_seed = TokenHasher::new(Some(&other_client));
        other_seed.update_str("device");
        other_seed.update_u32(3);
        assert_ne!(base, other_seed.finish().unwrap());
    }

    #[test]
    fn inert_without_client_token() {
        let mut hasher = TokenHasher::new(None);
        hasher.update_str("device");
        assert!(!hasher.is_live());
        assert_eq!(hasher.finish(), None);
    }

    #[test]
    fn string_fields_are_length_prefixed() {
        let token = client_token();
        let mut one = TokenHasher::new(Some(&token));
        one.update_str("ab");
        one.update_str("c");
        let mut two = TokenHasher::new(Some(&token));
        two.update_str("a");
        two.update_str("bc");
        assert_ne!(one.finish(), two.finish());
    }
}
