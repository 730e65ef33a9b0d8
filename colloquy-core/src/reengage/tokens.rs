//! Activity tokens — the shared gate the reengagement scheduler checks.
//!
//! Any component doing something that should suppress a reengagement nudge
//! (model speaking, a tool call in flight, media playing back) mints a token
//! while the activity runs and removes it when done. The scheduler treats a
//! non-empty set as "the conversation is busy" — except for tokens in its
//! own `reengage` category, which must not block the scheduler that minted
//! them.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

/// Category the scheduler uses for its own tokens. Tokens in this category
/// never count as blocking.
pub const REENGAGE_CATEGORY: &str = "reengage";

/// Mint a token id: `<category>:<subtype>:<unix-millis>:<nonce>`.
///
/// The timestamp makes stale tokens diagnosable in logs; the nonce makes
/// ids unique when one activity mints several per millisecond.
pub fn mint_token(category: &str, subtype: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let nonce: u32 = rand::thread_rng().gen();
    format!("{category}:{subtype}:{millis}:{nonce:08x}")
}

/// Thread-safe set of live activity tokens. Cheap to clone (shared state).
#[derive(Debug, Clone, Default)]
pub struct ActivityTokens {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActivityTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live activity. Returns `false` if the token was already
    /// present.
    pub fn insert(&self, token: String) -> bool {
        debug!(%token, "activity token added");
        self.inner.lock().insert(token)
    }

    /// Retire a token. Returns `false` if it was not present (already
    /// removed, or never minted) — harmless, teardown paths double-remove.
    pub fn remove(&self, token: &str) -> bool {
        let removed = self.inner.lock().remove(token);
        if removed {
            debug!(%token, "activity token removed");
        }
        removed
    }

    /// Number of tokens that block reengagement. The scheduler's own
    /// `reengage:` tokens are excluded.
    pub fn blocking_count(&self) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|t| !is_reengage_token(t))
            .count()
    }

    /// True when any foreign activity is live.
    pub fn is_blocked(&self) -> bool {
        self.blocking_count() > 0
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

fn is_reengage_token(token: &str) -> bool {
    token
        .split(':')
        .next()
        .is_some_and(|category| category == REENGAGE_CATEGORY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_unique_and_carry_their_category() {
        let a = mint_token("speech", "model");
        let b = mint_token("speech", "model");
        assert_ne!(a, b);
        assert!(a.starts_with("speech:model:"));
    }

    #[test]
    fn foreign_tokens_block_but_reengage_tokens_do_not() {
        let tokens = ActivityTokens::new();
        tokens.insert(mint_token(REENGAGE_CATEGORY, "countdown"));
        assert!(!tokens.is_blocked());

        tokens.insert(mint_token("tool", "call"));
        assert!(tokens.is_blocked());
        assert_eq!(tokens.blocking_count(), 1);
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn remove_is_safe_on_missing_tokens() {
        let tokens = ActivityTokens::new();
        let t = mint_token("speech", "user");
        tokens.insert(t.clone());
        assert!(tokens.remove(&t));
        assert!(!tokens.remove(&t));
        assert!(tokens.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let tokens = ActivityTokens::new();
        let other = tokens.clone();
        other.insert(mint_token("media", "playback"));
        assert!(tokens.is_blocked());
    }
}
