use crc32fast::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};

/// Derive a short hex seed from an owner token and a session start time.
///
/// Two sessions for the same owner get different seeds, so ids handed out
/// in one session never collide with ids minted in an earlier one.
pub fn session_seed(owner: &str, started_at_nanos: i64) -> String {
    let mut hasher = Hasher::new();
    hasher.update(owner.as_bytes());
    hasher.update(&started_at_nanos.to_le_bytes());
    format!("{:08x}", hasher.finalize())
}

/// Sequential id generator for sequence elements within one editing session.
///
/// The counter only moves forward, so an id that was issued and later
/// removed is never issued again by the same generator.
#[derive(Debug)]
pub struct IdGenerator {
    seed: String,
    count: AtomicU32,
}

impl IdGenerator {
    /// Generator seeded from the owner and the current time
    pub fn for_owner(owner: &str) -> Self {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self::from_seed(session_seed(owner, now))
    }

    pub fn from_seed(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            count: AtomicU32::new(0),
        }
    }

    /// Generate next sequential id
    pub fn new_id(&self) -> String {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.seed, n)
    }

    /// Generate an id that is not already in `taken`.
    pub fn new_id_avoiding<'a, I>(&self, taken: I) -> String
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        loop {
            let id = self.new_id();
            if !taken.clone().into_iter().any(|t| t == id) {
                return id;
            }
        }
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}
