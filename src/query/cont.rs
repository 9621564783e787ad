//! In-process continuation tokens.
//!
//! A token is an opaque random id keying a cursor held in process memory, so
//! it is unforgeable within the process and dies with it. Deployments must
//! route continuation follow-ups to the process that minted the token.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::err::Error;

use super::Cursor;

struct Entry {
    cursor: Cursor,
    last_used: Instant,
}

/// Holds the cursors of partially-streamed queries, keyed by opaque token.
pub struct Continuations {
    timeout: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Continuations {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh token for `cursor`.
    pub fn mint(&self, cursor: Cursor) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().expect("continuation lock poisoned");
        let timeout = self.timeout;
        entries.retain(|_, e| e.last_used.elapsed() <= timeout);
        entries.insert(
            token.clone(),
            Entry {
                cursor,
                last_used: Instant::now(),
            },
        );
        token
    }

    /// Look up a token, cloning its cursor so a token can be replayed (a
    /// re-used token returns the same records again).
    pub fn resume(&self, token: &str) -> Result<Cursor, Error> {
        let mut entries = self.entries.lock().expect("continuation lock poisoned");
        match entries.get_mut(token) {
            None => Err(Error::InvalidToken),
            Some(entry) if entry.last_used.elapsed() > self.timeout => {
                entries.remove(token);
                Err(Error::ExpiredToken)
            }
            Some(entry) => {
                entry.last_used = Instant::now();
                Ok(entry.cursor.clone())
            }
        }
    }

    /// Number of live cursors (expired entries included until purged).
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("continuation lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
