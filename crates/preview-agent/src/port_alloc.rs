use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
};

use crate::error::SessionError;

/// Assigns ports from a bounded range, preferring the port a session held last time.
///
/// Not synchronized on its own; it lives inside the registry lock so "ports held by running
/// sessions" and the pick are one atomic step.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    // Survives stop; only delete forgets it.
    last_known: HashMap<String, u16>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            last_known: HashMap::new(),
        }
    }

    pub fn last_known(&self, session_id: &str) -> Option<u16> {
        self.last_known.get(session_id).copied()
    }

    pub fn remember(&mut self, session_id: &str, port: u16) {
        self.last_known.insert(session_id.to_string(), port);
    }

    pub fn forget(&mut self, session_id: &str) {
        self.last_known.remove(session_id);
    }

    /// `held` is the set of ports owned by *other* live sessions.
    pub fn allocate(&mut self, session_id: &str, held: &HashSet<u16>) -> Result<u16, SessionError> {
        // Sticky reuse keeps the client-visible URL stable across restarts. A remembered
        // port outside the current range (config changed) is not reused.
        if let Some(prev) = self.last_known(session_id)
            && self.range.contains(&prev)
            && !held.contains(&prev)
        {
            return Ok(prev);
        }

        let port = self
            .range
            .clone()
            .find(|p| !held.contains(p))
            .ok_or(SessionError::ResourceExhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;
        self.remember(session_id, port);
        Ok(port)
    }
}
