//! Socket numbers in use on this node and what each one is doing.

use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;

use rskt_core::Request;

/// A request whose response waits on another client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Deferred {
    pub client: u32,
    pub seq: u32,
    pub request: Request,
}

/// A CONNECT parked in a listener's backlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedConnect {
    pub deferred: Deferred,
    /// Socket number the connector will use.
    pub sn: u32,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Listener {
    pub backlog: usize,
    pub accept: Option<Deferred>,
    pub connects: VecDeque<QueuedConnect>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Bound,
    Listening(Listener),
    /// Waiting in a listener's backlog.
    Connecting { listener: u32 },
    Connected { peer: Option<u32> },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub owner: u32,
    pub role: Role,
    /// Allocated for a connection rather than bound by the caller.
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimError {
    InUse,
    Exhausted,
}

pub(crate) struct Registry {
    entries: HashMap<u32, Entry>,
    range: RangeInclusive<u32>,
    cursor: u32,
}

impl Registry {
    pub(crate) fn new(range: RangeInclusive<u32>) -> Self {
        Self {
            cursor: *range.start(),
            entries: HashMap::new(),
            range,
        }
    }

    /// Claim `sn`, or the next free dynamic number when `sn == 0`.
    pub(crate) fn claim(&mut self, sn: u32, owner: u32, ephemeral: bool) -> Result<u32, ClaimError> {
        let sn = if sn == 0 { self.next_dynamic()? } else { sn };
        if self.entries.contains_key(&sn) {
            return Err(ClaimError::InUse);
        }
        self.entries.insert(
            sn,
            Entry {
                owner,
                role: Role::Bound,
                ephemeral,
            },
        );
        Ok(sn)
    }

    /// Round-robin over the dynamic range, so a freed number is not handed
    /// straight back out.
    fn next_dynamic(&mut self) -> Result<u32, ClaimError> {
        let (lo, hi) = (*self.range.start(), *self.range.end());
        let span = u64::from(hi - lo) + 1;
        for _ in 0..span {
            let sn = self.cursor;
            self.cursor = if sn >= hi { lo } else { sn + 1 };
            if !self.entries.contains_key(&sn) {
                return Ok(sn);
            }
        }
        Err(ClaimError::Exhausted)
    }

    pub(crate) fn get(&self, sn: u32) -> Option<&Entry> {
        self.entries.get(&sn)
    }

    pub(crate) fn get_mut(&mut self, sn: u32) -> Option<&mut Entry> {
        self.entries.get_mut(&sn)
    }

    /// `sn`'s entry, if `client` owns it.
    pub(crate) fn owned_mut(&mut self, sn: u32, client: u32) -> Option<&mut Entry> {
        self.entries.get_mut(&sn).filter(|e| e.owner == client)
    }

    pub(crate) fn remove(&mut self, sn: u32) -> Option<Entry> {
        self.entries.remove(&sn)
    }

    /// Every socket number held by `client`.
    pub(crate) fn owned_by(&self, client: u32) -> Vec<u32> {
        let mut sns: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == client)
            .map(|(&sn, _)| sn)
            .collect();
        sns.sort_unstable();
        sns
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_claim() {
        let mut reg = Registry::new(100..=101);
        assert_eq!(reg.claim(7, 1, false), Ok(7));
        assert_eq!(reg.claim(7, 2, false), Err(ClaimError::InUse));
        assert_eq!(reg.get(7).map(|e| e.owner), Some(1));
    }

    #[test]
    fn test_dynamic_exhaustion() {
        let mut reg = Registry::new(100..=101);
        assert_eq!(reg.claim(0, 1, true), Ok(100));
        assert_eq!(reg.claim(0, 1, true), Ok(101));
        assert_eq!(reg.claim(0, 1, true), Err(ClaimError::Exhausted));

        reg.remove(100);
        assert_eq!(reg.claim(0, 1, true), Ok(100));
    }

    #[test]
    fn test_dynamic_round_robin() {
        let mut reg = Registry::new(10..=12);
        assert_eq!(reg.claim(0, 1, true), Ok(10));
        reg.remove(10);
        // The cursor moved on; 10 is reused only after the range wraps.
        assert_eq!(reg.claim(0, 1, true), Ok(11));
        assert_eq!(reg.claim(0, 1, true), Ok(12));
        assert_eq!(reg.claim(0, 1, true), Ok(10));
    }

    #[test]
    fn test_dynamic_skips_explicit() {
        let mut reg = Registry::new(10..=11);
        reg.claim(10, 1, false).unwrap();
        assert_eq!(reg.claim(0, 2, true), Ok(11));
    }

    #[test]
    fn test_owned_by() {
        let mut reg = Registry::new(10..=20);
        reg.claim(5, 1, false).unwrap();
        reg.claim(3, 2, false).unwrap();
        reg.claim(4, 1, false).unwrap();
        assert_eq!(reg.owned_by(1), vec![4, 5]);
        assert!(reg.owned_mut(3, 1).is_none());
        assert!(reg.owned_mut(3, 2).is_some());
    }
}
