//! Vector clock for causality tracking.
//!
//! Every operation carries the clock of its author at creation time. The
//! sync engine compares those clocks against per-entity frontiers to decide
//! whether a remote operation is new, stale, a duplicate, or concurrent.

use oplog_types::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causality relationship between two vector clocks.
///
/// Read as "self is `<order>` other".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CausalOrder {
    /// First clock happened before second.
    Before,
    /// First clock happened after second.
    After,
    /// Clocks are concurrent (neither happened before the other).
    Concurrent,
    /// Clocks are identical.
    Equal,
}

impl CausalOrder {
    /// The order seen from the other side of the comparison.
    #[must_use]
    pub const fn reversed(self) -> Self {
        match self {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            other => other,
        }
    }
}

/// A vector clock over client ids.
///
/// Serializes as a plain `{ "client": counter }` map. Zero entries are
/// equivalent to absent entries for every comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<ClientId, u64>,
}

impl VectorClock {
    /// Creates a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Creates a clock from `(client, counter)` pairs. Later duplicates win.
    #[must_use]
    pub fn from_entries<I, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (C, u64)>,
        C: Into<ClientId>,
    {
        Self {
            clocks: entries.into_iter().map(|(c, t)| (c.into(), t)).collect(),
        }
    }

    /// Returns the counter for a client (0 if not present).
    #[must_use]
    pub fn get(&self, client: &ClientId) -> u64 {
        self.clocks.get(client).copied().unwrap_or(0)
    }

    /// Returns all clients and their counters in client order.
    pub fn entries(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.clocks.iter()
    }

    /// Returns the number of clients in the clock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Returns true if the clock has no non-zero entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|&t| t == 0)
    }

    /// Increments the counter for a client and returns the new value.
    pub fn increment(&mut self, client: &ClientId) -> u64 {
        let entry = self.clocks.entry(client.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Returns a copy of this clock incremented for `client`.
    #[must_use]
    pub fn incremented(&self, client: &ClientId) -> Self {
        let mut next = self.clone();
        next.increment(client);
        next
    }

    /// Raises the counter for a client to `time` if it is higher.
    pub fn update(&mut self, client: &ClientId, time: u64) {
        let entry = self.clocks.entry(client.clone()).or_insert(0);
        if time > *entry {
            *entry = time;
        }
    }

    /// Merges another vector clock into this one (pointwise max).
    pub fn merge(&mut self, other: &Self) {
        for (client, &time) in &other.clocks {
            self.update(client, time);
        }
    }

    /// Creates a new clock that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Merges every clock yielded by the iterator.
    #[must_use]
    pub fn merge_all<'a>(clocks: impl IntoIterator<Item = &'a VectorClock>) -> Self {
        clocks.into_iter().fold(Self::new(), |mut acc, c| {
            acc.merge(c);
            acc
        })
    }

    /// Compares this clock with another to determine causal ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut self_ge = true;
        let mut other_ge = true;

        for client in self.clocks.keys().chain(other.clocks.keys()) {
            let a = self.get(client);
            let b = other.get(client);
            if a < b {
                self_ge = false;
            }
            if b < a {
                other_ge = false;
            }
            if !self_ge && !other_ge {
                return CausalOrder::Concurrent;
            }
        }

        match (self_ge, other_ge) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Returns true if this clock is causally before the other.
    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Returns true if this clock is causally after the other.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }

    /// Returns true if this clock is concurrent with the other.
    #[must_use]
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// Returns true if this clock dominates the other (>= for all clients).
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}

impl<C: Into<ClientId>> FromIterator<(C, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (C, u64)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (client, time)) in self.clocks.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{client}:{time}")?;
        }
        f.write_str("}")
    }
}
