//! The consistent-hash ring.
//!
//! Members sit on a `u64` circle at a fixed number of virtual-node
//! positions each; a key walks clockwise from its own position and
//! takes the first `n` distinct members. Positions derive only from
//! member addresses, so the walk is a pure function of the membership
//! set and the key.

use std::collections::{BTreeMap, HashMap};

/// Virtual nodes per member.
pub(crate) const DEFAULT_VNODES: usize = 20;

#[derive(Debug)]
pub(crate) struct Ring {
    vnodes: usize,
    positions: BTreeMap<u64, String>,
    /// address -> last-seen unix seconds
    members: HashMap<String, i64>,
}

impl Ring {
    pub(crate) fn new(vnodes: usize) -> Self {
        Self {
            vnodes: vnodes.max(1),
            positions: BTreeMap::new(),
            members: HashMap::new(),
        }
    }

    /// Adds a member or refreshes its last-seen stamp.
    pub(crate) fn upsert(&mut self, address: &str, last_seen: i64) {
        if !self.members.contains_key(address) {
            for index in 0..self.vnodes {
                self.positions
                    .insert(position(address, index), address.to_string());
            }
        }
        self.members.insert(address.to_string(), last_seen);
    }

    pub(crate) fn remove(&mut self, address: &str) {
        if self.members.remove(address).is_some() {
            self.positions.retain(|_, member| member != address);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// Members whose last-seen age exceeds `max_age` as of `now`.
    pub(crate) fn stale(&self, now: i64, max_age: i64) -> Vec<String> {
        self.members
            .iter()
            .filter(|&(_, &seen)| now - seen > max_age)
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub(crate) fn contains(&self, address: &str) -> bool {
        self.members.contains_key(address)
    }

    /// The first `n` distinct members clockwise from `key`'s position.
    ///
    /// Returns `min(n, len)` members; a deterministic function of the
    /// membership set, the key and `n`.
    pub(crate) fn get_n(&self, key: &str, n: usize) -> Vec<String> {
        let want = n.min(self.members.len());
        let mut picked: Vec<String> = Vec::with_capacity(want);
        if want == 0 {
            return picked;
        }

        let start = key_position(key);
        let walk = self
            .positions
            .range(start..)
            .chain(self.positions.range(..start));

        for (_, member) in walk {
            if !picked.iter().any(|p| p == member) {
                picked.push(member.clone());
                if picked.len() == want {
                    break;
                }
            }
        }
        picked
    }
}

fn position(address: &str, index: usize) -> u64 {
    hash64(format!("{address}-{index}").as_bytes())
}

fn key_position(key: &str) -> u64 {
    hash64(key.as_bytes())
}

fn hash64(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(first)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ring_of(addresses: &[&str]) -> Ring {
        let mut ring = Ring::new(DEFAULT_VNODES);
        for address in addresses {
            ring.upsert(address, 0);
        }
        ring
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let ring = Ring::new(DEFAULT_VNODES);
        assert!(ring.get_n("k", 2).is_empty());
    }

    #[test]
    fn removal_takes_a_member_off_the_circle() {
        let mut ring = ring_of(&["a:1", "b:1", "c:1"]);
        ring.remove("b:1");
        assert_eq!(ring.len(), 2);
        for key in ["x", "y", "z", "w"] {
            assert!(!ring.get_n(key, 3).contains(&"b:1".to_string()));
        }
    }

    #[test]
    fn stale_reports_only_old_members() {
        let mut ring = Ring::new(DEFAULT_VNODES);
        ring.upsert("fresh:1", 100);
        ring.upsert("old:1", 90);
        assert_eq!(ring.stale(101, 5), vec!["old:1".to_string()]);
    }

    fn arb_members() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::hash_set("[a-z]{1,6}:[0-9]{2,4}", 0..6)
            .prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        // get_n returns min(n, |ring|) distinct members and does not
        // depend on insertion order.
        #[test]
        fn get_n_is_sized_and_deterministic(
            members in arb_members(),
            key in "[a-z0-9]{1,12}",
            n in 0usize..5
        ) {
            let forward = ring_of(&members.iter().map(String::as_str).collect::<Vec<_>>());
            let mut reversed_members = members.clone();
            reversed_members.reverse();
            let reversed = ring_of(
                &reversed_members.iter().map(String::as_str).collect::<Vec<_>>(),
            );

            let picked = forward.get_n(&key, n);
            prop_assert_eq!(picked.len(), n.min(members.len()));

            // Distinct members only.
            for (i, a) in picked.iter().enumerate() {
                for b in &picked[i + 1..] {
                    prop_assert_ne!(a, b);
                }
            }

            // Same inputs, same answer, regardless of build order or
            // repeated calls.
            prop_assert_eq!(&picked, &reversed.get_n(&key, n));
            prop_assert_eq!(&picked, &forward.get_n(&key, n));
        }
    }
}
