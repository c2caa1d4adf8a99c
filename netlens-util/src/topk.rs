use std::collections::HashMap;

/// How many keys the store retains. Keys beyond this bound displace the
/// current minimum, inheriting its count as the estimation error.
const STORE_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug)]
struct Slot {
    count: u64,
    error: u64,
}

/// A weighted heavy-hitters sketch (space-saving).
///
/// Tracks the keys with the largest accumulated weight in a bounded store.
/// While the number of distinct keys stays at or below the store capacity,
/// reported estimates are exact sums; past that point an evicted key's count
/// is inherited by its replacement and tracked as `error`, keeping every
/// estimate an upper bound within `error` of the true weight.
#[derive(Clone, Default)]
pub struct TopK {
    entries: HashMap<String, Slot>,
}

impl TopK {
    /// Creates an empty sketch.
    pub fn new() -> TopK {
        TopK::default()
    }

    /// Adds `weight` to `key`.
    pub fn add(&mut self, key: &str, weight: u64) {
        if let Some(slot) = self.entries.get_mut(key) {
            slot.count += weight;
            return;
        }

        if self.entries.len() < STORE_CAPACITY {
            self.entries.insert(key.to_string(), Slot { count: weight, error: 0 });
            return;
        }

        // Store is full: displace the key with the minimum count.
        let (evict, min) = self
            .entries
            .iter()
            .min_by(|a, b| a.1.count.cmp(&b.1.count).then_with(|| b.0.cmp(a.0)))
            .map(|(k, s)| (k.clone(), s.count))
            .expect("store is non-empty at capacity");
        self.entries.remove(&evict);
        self.entries.insert(
            key.to_string(),
            Slot { count: min + weight, error: min },
        );
    }

    /// Returns the top `n` keys, ordered by decreasing estimate with ties
    /// broken by lexicographic key order.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut items: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|(k, s)| (k.clone(), s.count))
            .collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        items.truncate(n);
        items
    }

    /// Merges another sketch into this one.
    ///
    /// Matching keys sum their counts and errors; the combined store is then
    /// shrunk back to capacity, dropping the smallest survivors.
    pub fn merge(&mut self, other: &TopK) {
        for (key, theirs) in &other.entries {
            self.entries
                .entry(key.clone())
                .and_modify(|mine| {
                    mine.count += theirs.count;
                    mine.error += theirs.error;
                })
                .or_insert(*theirs);
        }

        if self.entries.len() > STORE_CAPACITY {
            let mut items: Vec<(String, Slot)> =
                self.entries.drain().collect();
            items.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
            items.truncate(STORE_CAPACITY);
            self.entries = items.into_iter().collect();
        }
    }

    /// Number of keys currently retained.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the sketch has observed any keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;
    use std::collections::HashMap;

    use super::{TopK, STORE_CAPACITY};

    #[test]
    fn ordering_and_ties() {
        let mut topk = TopK::new();
        topk.add("10.4.1.2", 300);
        topk.add("10.4.3.2", 100);
        topk.add("10.4.2.2", 100);
        topk.add("10.4.1.2", 100);

        let top = topk.top(10);
        assert_eq!(
            top,
            vec![
                ("10.4.1.2".to_string(), 400),
                ("10.4.2.2".to_string(), 100),
                ("10.4.3.2".to_string(), 100),
            ]
        );
    }

    #[test]
    fn truncates_to_n() {
        let mut topk = TopK::new();
        for i in 0..50 {
            topk.add(&format!("key{i:02}"), 100 - i);
        }
        assert_eq!(topk.top(10).len(), 10);
        assert_eq!(topk.top(0).len(), 0);
    }

    #[test]
    fn eviction_inherits_minimum() {
        let mut topk = TopK::new();
        for i in 0..STORE_CAPACITY {
            topk.add(&format!("key{i:04}"), (i as u64) + 10);
        }
        assert_eq!(topk.len(), STORE_CAPACITY);

        // The store is full; a new key displaces the minimum (count 10) and
        // inherits its count as error.
        topk.add("fresh", 1);
        assert_eq!(topk.len(), STORE_CAPACITY);
        let top = topk.top(STORE_CAPACITY);
        let fresh = top.iter().find(|(k, _)| k == "fresh").unwrap();
        assert_eq!(fresh.1, 11);
    }

    #[test]
    fn merge_sums_matching_keys() {
        let mut a = TopK::new();
        let mut b = TopK::new();
        a.add("x", 5);
        a.add("y", 3);
        b.add("x", 7);
        b.add("z", 1);

        a.merge(&b);
        assert_eq!(
            a.top(10),
            vec![
                ("x".to_string(), 12),
                ("y".to_string(), 3),
                ("z".to_string(), 1),
            ]
        );
    }

    #[quickcheck]
    fn exact_below_capacity(weights: Vec<(u8, u8)>) -> bool {
        // At most 256 distinct keys, so nothing is ever evicted and every
        // estimate is the exact sum.
        let mut topk = TopK::new();
        let mut exact: HashMap<String, u64> = HashMap::new();
        for (key, weight) in &weights {
            let key = format!("k{key}");
            let weight = *weight as u64 + 1;
            topk.add(&key, weight);
            *exact.entry(key).or_insert(0) += weight;
        }

        topk.top(usize::MAX)
            .into_iter()
            .all(|(k, est)| exact.get(&k) == Some(&est))
            && topk.len() == exact.len()
    }

    #[quickcheck]
    fn merge_commutes(xs: Vec<(u8, u8)>, ys: Vec<(u8, u8)>) -> bool {
        let build = |pairs: &[(u8, u8)]| {
            let mut topk = TopK::new();
            for (key, weight) in pairs {
                topk.add(&format!("k{key}"), *weight as u64 + 1);
            }
            topk
        };

        let a = build(&xs);
        let b = build(&ys);
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);
        ab.top(usize::MAX) == ba.top(usize::MAX)
    }
}
