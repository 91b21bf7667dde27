use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Called with the key and value of every entry pushed out by capacity.
pub type EvictHook<V> = Box<dyn FnMut(&str, V) + Send>;

struct Slot<V> {
    value: V,
    last_used: u64,
}

/// Fixed-capacity map that drops its least-recently-used entry on overflow.
///
/// Both [`get`](Self::get) and [`put`](Self::put) count as a use. Explicit
/// [`remove`](Self::remove) hands the value back to the caller and does not
/// run the eviction hook.
pub struct BoundedCache<V> {
    capacity: usize,
    clock: u64,
    slots: HashMap<String, Slot<V>>,
    on_evict: Option<EvictHook<V>>,
}

impl<V> BoundedCache<V> {
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            slots: HashMap::new(),
            on_evict: None,
        }
    }

    #[must_use]
    pub fn with_evict(mut self, hook: EvictHook<V>) -> Self {
        self.on_evict = Some(hook);
        self
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get(&mut self, key: &str) -> Option<&mut V> {
        let now = self.tick();
        let slot = self.slots.get_mut(key)?;
        slot.last_used = now;
        Some(&mut slot.value)
    }

    /// Insert or replace `key`. Inserting a new key into a full cache evicts
    /// the stalest entry first.
    pub fn put(&mut self, key: &str, value: V) -> &mut V {
        let now = self.tick();
        if !self.slots.contains_key(key) && self.slots.len() >= self.capacity {
            self.evict_oldest();
        }
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let slot = occupied.into_mut();
                slot.value = value;
                slot.last_used = now;
                &mut slot.value
            }
            Entry::Vacant(vacant) => {
                &mut vacant
                    .insert(Slot {
                        value,
                        last_used: now,
                    })
                    .value
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.slots.remove(key).map(|slot| slot.value)
    }

    /// Remove every entry, handing each to `f` in no particular order.
    pub fn drain(&mut self, mut f: impl FnMut(&str, V)) {
        for (key, slot) in self.slots.drain() {
            f(&key, slot.value);
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.slots.values().map(|slot| &slot.value)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_oldest(&mut self) {
        let Some(key) = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone())
        else {
            return;
        };
        if let Some(slot) = self.slots.remove(&key)
            && let Some(hook) = self.on_evict.as_mut()
        {
            hook(&key, slot.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recording(capacity: usize) -> (BoundedCache<u32>, Arc<Mutex<Vec<(String, u32)>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = BoundedCache::new(capacity).with_evict(Box::new(move |key: &str, value: u32| {
            sink.lock().unwrap().push((key.to_string(), value));
        }));
        (cache, evicted)
    }

    #[test]
    fn evicts_least_recently_used_exactly_once() {
        let (mut cache, evicted) = recording(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        // "a" becomes the freshest; "b" is now the stalest.
        assert_eq!(cache.get("a").copied(), Some(1));

        cache.put("d", 4);
        assert_eq!(*evicted.lock().unwrap(), vec![("b".to_string(), 2)]);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("b"));
        assert!(cache.contains("a"));
    }

    #[test]
    fn replacing_an_existing_key_does_not_evict() {
        let (mut cache, evicted) = recording(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("a", 10);
        assert!(evicted.lock().unwrap().is_empty());
        assert_eq!(cache.get("a").copied(), Some(10));
    }

    #[test]
    fn explicit_remove_skips_the_hook() {
        let (mut cache, evicted) = recording(1);
        cache.put("a", 1);
        assert_eq!(cache.remove("a"), Some(1));
        cache.put("b", 2);
        assert!(evicted.lock().unwrap().is_empty());
        assert_eq!(cache.remove("missing"), None);
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let (mut cache, evicted) = recording(0);
        assert_eq!(cache.capacity(), 1);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(*evicted.lock().unwrap(), vec![("a".to_string(), 1)]);
    }

    #[test]
    fn drain_empties_without_the_hook() {
        let (mut cache, evicted) = recording(4);
        cache.put("a", 1);
        cache.put("b", 2);
        let mut seen = Vec::new();
        cache.drain(|_, value| seen.push(value));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        assert!(cache.is_empty());
        assert!(evicted.lock().unwrap().is_empty());
    }
}
