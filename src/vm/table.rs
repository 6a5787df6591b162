use super::heap::InternedStr;
use super::Value;

/// One slot of the table. Three states:
/// - empty: key None, value Nil
/// - tombstone: key None, value true
/// - live: key Some
#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<InternedStr>,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    value: Value::Nil,
};

/// An open-addressing hash table keyed by interned strings.
///
/// Capacity is always a power of two so the probe index is
/// `hash & (capacity - 1)`; collisions are resolved by linear probing.
/// Keys compare by identity, which interning makes equivalent to
/// content equality. Deletions leave tombstones so probe sequences
/// stay intact; tombstones are reused on insert and dropped on grow.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries.
    live: usize,
    /// Live entries plus tombstones; drives the load factor so repeated
    /// insert/delete cycles cannot degrade probing.
    used: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocated slot count (used for heap size accounting).
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`. Returns the index of the live entry holding it,
    /// or of the slot an insert should use (the first tombstone on the
    /// probe path if any, else the terminating empty slot).
    fn find_entry(entries: &[Entry], key: InternedStr) -> usize {
        let mask = entries.len() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) => {
                    if k == key {
                        return index;
                    }
                }
                None => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: InternedStr) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[Self::find_entry(&self.entries, key)];
        entry.key.map(|_| entry.value)
    }

    /// Insert or update. Returns true if the key was not present.
    pub fn set(&mut self, key: InternedStr, value: Value) -> bool {
        // Max load factor 3/4.
        if (self.used + 1) * 4 > self.entries.len() * 3 {
            self.grow();
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new {
            self.live += 1;
            // A reused tombstone was already counted toward the load.
            if entry.value.is_nil() {
                self.used += 1;
            }
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Remove a key, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: InternedStr) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        self.live -= 1;
        true
    }

    /// Copy every entry of `other` into this table.
    pub fn add_all(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (InternedStr, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Specialized lookup used before a string is interned: probes by
    /// hash and asks `matches` to compare content (length and bytes).
    pub fn find_string(
        &self,
        hash: u32,
        mut matches: impl FnMut(InternedStr) -> bool,
    ) -> Option<InternedStr> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(key) => {
                    if key.hash == hash && matches(key) {
                        return Some(key);
                    }
                }
                None => {
                    // An empty non-tombstone slot ends the probe sequence.
                    if entry.value.is_nil() {
                        return None;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity]);
        // Re-insert live entries only; tombstones are dropped.
        self.used = self.live;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&self.entries, key);
                self.entries[index] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::heap::GcRef;

    fn key(index: usize, hash: u32) -> InternedStr {
        InternedStr {
            r: GcRef { index },
            hash,
        }
    }

    #[test]
    fn test_set_get() {
        let mut table = Table::new();
        let k = key(0, 17);
        assert!(table.set(k, Value::Number(1.0)));
        assert_eq!(table.get(k), Some(Value::Number(1.0)));
        assert!(!table.set(k, Value::Number(2.0)));
        assert_eq!(table.get(k), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_get_missing() {
        let table = Table::new();
        assert_eq!(table.get(key(0, 0)), None);
    }

    #[test]
    fn test_count_tracks_inserts_minus_deletes() {
        let mut table = Table::new();
        for i in 0..32 {
            table.set(key(i, i as u32), Value::Number(i as f64));
        }
        for i in 0..10 {
            assert!(table.delete(key(i, i as u32)));
        }
        assert_eq!(table.len(), 22);
    }

    #[test]
    fn test_delete_leaves_probe_sequence_intact() {
        let mut table = Table::new();
        // Three keys with the same hash collide into one probe chain.
        let a = key(1, 5);
        let b = key(2, 5);
        let c = key(3, 5);
        table.set(a, Value::Number(1.0));
        table.set(b, Value::Number(2.0));
        table.set(c, Value::Number(3.0));

        assert!(table.delete(b));
        assert_eq!(table.get(c), Some(Value::Number(3.0)));
        assert_eq!(table.get(b), None);
    }

    #[test]
    fn test_tombstone_reused_on_insert() {
        let mut table = Table::new();
        let a = key(1, 9);
        table.set(a, Value::Nil);
        table.delete(a);
        assert!(table.set(a, Value::Bool(true)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(a), Some(Value::Bool(true)));
    }

    #[test]
    fn test_survives_growth() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i, (i * 31) as u32), Value::Number(i as f64));
        }
        for i in 0..100 {
            assert_eq!(
                table.get(key(i, (i * 31) as u32)),
                Some(Value::Number(i as f64)),
                "lost key {}",
                i
            );
        }
    }

    #[test]
    fn test_find_string_matches_by_identity_probe() {
        let mut table = Table::new();
        let k = key(7, 42);
        table.set(k, Value::Nil);
        let found = table.find_string(42, |candidate| candidate.r.index == 7);
        assert_eq!(found, Some(k));
        let missing = table.find_string(42, |_| false);
        assert_eq!(missing, None);
    }

    #[test]
    fn test_add_all() {
        let mut from = Table::new();
        from.set(key(1, 1), Value::Number(1.0));
        from.set(key(2, 2), Value::Number(2.0));
        let mut to = Table::new();
        to.set(key(2, 2), Value::Number(9.0));
        to.add_all(&from);
        assert_eq!(to.len(), 2);
        // add_all overwrites existing entries.
        assert_eq!(to.get(key(2, 2)), Some(Value::Number(2.0)));
    }
}
