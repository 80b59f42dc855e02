//! Open-addressing hash table with linear probing and tombstone deletion.
//! Used for globals, a class's methods, an instance's fields, and string
//! interning. Keyed by `*mut ObjString` pointer identity backed by the
//! string's own FNV-1a hash, so lookups never re-hash or re-compare bytes
//! once a key has been interned.

use crate::objects::string::ObjString;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: *mut ObjString,
    value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry { key: std::ptr::null_mut(), value: Value::Nil }
    }
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    pub fn new() -> Table {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Inserts `key -> value`, returning `true` if this created a new key.
    pub fn set(&mut self, key: *mut ObjString, value: Value) -> bool {
        if self.entries.is_empty() || (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            self.grow();
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        if is_new_key && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: *mut ObjString) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() { None } else { Some(entry.value) }
    }

    pub fn contains(&self, key: *mut ObjString) -> bool {
        self.get(key).is_some()
    }

    /// Deletes `key`, leaving a tombstone (`key == null`, `value ==
    /// Bool(true)`) so later probe chains through this slot keep working.
    pub fn delete(&mut self, key: *mut ObjString) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }
        entry.key = std::ptr::null_mut();
        entry.value = Value::Bool(true);
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if !entry.key.is_null() {
                self.set(entry.key, entry.value);
            }
        }
    }

    /// Looks up an interned string by raw bytes + precomputed hash, bypassing
    /// the usual pointer-identity key comparison — this is the one path that
    /// *does* compare bytes, because it's how interning decides whether a
    /// string already exists.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<*mut ObjString> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if entry.value.is_nil() {
                    return None;
                }
            } else {
                let key = unsafe { &*entry.key };
                if key.hash == hash && key.as_str() == chars {
                    return Some(entry.key);
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjString, Value)> + '_ {
        self.entries.iter().filter(|e| !e.key.is_null()).map(|e| (e.key, e.value))
    }

    /// Drops entries whose key string has not survived a GC sweep (the
    /// string-table's own entries never get marked through, only observed).
    /// Leaves `count` untouched: the slot turns into a tombstone, which still
    /// occupies a counted slot for load-factor purposes, exactly like a
    /// tombstone left behind by `delete`.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(*mut ObjString) -> bool) {
        for entry in &mut self.entries {
            if !entry.key.is_null() && !is_marked(entry.key) {
                entry.key = std::ptr::null_mut();
                entry.value = Value::Bool(true);
            }
        }
    }

    fn find_entry(entries: &[Entry], key: *mut ObjString) -> usize {
        let capacity = entries.len();
        let hash = unsafe { (*key).hash };
        let mut index = (hash as usize) & (capacity - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if entry.value.is_nil() {
                    return first_tombstone.unwrap_or(index);
                } else if first_tombstone.is_none() {
                    first_tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;
        for entry in &self.entries {
            if entry.key.is_null() {
                continue;
            }
            let index = Self::find_entry(&new_entries, entry.key);
            new_entries[index] = *entry;
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn leak_string(s: &str) -> *mut ObjString {
        Box::into_raw(Box::new(ObjString::new(s.into())))
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut table = Table::new();
        let key = unsafe { leak_string("answer") };
        assert!(table.set(key, Value::Number(42.0)));
        assert_eq!(table.get(key), Some(Value::Number(42.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_leaves_tombstone_that_does_not_break_later_probes() {
        let mut table = Table::new();
        let a = unsafe { leak_string("a") };
        let b = unsafe { leak_string("b") };
        table.set(a, Value::Number(1.0));
        table.set(b, Value::Number(2.0));
        assert!(table.delete(a));
        assert_eq!(table.get(b), Some(Value::Number(2.0)));
        assert_eq!(table.get(a), None);
    }

    #[test]
    fn find_string_matches_on_bytes_and_hash() {
        let mut table = Table::new();
        let key = unsafe { leak_string("hello") };
        table.set(key, Value::Nil);
        let hash = crate::objects::string::fnv1a(b"hello");
        assert_eq!(table.find_string("hello", hash), Some(key));
        assert_eq!(table.find_string("world", hash), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..20).map(|i| unsafe { leak_string(&format!("k{i}")) }).collect();
        for (i, &k) in keys.iter().enumerate() {
            table.set(k, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 20);
        assert!(table.capacity() as f64 * MAX_LOAD >= 20.0);
    }
}
