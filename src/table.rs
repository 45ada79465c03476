// File: src/table.rs
//
// Open-addressed hash table keyed by interned strings.
// Keys compare by handle identity and probe with the string's cached
// FNV-1a hash; a content-addressed probe (find_string) exists solely so the
// string pool can intern new strings.

use crate::object::ObjString;
use crate::value::Value;
use std::rc::Rc;

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;
const TABLE_MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
enum Entry {
    Empty,
    // Left behind by delete so probe chains stay intact.
    Tombstone,
    Full { key: Rc<ObjString>, value: Value },
}

/// Hash table from interned string to value.
#[derive(Debug, Clone, Default)]
pub struct Table {
    // Full and tombstone entries together, so the load factor accounts for
    // probe-chain length rather than live keys.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table { count: 0, entries: Vec::new() }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Full { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &Rc<ObjString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match &self.entries[self.find_slot(key)] {
            Entry::Full { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    /// Inserts or overwrites. Returns true when the key was not present.
    pub fn set(&mut self, key: Rc<ObjString>, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }
        let slot = self.find_slot(&key);
        let is_new = match &self.entries[slot] {
            Entry::Empty => {
                self.count += 1;
                true
            }
            // Reusing a tombstone does not raise the count; it was never
            // decremented on delete.
            Entry::Tombstone => true,
            Entry::Full { .. } => false,
        };
        self.entries[slot] = Entry::Full { key, value };
        is_new
    }

    /// Removes a key, leaving a tombstone. Returns true when it was present.
    pub fn delete(&mut self, key: &Rc<ObjString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = self.find_slot(key);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copies every entry of `other` into this table.
    pub fn add_all(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Entry::Full { key, value } = entry {
                self.set(Rc::clone(key), value.clone());
            }
        }
    }

    /// Looks a string up by contents instead of identity. This is the one
    /// probe that compares bytes; everything else trusts interning.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Rc<ObjString>> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match &self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Full { key, .. } => {
                    if key.hash == hash && &*key.chars == chars {
                        return Some(Rc::clone(key));
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Index of the entry for `key`: its occupied slot, or the slot an
    /// insert should use (the first tombstone on the probe chain, else the
    /// terminating empty slot). Capacity must be non-zero.
    fn find_slot(&self, key: &Rc<ObjString>) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full { key: existing, .. } => {
                    if Rc::ptr_eq(existing, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    // Doubles capacity and rehashes, discarding tombstones.
    fn grow(&mut self) {
        let capacity = (self.entries.len() * 2).max(TABLE_MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; capacity]);
        self.count = 0;
        for entry in old {
            if let Entry::Full { key, value } = entry {
                let slot = self.find_slot(&key);
                self.entries[slot] = Entry::Full { key, value };
                self.count += 1;
            }
        }
    }
}
