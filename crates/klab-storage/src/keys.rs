// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Dictionary for keyed (categorical) storages

use ahash::AHashMap;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct KeyTableInner {
    keys: Vec<String>,
    codes: AHashMap<String, i32>,
}

/// Interns category keys as dense `i32` codes, shared by all buffers of a storage
#[derive(Debug, Default)]
pub struct KeyTable {
    inner: RwLock<KeyTableInner>,
}

impl KeyTable {
    /// Code for `key`, assigning the next free one if unseen
    pub fn intern(&self, key: &str) -> i32 {
        if let Some(code) = self.inner.read().codes.get(key) {
            return *code;
        }
        let mut inner = self.inner.write();
        if let Some(code) = inner.codes.get(key) {
            return *code;
        }
        let code = inner.keys.len() as i32;
        inner.keys.push(key.to_string());
        inner.codes.insert(key.to_string(), code);
        code
    }

    pub fn key(&self, code: i32) -> Option<String> {
        usize::try_from(code)
            .ok()
            .and_then(|i| self.inner.read().keys.get(i).cloned())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let table = KeyTable::default();
        assert_eq!(table.intern("water"), 0);
        assert_eq!(table.intern("forest"), 1);
        assert_eq!(table.intern("water"), 0);
        assert_eq!(table.key(1).as_deref(), Some("forest"));
        assert_eq!(table.key(-1), None);
        assert_eq!(table.len(), 2);
    }
}
