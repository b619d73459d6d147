// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document helpers used when tagging replicated writes.

use bson::{Bson, Document};

/// Extension methods on [`bson::Document`].
pub trait DocumentExt {
    /// Insert `value` under `key` only if the key is not already present.
    ///
    /// Returns `true` if the value was inserted.
    fn set_if_absent(&mut self, key: &str, value: impl Into<Bson>) -> bool;

    /// Whether this update document uses field modifiers (`$set`, `$inc`, ...)
    /// rather than being a whole-document replacement.
    fn has_modifiers(&self) -> bool;
}

impl DocumentExt for Document {
    fn set_if_absent(&mut self, key: &str, value: impl Into<Bson>) -> bool {
        if self.contains_key(key) {
            return false;
        }
        self.insert(key, value.into());
        true
    }

    fn has_modifiers(&self) -> bool {
        self.keys().any(|k| k.starts_with('$'))
    }
}
