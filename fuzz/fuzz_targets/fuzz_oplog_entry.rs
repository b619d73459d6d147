//! Fuzz target for oplog entry parsing.
//!
//! Feeds arbitrary BSON documents through `LogEntry::from_oplog` and
//! `normalize_update`. Malformed entries must be rejected, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use multimaster::entry::{normalize_update, LogEntry};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = bson::Document::from_reader(data) else {
        return;
    };

    if let Ok(Some(entry)) = LogEntry::from_oplog(&raw) {
        // Parsed updates are already normalized; doing it again is a no-op.
        if entry.match_spec.is_some() {
            let again = normalize_update(entry.document.clone());
            assert_eq!(again.ok().as_ref(), Some(&entry.document));
        }
    }

    let _ = normalize_update(raw);
});
