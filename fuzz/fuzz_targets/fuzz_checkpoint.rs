//! Fuzz target for checkpoint parsing.
//!
//! Anything that parses must print back to a string that parses to the
//! same checkpoint.

#![no_main]

use libfuzzer_sys::fuzz_target;
use multimaster::Checkpoint;

fuzz_target!(|data: &str| {
    if let Ok(cp) = data.parse::<Checkpoint>() {
        let shown = cp.to_string();
        assert_eq!(shown.parse::<Checkpoint>().ok(), Some(cp));
    }
});
