//! Fuzz target for audit export row counting.
//!
//! This tests that `count_data_rows` never panics on arbitrary input,
//! whatever the preamble length.

#![no_main]

use libfuzzer_sys::fuzz_target;
use policy_replication::detector::count_data_rows;

fuzz_target!(|data: &[u8]| {
    let Some((&preamble, rest)) = data.split_first() else {
        return;
    };
    let raw = String::from_utf8_lossy(rest);
    let _ = count_data_rows(&raw, usize::from(preamble % 16));
});
