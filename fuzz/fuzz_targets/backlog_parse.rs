//! Fuzz harness for `BacklogDocument::parse`.
//!
//! The backlog is hand-edited by agents and humans, so the parser must
//! accept any text without panicking and must render it back unchanged.

#![no_main]
use jobhunt_core::backlog::BacklogDocument;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let document = BacklogDocument::parse(text);
    assert_eq!(document.render(), text);

    let counts = document.counts();
    assert!(counts.total() <= document.entries().count());
    for entry in document.entries() {
        let _ = entry.key();
        let _ = entry.lane_hint;
    }
});
