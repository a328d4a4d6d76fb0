//! Fuzz harness for `DedupIndex::parse` and lookups against it.

#![no_main]
use jobhunt_core::backlog::DedupIndex;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let index = DedupIndex::parse(text);
    let rendered = index.render();
    assert_eq!(DedupIndex::parse(&rendered).len(), index.len());

    let probe = text.lines().next().unwrap_or_default();
    let _ = index.check(probe, probe, probe);
    let mut index = index;
    let _ = index.upsert(
        "https://example.com/jobs/1",
        "Acme",
        "Engineer",
        jobhunt_core::backlog::DedupStatus::Applied,
        "2026-01-01",
    );
});
