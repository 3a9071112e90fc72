use std::path::Path;

use chrono::{TimeZone, Utc};
use statwatch_adapters::parse_profile_page;

#[test]
fn captured_profile_page_extracts_expected_fields() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/profile_page.html");
    let html = std::fs::read_to_string(&path).expect("read fixture");
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();

    let snapshot = parse_profile_page(&html, "Alice", at);

    assert_eq!(snapshot.owner, "Alice");
    assert_eq!(snapshot.timestamp, at);
    assert_eq!(snapshot.rank, 1532);
    assert_eq!(snapshot.upload, "18.42 TiB");
    assert_eq!(snapshot.current_upload, "734.10 GiB");
    assert_eq!(snapshot.current_download, "212.77 GiB");
    assert_eq!(snapshot.points, 48_210);
    assert_eq!(snapshot.seeding_count, 37);
}
