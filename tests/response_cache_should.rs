// cache invariants from the outside: round trips, the 10 MiB entry cap and
// range slicing semantics
use bytes::Bytes;

use streamgate::server::services::cache_services::{
    parse_range_header, CacheServiceTrait, ResponseCacheService, MAX_ENTRY_BYTES,
};

#[test]
fn test_put_get_round_trip() {
    let cache = ResponseCacheService::new(64 << 20);
    let body = Bytes::from(vec![9u8; 4096]);
    cache.put("fp", body.clone(), Some("image/jpeg".into()));
    assert_eq!(cache.get("fp").unwrap().body, body);
}

#[test]
fn test_entries_over_ten_mib_are_never_stored() {
    let cache = ResponseCacheService::new(u64::MAX);

    let at_cap = Bytes::from(vec![0u8; MAX_ENTRY_BYTES]);
    cache.put("at-cap", at_cap, None);
    assert!(cache.get("at-cap").is_some());

    let over_cap = Bytes::from(vec![0u8; MAX_ENTRY_BYTES + 1]);
    cache.put("over-cap", over_cap, None);
    assert!(cache.get("over-cap").is_none());
}

#[test]
fn test_range_slice_on_a_cached_object() {
    // cached 2 MiB object, client asks for the first KiB
    let total = 2 * 1024 * 1024;
    let (start, end) = parse_range_header("bytes=0-1023", total).unwrap();
    assert_eq!((start, end), (0, 1023));

    let body = Bytes::from((0..total).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let slice = body.slice(start..=end);
    assert_eq!(slice.len(), 1024);
    assert_eq!(&slice[..], &body[0..1024]);
    assert_eq!(
        format!("bytes {}-{}/{}", start, end, total),
        "bytes 0-1023/2097152"
    );
}

#[test]
fn test_invalid_ranges_fall_back_to_full_body() {
    assert_eq!(parse_range_header("bytes=10-5", 100), None);
    assert_eq!(parse_range_header("bytes=100-200", 100), None);
    assert_eq!(parse_range_header("bytes=-", 100), None);
    assert_eq!(parse_range_header("garbage", 100), None);
}

#[test]
fn test_pressure_evicts_in_insertion_order() {
    let cache = ResponseCacheService::new(10_000);
    for i in 0..10 {
        cache.put(&format!("k{}", i), Bytes::from(vec![0u8; 2_000]), None);
    }
    // only the five newest fit under the cap
    assert!(cache.get("k0").is_none());
    assert!(cache.get("k4").is_none());
    assert!(cache.get("k5").is_some());
    assert!(cache.get("k9").is_some());
    assert!(cache.stats().total_bytes <= 10_000);
}
