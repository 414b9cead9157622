use super::*;

#[test]
fn test_format_number_comma() {
    let options = NumberFormatOptions {
        use_comma: true,
        ..NumberFormatOptions::default()
    };

    assert_eq!(format_number(1000u64, &options), "1,000");
    assert_eq!(format_number(1_000_000u64, &options), "1,000,000");
    assert_eq!(format_number(123u32, &options), "123");
}

#[test]
fn test_format_number_human() {
    let options = NumberFormatOptions {
        use_human: true,
        decimal_places: 1,
        ..NumberFormatOptions::default()
    };

    assert_eq!(format_number(100u64, &options), "100");
    assert_eq!(format_number(1500u64, &options), "1.5k");
    assert_eq!(format_number(1_500_000u64, &options), "1.5m");
    assert_eq!(format_number(1_500_000_000u64, &options), "1.5b");
    assert_eq!(format_number(1_500_000_000_000u64, &options), "1.5t");
}

#[test]
fn test_format_number_plain_accepts_usize() {
    let options = NumberFormatOptions::default();
    assert_eq!(format_number(1000usize, &options), "1000");
}

#[test]
fn test_format_share() {
    let options = NumberFormatOptions {
        decimal_places: 1,
        ..NumberFormatOptions::default()
    };
    assert_eq!(format_share(10.0 / 13.0, &options), "76.9%");
    assert_eq!(format_share(1.0, &options), "100.0%");
}

#[test]
fn test_warn_once_accepts_repeats() {
    warn_once("unresolved zone near 0.0 0.0");
    warn_once("unresolved zone near 0.0 0.0");
    let cache = WARNED_MESSAGES.get().expect("initialized");
    assert!(cache.lock().contains("unresolved zone near 0.0 0.0"));
}
