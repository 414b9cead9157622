use std::sync::Arc;

use super::*;
use crate::normalize::FixedResolver;

fn normalizer() -> Normalizer {
    Normalizer::new(Arc::new(FixedResolver(Some("Europe/Stockholm"))))
}

fn line(id: i64, user: i64, created_at: &str, coords: Option<(f64, f64)>, tz: &str) -> String {
    let coordinates = match coords {
        Some((lon, lat)) => format!(r#"{{"type":"Point","coordinates":[{lon},{lat}]}}"#),
        None => "null".to_string(),
    };
    format!(
        r#"{{"created_at":"{created_at}","id":{id},"lang":"sv","text":"hej","coordinates":{coordinates},"user":{{"id":{user},"lang":"sv","location":"Stockholm","utc_offset":3600,"time_zone":"{tz}"}}}}"#
    )
}

fn payload(lines: &[String]) -> Vec<u8> {
    lines.join("\n").into_bytes()
}

#[test]
fn test_parse_export_time() {
    let ts = parse_export_time("Mon Nov 20 10:15:00 +0100 2017").expect("valid timestamp");
    assert_eq!(ts.to_rfc3339(), "2017-11-20T09:15:00+00:00");
    assert!(parse_export_time("2017-11-20T10:15:00Z").is_err());
}

#[test]
fn test_duplicate_activity_ids_are_counted_once() {
    let lines = vec![
        line(42, 7, "Mon Nov 20 10:15:00 +0000 2017", Some((18.06, 59.33)), "Stockholm"),
        line(42, 7, "Mon Nov 20 11:15:00 +0000 2017", None, "Stockholm"),
    ];
    let parsed = parse_group(&payload(&lines), &normalizer()).unwrap();

    assert_eq!(parsed.summary.records, 2);
    assert_eq!(parsed.summary.duplicates, 1);
    assert_eq!(parsed.summary.unique, 1);
    assert_eq!(parsed.user.timeline.len(), 1);
    assert_eq!(parsed.user.timeline[0].activity_id, 42);
    assert_eq!(parsed.user.geotagged.len(), 1);
}

#[test]
fn test_reingesting_a_group_only_adds_duplicates() {
    let lines = vec![
        line(1, 7, "Mon Nov 20 10:15:00 +0000 2017", Some((18.06, 59.33)), "Stockholm"),
        line(2, 7, "Tue Nov 21 10:15:00 +0000 2017", None, "Stockholm"),
        line(3, 7, "Wed Nov 22 10:15:00 +0000 2017", Some((18.07, 59.34)), "Stockholm"),
    ];
    let once = parse_group(&payload(&lines), &normalizer()).unwrap();
    let doubled: Vec<String> = lines.iter().chain(lines.iter()).cloned().collect();
    let twice = parse_group(&payload(&doubled), &normalizer()).unwrap();

    assert_eq!(twice.summary.unique, once.summary.unique);
    assert_eq!(twice.summary.duplicates, lines.len() as u64);
    assert_eq!(twice.summary.geotagged, once.summary.geotagged);
    assert_eq!(twice.user.timeline, once.user.timeline);
}

#[test]
fn test_timeline_is_chronological() {
    let lines = vec![
        line(3, 7, "Wed Nov 22 10:15:00 +0000 2017", None, "Stockholm"),
        line(1, 7, "Mon Nov 20 10:15:00 +0000 2017", None, "Stockholm"),
        line(2, 7, "Tue Nov 21 10:15:00 +0000 2017", None, "Stockholm"),
    ];
    let parsed = parse_group(&payload(&lines), &normalizer()).unwrap();
    let ids: Vec<i64> = parsed.user.timeline.iter().map(|t| t.activity_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(
        parsed
            .user
            .timeline
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at)
    );
}

#[test]
fn test_cross_user_mismatch_fails_group() {
    let lines = vec![
        line(1, 7, "Mon Nov 20 10:15:00 +0000 2017", None, "Stockholm"),
        line(2, 8, "Tue Nov 21 10:15:00 +0000 2017", None, "Stockholm"),
    ];
    let err = parse_group(&payload(&lines), &normalizer()).unwrap_err();
    assert!(matches!(
        err,
        Error::CrossUserMismatch {
            expected: 7,
            found: 8
        }
    ));
}

#[test]
fn test_malformed_lines_are_dropped_and_counted() {
    let lines = vec![
        "{not json".to_string(),
        line(1, 7, "Mon Nov 20 10:15:00 +0000 2017", None, "Stockholm"),
        line(2, 7, "2017-11-21 10:15", None, "Stockholm"),
        String::new(),
    ];
    let parsed = parse_group(&payload(&lines), &normalizer()).unwrap();
    assert_eq!(parsed.summary.malformed, 2);
    assert_eq!(parsed.summary.records, 1);
    assert_eq!(parsed.user.timeline.len(), 1);
}

#[test]
fn test_empty_group_is_an_error() {
    assert!(matches!(
        parse_group(b"", &normalizer()),
        Err(Error::EmptyGroup)
    ));
    assert!(matches!(
        parse_group(b"garbage\n{}\n", &normalizer()),
        Err(Error::EmptyGroup)
    ));
}

#[test]
fn test_only_two_value_coordinates_are_geotagged() {
    let three = r#"{"created_at":"Mon Nov 20 10:15:00 +0000 2017","id":9,"lang":"en","coordinates":{"coordinates":[1.0,2.0,3.0]},"user":{"id":7}}"#;
    let two = line(10, 7, "Tue Nov 21 10:15:00 +0000 2017", Some((18.06, 59.33)), "");
    let parsed = parse_group(&payload(&[three.to_string(), two]), &normalizer()).unwrap();

    assert_eq!(parsed.summary.unique, 2);
    assert_eq!(parsed.summary.geotagged, 1);
    assert!(parsed.user.timeline[0].coordinates().is_none());
    let geo = &parsed.user.geotagged[0];
    assert_eq!(geo.activity_id, 10);
    assert_eq!((geo.latitude, geo.longitude), (59.33, 18.06));
}

#[test]
fn test_profiles_keep_only_changes() {
    let lines = vec![
        line(1, 7, "Mon Nov 20 10:15:00 +0000 2017", None, "Stockholm"),
        line(2, 7, "Tue Nov 21 10:15:00 +0000 2017", None, "Stockholm"),
        line(3, 7, "Wed Nov 22 10:15:00 +0000 2017", None, "London"),
        line(4, 7, "Thu Nov 23 10:15:00 +0000 2017", None, "London"),
        line(5, 7, "Fri Nov 24 10:15:00 +0000 2017", None, "Stockholm"),
    ];
    let parsed = parse_group(&payload(&lines), &normalizer()).unwrap();
    let zones: Vec<&str> = parsed
        .user
        .profiles
        .iter()
        .map(|p| p.time_zone.as_str())
        .collect();
    // Adjacent-only collapse: Stockholm reappears after London.
    assert_eq!(zones, vec!["Stockholm", "London", "Stockholm"]);
    assert_eq!(parsed.user.profiles[1].activity_id, 3);
    assert!(
        parsed
            .user
            .profiles
            .windows(2)
            .all(|w| !w[0].same_profile(&w[1]))
    );
}

#[test]
fn test_crlf_payload() {
    let text = format!(
        "{}\r\n{}\r\n",
        line(1, 7, "Mon Nov 20 10:15:00 +0000 2017", None, "Stockholm"),
        line(2, 7, "Tue Nov 21 10:15:00 +0000 2017", None, "Stockholm"),
    );
    let parsed = parse_group(text.as_bytes(), &normalizer()).unwrap();
    assert_eq!(parsed.summary.malformed, 0);
    assert_eq!(parsed.summary.records, 2);
}

#[test]
fn test_null_or_odd_inner_coordinates_keep_the_record() {
    let null_inner = r#"{"created_at":"Mon Nov 20 10:15:00 +0000 2017","id":42,"lang":"sv","coordinates":{"type":"Point","coordinates":null},"user":{"id":7}}"#;
    let string_inner = r#"{"created_at":"Tue Nov 21 10:15:00 +0000 2017","id":43,"lang":"sv","coordinates":{"type":"Point","coordinates":"here"},"user":{"id":7}}"#;
    let plain = line(44, 7, "Wed Nov 22 10:15:00 +0000 2017", None, "Stockholm");
    let parsed = parse_group(
        &payload(&[null_inner.to_string(), string_inner.to_string(), plain]),
        &normalizer(),
    )
    .unwrap();

    assert_eq!(parsed.summary.malformed, 0);
    assert_eq!(parsed.summary.records, 3);
    assert_eq!(parsed.summary.unique, 3);
    assert_eq!(parsed.summary.geotagged, 0);
    assert_eq!(parsed.user.timeline.len(), 3);
    assert!(parsed.user.timeline.iter().all(|item| item.coordinates().is_none()));
    assert!(parsed.user.geotagged.is_empty());
}
