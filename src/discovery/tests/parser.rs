use crate::discovery::parser::*;
use crate::types::DeviceKind;
use std::collections::HashMap;

fn txt(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn raop_wins_over_everything() {
    // Rule 1 fires even when the features would say video
    let kind = classify("_raop._tcp.local.", &txt(&[("ft", "0x2")]));
    assert_eq!(kind, DeviceKind::AudioReceiver);
}

#[test]
fn airplay_with_video_bit_is_video_capable() {
    let kind = classify("_airplay._tcp.local.", &txt(&[("ft", "0x2")]));
    assert_eq!(kind, DeviceKind::VideoCapable);

    let kind = classify("_airplay._tcp.local.", &txt(&[("ft", "0x445F8A00,0x1C340")]));
    assert_eq!(kind, DeviceKind::AudioReceiver);
}

#[test]
fn airplay_without_features_is_audio() {
    assert_eq!(
        classify("_airplay._tcp.local.", &txt(&[])),
        DeviceKind::AudioReceiver
    );
}

#[test]
fn airport_maps_to_airport_express() {
    assert_eq!(
        classify("_airport._tcp.local.", &txt(&[])),
        DeviceKind::AirportExpress
    );
}

#[test]
fn unrecognized_types_are_unknown_but_kept() {
    assert_eq!(classify("_spotify._tcp.local.", &txt(&[])), DeviceKind::Unknown);
}

#[test]
fn hex_parsing_accepts_prefixes_and_pairs() {
    assert_eq!(parse_hex("0x1C340"), Some(0x1C340));
    assert_eq!(parse_hex("1C340"), Some(0x1C340));
    assert_eq!(parse_hex("0X02"), Some(2));
    // comma form: low word first
    assert_eq!(parse_hex("0x445F8A00,0x1C340"), Some(0x1C340_445F_8A00));
    assert_eq!(parse_hex("notahex"), None);
}

#[test]
fn txt_extraction_skips_non_utf8_values() {
    let props: Vec<(&str, &[u8])> = vec![
        ("am", b"AudioAccessory5,1".as_slice()),
        ("fv", b"\xFF\xFE\x00".as_slice()),
        ("ft", b"0x1C340".as_slice()),
    ];
    let txt = extract_txt(props.into_iter());
    assert_eq!(txt.get("am").map(String::as_str), Some("AudioAccessory5,1"));
    assert_eq!(txt.get("ft").map(String::as_str), Some("0x1C340"));
    assert!(!txt.contains_key("fv"));
}

#[test]
fn known_models_get_friendly_names() {
    assert_eq!(friendly_model_name("AudioAccessory5,1"), "HomePod mini");
    assert_eq!(friendly_model_name("AirPort4,107"), "AirPort Express");
    assert_eq!(friendly_model_name("SomethingElse9,9"), "SomethingElse9,9");
}

#[test]
fn instance_name_strips_service_suffix() {
    assert_eq!(
        instance_name("Living Room._raop._tcp.local."),
        "Living Room"
    );
    assert_eq!(instance_name("bare"), "bare");
}
