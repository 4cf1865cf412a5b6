use plc_gateway::tags::store::{TagPatch, TagStore};
use plc_gateway::tags::structures::{Tag, TagValue};
use rust_decimal::Decimal;
use std::str::FromStr;

fn sample_tag(tag_id: &str, plc_id: &str, address: &str) -> Tag {
    let mut tag = Tag::new(tag_id);
    tag.plc_id = plc_id.to_string();
    tag.address = address.to_string();
    tag
}

fn decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[test]
fn initial_values_default_by_data_type() {
    let store = TagStore::new();

    let mut bool_tag = sample_tag("B1", "compactlogix", "a1");
    bool_tag.data_type = "Boolean".to_string();
    store.add_tag(bool_tag, None);
    assert_eq!(store.get_raw_value("B1"), Some(TagValue::Bool(false)));

    let mut int_tag = sample_tag("I1", "compactlogix", "a2");
    int_tag.data_type = "Int32".to_string();
    store.add_tag(int_tag, None);
    assert_eq!(store.get_raw_value("I1"), Some(TagValue::Int(0)));

    let double_tag = sample_tag("D1", "compactlogix", "a3");
    store.add_tag(double_tag, None);
    assert_eq!(store.get_raw_value("D1"), Some(TagValue::Float(0.0)));

    let mut string_tag = sample_tag("S1", "compactlogix", "a4");
    string_tag.data_type = "String".to_string();
    store.add_tag(string_tag, None);
    assert_eq!(store.get_raw_value("S1"), Some(TagValue::Text(String::new())));
}

#[test]
fn identity_scaling_returns_exact_decimal() {
    let store = TagStore::new();
    store.add_tag(sample_tag("T1", "compactlogix", "a1"), Some(TagValue::Float(9.81)));

    let value = store.get_value("T1").expect("value");
    assert_eq!(value, TagValue::Decimal(decimal("9.81")));
}

#[test]
fn scaling_uses_decimal_arithmetic() {
    let store = TagStore::new();
    let mut tag = sample_tag("T2", "compactlogix", "a1");
    tag.scale_mul = 1.5;
    tag.scale_add = 0.25;
    store.add_tag(tag, Some(TagValue::Int(10)));

    let value = store.get_value("T2").expect("value");
    assert_eq!(value, TagValue::Decimal(decimal("15.25")));
}

#[test]
fn decimals_quantize_half_up_with_padding() {
    let store = TagStore::new();
    let mut tag = sample_tag("T3", "compactlogix", "a1");
    tag.decimals = Some(2);
    store.add_tag(tag, Some(TagValue::Float(2.345)));
    assert_eq!(store.get_value("T3").unwrap(), TagValue::Decimal(decimal("2.35")));

    let mut tag = sample_tag("T4", "compactlogix", "a2");
    tag.decimals = Some(3);
    store.add_tag(tag, Some(TagValue::Float(1.2)));
    let TagValue::Decimal(padded) = store.get_value("T4").unwrap() else {
        panic!("expected decimal");
    };
    assert_eq!(padded.to_string(), "1.200");
}

#[test]
fn booleans_bypass_scaling() {
    let store = TagStore::new();
    let mut tag = sample_tag("B2", "compactlogix", "a1");
    tag.scale_mul = 2.0;
    store.add_tag(tag, Some(TagValue::Bool(true)));
    assert_eq!(store.get_value("B2").unwrap(), TagValue::Bool(true));

    // A boolean-typed tag bypasses even when the raw value is numeric.
    let mut tag = sample_tag("B3", "compactlogix", "a2");
    tag.data_type = "Boolean".to_string();
    tag.scale_mul = 2.0;
    store.add_tag(tag, Some(TagValue::Int(1)));
    assert_eq!(store.get_value("B3").unwrap(), TagValue::Int(1));
}

#[test]
fn non_numeric_text_bypasses_scaling() {
    let store = TagStore::new();
    let mut tag = sample_tag("S2", "compactlogix", "a1");
    tag.scale_mul = 3.0;
    store.add_tag(tag, Some(TagValue::Text("pump A".to_string())));
    assert_eq!(
        store.get_value("S2").unwrap(),
        TagValue::Text("pump A".to_string())
    );
}

#[test]
fn decimal_raw_values_preserve_scale() {
    let store = TagStore::new();
    store.add_tag(
        sample_tag("T5", "compactlogix", "a1"),
        Some(TagValue::Decimal(decimal("1.2300"))),
    );
    let TagValue::Decimal(value) = store.get_value("T5").unwrap() else {
        panic!("expected decimal");
    };
    assert_eq!(value.to_string(), "1.2300");
}

#[test]
fn missing_tags_return_none() {
    let store = TagStore::new();
    assert_eq!(store.get_value("nope"), None);
    assert!(store.get_tag("nope").is_none());
    assert!(!store.remove_tag("nope"));
    assert!(!store.update_tag("nope", TagPatch::default()));
}

#[test]
fn update_tag_applies_partial_metadata() {
    let store = TagStore::new();
    store.add_tag(sample_tag("T6", "compactlogix", "a1"), None);

    let updated = store.update_tag(
        "T6",
        TagPatch {
            name: Some("renamed".to_string()),
            enabled: Some(false),
            scale_mul: Some(2.0),
            ..Default::default()
        },
    );
    assert!(updated);
    let tag = store.get_tag("T6").unwrap();
    assert_eq!(tag.name, "renamed");
    assert!(!tag.enabled);
    assert_eq!(tag.scale_mul, 2.0);
    // untouched fields survive
    assert_eq!(tag.plc_id, "compactlogix");
}

#[test]
fn snapshot_covers_every_registered_tag() {
    let store = TagStore::new();
    store.add_tag(sample_tag("A", "compactlogix", "a1"), Some(TagValue::Int(1)));
    store.add_tag(sample_tag("B", "slc500", "a2"), None);

    let mut snapshot = store.snapshot();
    snapshot.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0], ("A".to_string(), TagValue::Int(1)));
    assert_eq!(snapshot[1], ("B".to_string(), TagValue::Float(0.0)));

    store.clear_tags();
    assert!(store.snapshot().is_empty());
    assert!(store.is_empty());
}

#[test]
fn poll_targets_filter_by_plc_and_address() {
    let store = TagStore::new();
    store.add_tag(sample_tag("A", "compactlogix", "addr_a"), None);
    store.add_tag(sample_tag("B", "compactlogix", ""), None); // no address
    let mut disabled = sample_tag("C", "compactlogix", "addr_c");
    disabled.enabled = false;
    store.add_tag(disabled, None);
    store.add_tag(sample_tag("D", "slc500", "N7:0"), None);

    let mut targets = store.poll_targets("compactlogix");
    targets.sort();
    assert_eq!(targets, vec![("A".to_string(), "addr_a".to_string())]);
    assert_eq!(store.poll_targets("slc500"), vec![("D".to_string(), "N7:0".to_string())]);
}

#[test]
fn value_by_address_resolves_scaled_value() {
    let store = TagStore::new();
    let mut tag = sample_tag("T7", "compactlogix", "FLOW");
    tag.scale_mul = 2.0;
    store.add_tag(tag, Some(TagValue::Int(21)));

    assert_eq!(
        store.value_by_address("FLOW"),
        Some(TagValue::Decimal(decimal("42")))
    );
    assert_eq!(store.value_by_address("UNKNOWN"), None);
}

#[test]
fn set_value_accepts_unknown_ids() {
    let store = TagStore::new();
    store.set_value("orphan", TagValue::Int(5));
    assert_eq!(store.get_raw_value("orphan"), Some(TagValue::Int(5)));
    // not a registered tag, so it is absent from the snapshot
    assert!(store.snapshot().is_empty());
}
