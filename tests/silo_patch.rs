//! Patch semantics against the store: index diffing, idempotence, selectors,
//! uniqueness, and extension attributes.

mod common;

use common::{device_json, millis, TestSilo};
use serde_json::json;

use scim_silo::AttrValue;

#[test]
fn test_patch_add_simple_values_updates_indices() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "value":{"price": 9.2, "rating": 1}}]}),
    );
    let updated = ts.silo.patch(rid, &pr, "Device").unwrap();

    assert_eq!(updated.values_at("price"), vec![AttrValue::Decimal(9.2)]);
    assert!(!ts
        .silo
        .index_has_val("Device", "price", &AttrValue::Decimal(7.2))
        .unwrap());
    assert!(ts
        .silo
        .index_has_val("Device", "price", &AttrValue::Decimal(9.2))
        .unwrap());
    assert_eq!(updated.values_at("rating"), vec![AttrValue::Integer(1)]);
    assert!(ts
        .silo
        .index_has_val("Device", "rating", &AttrValue::Integer(1))
        .unwrap());
}

#[test]
fn test_identical_patch_leaves_resource_untouched() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "value":{"price": 9.2, "rating": 1}}]}),
    );
    let updated = ts.silo.patch(rid, &pr, "Device").unwrap();
    let not_updated = ts.silo.patch(rid, &pr, "Device").unwrap();

    assert_eq!(
        updated.meta_last_modified(),
        not_updated.meta_last_modified()
    );
    assert_eq!(updated, not_updated);
}

#[test]
fn test_patch_with_path_and_multi_valued_datetime() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "path":"price", "value":10.6}]}),
    );
    ts.silo.patch(rid, &pr, "Device").unwrap();
    assert!(ts
        .silo
        .index_has_val("Device", "price", &AttrValue::Decimal(10.6))
        .unwrap());
    assert!(!ts
        .silo
        .index_has_val("Device", "price", &AttrValue::Decimal(7.2))
        .unwrap());

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "path":"repairDates", "value":"2016-05-28T14:19:14Z"}]}),
    );
    let updated = ts.silo.patch(rid, &pr, "Device").unwrap();
    let ms = millis("2016-05-28T14:19:14Z");
    assert!(updated
        .values_at("repairdates")
        .contains(&AttrValue::DateTime(ms)));
    assert!(ts
        .silo
        .index_has_val("Device", "repairdates", &AttrValue::DateTime(ms))
        .unwrap());
}

#[test]
fn test_patch_unique_attribute_collision() {
    let ts = TestSilo::new();
    let mut first = device_json();
    first["serialNumber"] = json!("20");
    ts.insert_json("Device", first);

    let rs = ts.insert_json("Device", device_json());
    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "value":{"serialNumber": "20"}}]}),
    );
    let err = ts.silo.patch(rs.id().unwrap(), &pr, "Device").unwrap_err();
    assert_eq!(err.scim_type(), "uniqueness");

    // The failed patch rolled back: the old serial number is still indexed.
    assert!(ts
        .silo
        .index_has_val("Device", "serialnumber", &AttrValue::String("11".into()))
        .unwrap());
}

#[test]
fn test_patch_complex_attribute_with_and_without_path() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "value":{"location": {"latitude": "1.0", "longitude": "2.0"}}}]}),
    );
    ts.silo.patch(rid, &pr, "Device").unwrap();
    assert!(ts
        .silo
        .index_has_val("Device", "location.latitude", &AttrValue::String("1.0".into()))
        .unwrap());
    assert!(!ts
        .silo
        .index_has_val("Device", "location.latitude", &AttrValue::String("1.1".into()))
        .unwrap());

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "path":"location.latitude", "value":"5.0"}]}),
    );
    ts.silo.patch(rid, &pr, "Device").unwrap();
    assert!(ts
        .silo
        .index_has_val("Device", "location.latitude", &AttrValue::String("5.0".into()))
        .unwrap());
}

#[test]
fn test_patch_selector_flips_primary_exclusively() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "path":"photos[value eq \"xyz.jpg\"].primary", "value":true}]}),
    );
    let updated = ts.silo.patch(rid, &pr, "Device").unwrap();

    let photos = updated.get_attr("photos").unwrap().as_complex().unwrap();
    assert_eq!(photos.primary_count(), 1);
    for entry in &photos.sub_ats {
        let value = entry.get("value").unwrap().first().unwrap().as_str().unwrap();
        let primary = entry
            .get("primary")
            .and_then(|sa| sa.first())
            .and_then(AttrValue::as_bool)
            .unwrap_or(false);
        assert_eq!(primary, value == "xyz.jpg");
    }
}

#[test]
fn test_patch_selector_without_match_rolls_back() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "path":"photos[value eq \"none.jpg\"].primary", "value":true}]}),
    );
    let err = ts.silo.patch(rid, &pr, "Device").unwrap_err();
    assert_eq!(err.scim_type(), "noTarget");

    let fetched = ts.silo.get(rid, "Device").unwrap();
    assert_eq!(fetched, rs);
}

#[test]
fn test_patch_remove_selected_entries_updates_indices() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"remove", "path":"photos[value eq \"abc.jpg\"]"}]}),
    );
    let updated = ts.silo.patch(rid, &pr, "Device").unwrap();

    let photos = updated.get_attr("photos").unwrap().as_complex().unwrap();
    assert_eq!(photos.sub_ats.len(), 1);
    assert!(!ts
        .silo
        .index_has_val("Device", "photos.value", &AttrValue::String("abc.jpg".into()))
        .unwrap());
    assert!(ts
        .silo
        .index_has_val("Device", "photos.value", &AttrValue::String("xyz.jpg".into()))
        .unwrap());
}

#[test]
fn test_patch_replace_selected_entries_wholesale() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("Device", device_json());
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"replace", "path":"photos[value pr]",
            "value": {"value": "1.jpg", "display": "added display"}}]}),
    );
    let updated = ts.silo.patch(rid, &pr, "Device").unwrap();

    let photos = updated.get_attr("photos").unwrap().as_complex().unwrap();
    assert_eq!(photos.sub_ats.len(), 1);
    assert!(!ts
        .silo
        .index_has_val("Device", "photos.value", &AttrValue::String("abc.jpg".into()))
        .unwrap());
    assert!(!ts
        .silo
        .index_has_val("Device", "photos.value", &AttrValue::String("xyz.jpg".into()))
        .unwrap());
    assert!(ts
        .silo
        .index_has_val("Device", "photos.value", &AttrValue::String("1.jpg".into()))
        .unwrap());
}

#[test]
fn test_patch_adds_extension_attributes_and_schema_urn() {
    let ts = TestSilo::new();
    let rs = ts.insert_json("User", json!({"userName": "bjensen", "displayName": "Babs"}));
    let rid = rs.id().unwrap();

    let pr = ts.patch_req(
        "User",
        json!({"Operations":[{"op":"add", "value":
            {"urn:ietf:params:scim:schemas:extension:enterprise:2.0:User":
                {"employeeNumber": "1", "organization": "kodiak"}}
        }]}),
    );
    let updated = ts.silo.patch(rid, &pr, "User").unwrap();

    assert_eq!(updated.schemas().len(), 2);
    assert_eq!(
        updated.values_at("employeenumber"),
        vec![AttrValue::String("1".into())]
    );
    assert!(ts
        .silo
        .index_has_val("User", "employeenumber", &AttrValue::String("1".into()))
        .unwrap());
}

#[test]
fn test_patch_readonly_target_is_rejected_at_parse() {
    let ts = TestSilo::new();
    let rt = ts.registry.resource_type("User").unwrap();
    let err = scim_silo::silo::PatchRequest::from_json(
        &ts.registry,
        rt,
        &json!({"Operations":[{"op":"replace", "path":"id", "value":"x"}]}),
    )
    .unwrap_err();
    assert_eq!(err.scim_type(), "mutability");
}

#[test]
fn test_patch_unknown_resource_is_not_found() {
    let ts = TestSilo::new();
    let pr = ts.patch_req(
        "Device",
        json!({"Operations":[{"op":"add", "value":{"rating": 3}}]}),
    );
    let err = ts
        .silo
        .patch("99999999-0000-0000-0000-000000000000", &pr, "Device")
        .unwrap_err();
    assert_eq!(err.scim_type(), "notFound");
}
