//! Group ↔ member back-reference maintenance across insert, patch, replace,
//! and delete.

mod common;

use common::TestSilo;
use serde_json::json;

use scim_silo::{AttrValue, Resource};

fn group_ids_of(res: &Resource) -> Vec<String> {
    res.values_at("groups.value")
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn member_ids_of(res: &Resource) -> Vec<String> {
    res.values_at("members.value")
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[test]
fn test_insert_group_mirrors_membership() {
    let ts = TestSilo::new();
    let user = ts.insert_json("User", json!({"userName": "bjensen"}));
    let uid = user.id().unwrap();

    let group = ts.insert_json(
        "Group",
        json!({"displayName": "staff", "members": [{"value": uid, "type": "User"}]}),
    );
    let gid = group.id().unwrap();

    let user = ts.silo.get(uid, "User").unwrap();
    assert_eq!(group_ids_of(&user), vec![gid.to_string()]);

    // The mirror carries the group endpoint and display name.
    let groups = user.get_attr("groups").unwrap().as_complex().unwrap();
    let entry = &groups.sub_ats[0];
    assert_eq!(
        entry.get("$ref").unwrap().first().unwrap(),
        &AttrValue::Reference(format!("/Groups/{}", gid))
    );
    assert_eq!(
        entry.get("display").unwrap().first().unwrap(),
        &AttrValue::String("staff".into())
    );
}

#[test]
fn test_member_type_is_probed_when_hint_absent() {
    let ts = TestSilo::new();
    let user = ts.insert_json("User", json!({"userName": "probe-me"}));
    let uid = user.id().unwrap();

    let group = ts.insert_json(
        "Group",
        json!({"displayName": "no-hints", "members": [{"value": uid}]}),
    );

    let user = ts.silo.get(uid, "User").unwrap();
    assert_eq!(group_ids_of(&user), vec![group.id().unwrap().to_string()]);
}

#[test]
fn test_unknown_member_reference_rolls_back_the_insert() {
    let ts = TestSilo::new();
    let err = ts
        .silo
        .insert(ts.parse(
            "Group",
            json!({"displayName": "ghosts",
                   "members": [{"value": "00000000-0000-0000-0000-000000000000"}]}),
        ))
        .unwrap_err();
    assert_eq!(err.scim_type(), "invalidValue");
    assert_eq!(ts.silo.resource_count("Group").unwrap(), 0);
}

#[test]
fn test_delete_group_clears_member_backrefs() {
    let ts = TestSilo::new();
    let user = ts.insert_json("User", json!({"userName": "bjensen"}));
    let uid = user.id().unwrap();
    let group = ts.insert_json(
        "Group",
        json!({"displayName": "staff", "members": [{"value": uid, "type": "User"}]}),
    );
    let gid = group.id().unwrap();

    ts.silo.delete(gid, "Group").unwrap();

    let user = ts.silo.get(uid, "User").unwrap();
    assert!(group_ids_of(&user).is_empty());
    assert!(user.get_attr("groups").is_none());
}

#[test]
fn test_delete_member_clears_group_entry() {
    let ts = TestSilo::new();
    let user = ts.insert_json("User", json!({"userName": "leaver"}));
    let uid = user.id().unwrap();
    let group = ts.insert_json(
        "Group",
        json!({"displayName": "staff", "members": [{"value": uid, "type": "User"}]}),
    );
    let gid = group.id().unwrap();

    ts.silo.delete(uid, "User").unwrap();

    let group = ts.silo.get(gid, "Group").unwrap();
    assert!(member_ids_of(&group).is_empty());
}

#[test]
fn test_patch_membership_syncs_backrefs() {
    let ts = TestSilo::new();
    let alice = ts.insert_json("User", json!({"userName": "alice"}));
    let bob = ts.insert_json("User", json!({"userName": "bob"}));
    let aid = alice.id().unwrap();
    let bid = bob.id().unwrap();

    let group = ts.insert_json(
        "Group",
        json!({"displayName": "eng", "members": [{"value": aid, "type": "User"}]}),
    );
    let gid = group.id().unwrap();

    // Add bob through a patch.
    let pr = ts.patch_req(
        "Group",
        json!({"Operations":[{"op":"add", "path":"members",
            "value": [{"value": bid, "type": "User"}]}]}),
    );
    ts.silo.patch(gid, &pr, "Group").unwrap();
    assert_eq!(
        group_ids_of(&ts.silo.get(bid, "User").unwrap()),
        vec![gid.to_string()]
    );

    // Remove alice through a selector.
    let pr = ts.patch_req(
        "Group",
        json!({"Operations":[{"op":"remove",
            "path": format!("members[value eq \"{}\"]", aid)}]}),
    );
    ts.silo.patch(gid, &pr, "Group").unwrap();
    assert!(group_ids_of(&ts.silo.get(aid, "User").unwrap()).is_empty());
    assert_eq!(
        group_ids_of(&ts.silo.get(bid, "User").unwrap()),
        vec![gid.to_string()]
    );
}

#[test]
fn test_replace_group_syncs_backrefs() {
    let ts = TestSilo::new();
    let alice = ts.insert_json("User", json!({"userName": "alice"}));
    let bob = ts.insert_json("User", json!({"userName": "bob"}));
    let aid = alice.id().unwrap();
    let bid = bob.id().unwrap();

    let group = ts.insert_json(
        "Group",
        json!({"displayName": "eng", "members": [{"value": aid, "type": "User"}]}),
    );
    let gid = group.id().unwrap();

    let mut replacement = ts.parse(
        "Group",
        json!({"displayName": "eng", "members": [{"value": bid, "type": "User"}]}),
    );
    replacement.set_id(gid);
    ts.silo.replace(replacement).unwrap();

    assert!(group_ids_of(&ts.silo.get(aid, "User").unwrap()).is_empty());
    assert_eq!(
        group_ids_of(&ts.silo.get(bid, "User").unwrap()),
        vec![gid.to_string()]
    );
}

#[test]
fn test_membership_index_stays_consistent() {
    let ts = TestSilo::new();
    let user = ts.insert_json("User", json!({"userName": "indexed"}));
    let uid = user.id().unwrap();
    let group = ts.insert_json(
        "Group",
        json!({"displayName": "tracked", "members": [{"value": uid, "type": "User"}]}),
    );
    let gid = group.id().unwrap();

    // Forward and backward reference indices both carry the tuple.
    assert!(ts
        .silo
        .index_has_val("Group", "members.value", &AttrValue::String(uid.into()))
        .unwrap());
    assert!(ts
        .silo
        .index_has_val("User", "groups.value", &AttrValue::String(gid.into()))
        .unwrap());

    ts.silo.delete(gid, "Group").unwrap();
    assert!(!ts
        .silo
        .index_has_val("Group", "members.value", &AttrValue::String(uid.into()))
        .unwrap());
    assert!(!ts
        .silo
        .index_has_val("User", "groups.value", &AttrValue::String(gid.into()))
        .unwrap());
}
