//! Shared fixtures: a tempfile-backed silo with the embedded schemas and
//! default configuration, plus JSON helpers for the test resources.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use scim_silo::silo::PatchRequest;
use scim_silo::{Resource, SchemaRegistry, Silo, SiloConfig};

pub struct TestSilo {
    pub silo: Silo,
    pub registry: Arc<SchemaRegistry>,
    _dir: tempfile::TempDir,
}

impl TestSilo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let registry = Arc::new(SchemaRegistry::with_embedded().expect("embedded schemas"));
        let silo = Silo::open(
            dir.path().join("silo.db"),
            &SiloConfig::default_config(),
            registry.clone(),
        )
        .expect("open silo");
        Self {
            silo,
            registry,
            _dir: dir,
        }
    }

    pub fn parse(&self, rt_name: &str, data: Value) -> Resource {
        let rt = self.registry.resource_type(rt_name).expect("resource type");
        Resource::from_json(&self.registry, rt, &data).expect("parse resource")
    }

    pub fn insert_json(&self, rt_name: &str, data: Value) -> Resource {
        self.silo.insert(self.parse(rt_name, data)).expect("insert")
    }

    pub fn patch_req(&self, rt_name: &str, body: Value) -> PatchRequest {
        let rt = self.registry.resource_type(rt_name).expect("resource type");
        PatchRequest::from_json(&self.registry, rt, &body).expect("parse patch")
    }
}

pub fn device_json() -> Value {
    json!({
        "schemas": ["urn:example:params:scim:schemas:core:2.0:Device"],
        "manufacturer": "kodiak",
        "serialNumber": "11",
        "rating": 1,
        "price": 7.2,
        "installedDate": "2016-05-17T14:19:14Z",
        "repairDates": ["2016-05-10T14:19:14Z", "2016-05-11T14:19:14Z"],
        "location": {"latitude": "1.1", "longitude": "2.2"},
        "photos": [
            {"value": "abc.jpg", "primary": true},
            {"value": "xyz.jpg", "primary": false}
        ]
    })
}

pub fn millis(rfc3339: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid datetime")
        .timestamp_millis()
}
