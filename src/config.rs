//! Silo configuration.
//!
//! The silo does not load configuration files itself; a deserialized
//! [`SiloConfig`] is handed to [`Silo::open`](crate::silo::Silo::open) by the
//! embedding application. Unique attributes declared by the schemas are always
//! indexed in addition to the configured `indexFields`.

use serde::{Deserialize, Serialize};

/// Top-level silo configuration: one entry per stored resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiloConfig {
    pub resources: Vec<ResourceConf>,
}

/// Per-resource-type settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConf {
    /// Resource type name, must match a registered `ResourceType`.
    pub name: String,
    /// Attribute paths to index beyond the unique attributes.
    #[serde(default)]
    pub index_fields: Vec<String>,
}

impl SiloConfig {
    /// Configuration matching the embedded resource types.
    pub fn default_config() -> Self {
        Self {
            resources: vec![
                ResourceConf {
                    name: "User".to_string(),
                    index_fields: vec![
                        "username".to_string(),
                        "emails.value".to_string(),
                        "groups.value".to_string(),
                        "employeenumber".to_string(),
                        "organization".to_string(),
                    ],
                },
                ResourceConf {
                    name: "Group".to_string(),
                    index_fields: vec!["displayname".to_string(), "members.value".to_string()],
                },
                ResourceConf {
                    name: "Device".to_string(),
                    index_fields: vec![
                        "manufacturer".to_string(),
                        "rating".to_string(),
                        "price".to_string(),
                        "installeddate".to_string(),
                        "repairdates".to_string(),
                        "location.latitude".to_string(),
                        "photos.value".to_string(),
                    ],
                },
            ],
        }
    }

    /// Looks up the configuration entry for a resource type.
    pub fn resource(&self, name: &str) -> Option<&ResourceConf> {
        self.resources.iter().find(|rc| rc.name == name)
    }
}
