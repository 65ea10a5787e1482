//! Embedded core schemas and resource types.
//!
//! Ships the schemas the test suite and default configuration rely on: the
//! core User and Group schemas, the enterprise User extension, and a Device
//! schema exercising every attribute data type. Deployments with their own
//! schema files simply register those instead.

/// Returns the core User schema as a JSON string.
pub fn core_user_schema() -> &'static str {
    r#"{
  "id": "urn:ietf:params:scim:schemas:core:2.0:User",
  "name": "User",
  "description": "User Account",
  "attributes": [
    {
      "name": "id",
      "type": "string",
      "caseExact": true,
      "mutability": "readOnly",
      "uniqueness": "server"
    },
    {
      "name": "userName",
      "type": "string",
      "required": true,
      "uniqueness": "server"
    },
    {
      "name": "externalId",
      "type": "string",
      "caseExact": true
    },
    {
      "name": "displayName",
      "type": "string"
    },
    {
      "name": "active",
      "type": "boolean"
    },
    {
      "name": "password",
      "type": "string",
      "mutability": "writeOnly"
    },
    {
      "name": "name",
      "type": "complex",
      "subAttributes": [
        { "name": "formatted", "type": "string" },
        { "name": "familyName", "type": "string" },
        { "name": "givenName", "type": "string" }
      ]
    },
    {
      "name": "emails",
      "type": "complex",
      "multiValued": true,
      "subAttributes": [
        { "name": "value", "type": "string" },
        { "name": "display", "type": "string" },
        { "name": "type", "type": "string", "canonicalValues": ["work", "home", "other"] },
        { "name": "primary", "type": "boolean" }
      ]
    },
    {
      "name": "groups",
      "type": "complex",
      "multiValued": true,
      "mutability": "readOnly",
      "subAttributes": [
        { "name": "value", "type": "string", "mutability": "readOnly" },
        { "name": "$ref", "type": "reference", "mutability": "readOnly" },
        { "name": "display", "type": "string", "mutability": "readOnly" },
        { "name": "type", "type": "string", "mutability": "readOnly" }
      ]
    },
    {
      "name": "meta",
      "type": "complex",
      "mutability": "readOnly",
      "subAttributes": [
        { "name": "resourceType", "type": "string", "mutability": "readOnly" },
        { "name": "created", "type": "dateTime", "mutability": "readOnly" },
        { "name": "lastModified", "type": "dateTime", "mutability": "readOnly" },
        { "name": "version", "type": "string", "mutability": "readOnly" }
      ]
    }
  ]
}"#
}

/// Returns the core Group schema as a JSON string.
pub fn core_group_schema() -> &'static str {
    r#"{
  "id": "urn:ietf:params:scim:schemas:core:2.0:Group",
  "name": "Group",
  "description": "Group",
  "attributes": [
    {
      "name": "id",
      "type": "string",
      "caseExact": true,
      "mutability": "readOnly",
      "uniqueness": "server"
    },
    {
      "name": "displayName",
      "type": "string",
      "required": true
    },
    {
      "name": "members",
      "type": "complex",
      "multiValued": true,
      "subAttributes": [
        { "name": "value", "type": "string", "mutability": "immutable" },
        { "name": "$ref", "type": "reference", "mutability": "immutable" },
        { "name": "type", "type": "string", "mutability": "immutable" },
        { "name": "display", "type": "string" }
      ]
    },
    {
      "name": "meta",
      "type": "complex",
      "mutability": "readOnly",
      "subAttributes": [
        { "name": "resourceType", "type": "string", "mutability": "readOnly" },
        { "name": "created", "type": "dateTime", "mutability": "readOnly" },
        { "name": "lastModified", "type": "dateTime", "mutability": "readOnly" },
        { "name": "version", "type": "string", "mutability": "readOnly" }
      ]
    }
  ]
}"#
}

/// Returns the enterprise User extension schema as a JSON string.
pub fn enterprise_user_schema() -> &'static str {
    r#"{
  "id": "urn:ietf:params:scim:schemas:extension:enterprise:2.0:User",
  "name": "EnterpriseUser",
  "description": "Enterprise User",
  "attributes": [
    { "name": "employeeNumber", "type": "string" },
    { "name": "organization", "type": "string" },
    { "name": "department", "type": "string" }
  ]
}"#
}

/// Returns a Device schema covering every attribute data type.
pub fn device_schema() -> &'static str {
    r#"{
  "id": "urn:example:params:scim:schemas:core:2.0:Device",
  "name": "Device",
  "description": "Managed device",
  "attributes": [
    {
      "name": "id",
      "type": "string",
      "caseExact": true,
      "mutability": "readOnly",
      "uniqueness": "server"
    },
    {
      "name": "manufacturer",
      "type": "string"
    },
    {
      "name": "serialNumber",
      "type": "string",
      "required": true,
      "caseExact": true,
      "uniqueness": "server"
    },
    {
      "name": "macId",
      "type": "string",
      "caseExact": true
    },
    {
      "name": "rating",
      "type": "integer"
    },
    {
      "name": "price",
      "type": "decimal"
    },
    {
      "name": "installedDate",
      "type": "dateTime"
    },
    {
      "name": "repairDates",
      "type": "dateTime",
      "multiValued": true
    },
    {
      "name": "firmware",
      "type": "binary"
    },
    {
      "name": "location",
      "type": "complex",
      "subAttributes": [
        { "name": "latitude", "type": "string", "caseExact": true },
        { "name": "longitude", "type": "string", "caseExact": true },
        { "name": "desc", "type": "string" }
      ]
    },
    {
      "name": "photos",
      "type": "complex",
      "multiValued": true,
      "subAttributes": [
        { "name": "value", "type": "string", "caseExact": true },
        { "name": "display", "type": "string" },
        { "name": "primary", "type": "boolean" }
      ]
    },
    {
      "name": "meta",
      "type": "complex",
      "mutability": "readOnly",
      "subAttributes": [
        { "name": "resourceType", "type": "string", "mutability": "readOnly" },
        { "name": "created", "type": "dateTime", "mutability": "readOnly" },
        { "name": "lastModified", "type": "dateTime", "mutability": "readOnly" },
        { "name": "version", "type": "string", "mutability": "readOnly" }
      ]
    }
  ]
}"#
}

/// Returns the embedded resource type definitions as a JSON array.
pub fn resource_types() -> &'static str {
    r#"[
  {
    "name": "User",
    "endpoint": "/Users",
    "schema": "urn:ietf:params:scim:schemas:core:2.0:User",
    "schemaExtensions": [
      { "schema": "urn:ietf:params:scim:schemas:extension:enterprise:2.0:User", "required": false }
    ]
  },
  {
    "name": "Group",
    "endpoint": "/Groups",
    "schema": "urn:ietf:params:scim:schemas:core:2.0:Group"
  },
  {
    "name": "Device",
    "endpoint": "/Devices",
    "schema": "urn:example:params:scim:schemas:core:2.0:Device"
  }
]"#
}
