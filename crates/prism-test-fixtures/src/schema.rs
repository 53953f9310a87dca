//! The workforce fixture schema.
//!
//! Three roles: `Office` and `AreaManager` (back-office staff reading the
//! same field set) and `Cleaner` (field staff reading a reduced one).
//! `Users` and `Companies` are linked two-way; `Contacts` carries the
//! projected include-field copies the freshness tests exercise.

use prism_types::{FieldType, RelationMeta, Schema};

use crate::{collection, plain_field, relation_field};

pub const ROLE_OFFICE: &str = "Office";
pub const ROLE_AREA_MANAGER: &str = "AreaManager";
pub const ROLE_CLEANER: &str = "Cleaner";

const BACK_OFFICE: &[&str] = &[ROLE_OFFICE, ROLE_AREA_MANAGER];
const ALL_ROLES: &[&str] = &[ROLE_OFFICE, ROLE_AREA_MANAGER, ROLE_CLEANER];

/// Users, Companies, and Contacts with the role layout the engine's
/// partitioning tests assume: back-office roles share one shard, cleaners
/// get their own narrower one.
pub fn workforce_schema() -> Schema {
    let mut email = plain_field("Email", FieldType::String, BACK_OFFICE);
    email.unique = true;

    let mut users = collection(
        "Users",
        vec![
            plain_field("Name", FieldType::String, ALL_ROLES),
            email,
            plain_field("Role", FieldType::String, ALL_ROLES),
            plain_field("Status", FieldType::String, BACK_OFFICE),
            relation_field(
                "Companies",
                RelationMeta {
                    target: "Companies".to_string(),
                    two_way: Some("Users".to_string()),
                    include_fields: vec!["Name".to_string()],
                    ..RelationMeta::default()
                },
                BACK_OFFICE,
            ),
        ],
    );
    users.identity_field = Some("Email".to_string());
    // A user record shards only into its own role's group.
    users.role_field = Some("Role".to_string());

    let mut company_name = plain_field("Name", FieldType::String, ALL_ROLES);
    company_name.unique = true;
    let companies = collection(
        "Companies",
        vec![
            company_name,
            plain_field("Region", FieldType::String, BACK_OFFICE),
            relation_field(
                "Users",
                RelationMeta {
                    target: "Users".to_string(),
                    two_way: Some("Companies".to_string()),
                    include_fields: vec!["Name".to_string(), "Email".to_string()],
                    ..RelationMeta::default()
                },
                BACK_OFFICE,
            ),
            relation_field(
                "Contacts",
                RelationMeta {
                    target: "Contacts".to_string(),
                    two_way: Some("Company".to_string()),
                    include_fields: vec!["Name".to_string(), "Phone".to_string()],
                    dependency_fields: vec!["Region".to_string()],
                    ..RelationMeta::default()
                },
                BACK_OFFICE,
            ),
        ],
    );

    let contacts = collection(
        "Contacts",
        vec![
            plain_field("Name", FieldType::String, BACK_OFFICE),
            plain_field("Phone", FieldType::String, BACK_OFFICE),
            relation_field(
                "Company",
                RelationMeta {
                    target: "Companies".to_string(),
                    two_way: Some("Contacts".to_string()),
                    include_fields: vec!["Name".to_string()],
                    single: true,
                    ..RelationMeta::default()
                },
                BACK_OFFICE,
            ),
        ],
    );

    Schema::new(vec![users, companies, contacts])
}
