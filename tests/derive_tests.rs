/// Derive tests
///
/// `#[derive(Entity)]` attribute handling: renamed and skipped fields,
/// key flags, embedded base entities and entity names.
/// Run with: cargo test --test derive_tests
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use beanmap::entity::Access;
use beanmap::{Coercer, Entity, EntityMetadata, Error, RowMapper, Value, ValueType};

#[derive(Debug, Default, Clone, PartialEq, Entity)]
struct Audited {
    #[column(defaultable)]
    created_by: Option<String>,
    revision: i32,
}

#[derive(Debug, Default, Clone, PartialEq, Entity)]
#[entity(name = "people")]
struct Person {
    #[inherit]
    audit: Audited,
    #[column(primary_key)]
    id: i64,
    #[column(name = "display_name")]
    name: String,
    tags: Vec<String>,
    #[column(skip)]
    scratch: HashMap<String, String>,
}

#[derive(Debug, Default, Entity)]
struct Clash {
    #[inherit]
    audit: Audited,
    revision: i64,
}

#[derive(Debug, Default, Entity)]
struct Plain {
    #[column(primary_key)]
    id: i64,
}

#[test]
fn test_keys_and_flags() {
    let metadata = EntityMetadata::<Person>::describe().unwrap();
    let keys: Vec<&str> = metadata.keys().collect();
    assert_eq!(keys, vec!["created_by", "display_name", "id", "revision", "tags"]);

    let id = metadata.get("ID").unwrap();
    assert!(id.is_primary_key());
    assert!(!id.is_nullable());
    assert_eq!(id.value_type(), ValueType::Long);
    assert_eq!(id.access(), Access::Field);

    let created_by = metadata.get("created_by").unwrap();
    assert!(created_by.is_defaultable());
    assert!(created_by.is_nullable());
    assert!(!metadata.contains("scratch"));
    assert!(!metadata.contains("name"));
}

#[test]
fn test_entity_names() {
    assert_eq!(Person::entity_name(), "people");
    assert_eq!(Plain::entity_name(), "Plain");
    assert_eq!(EntityMetadata::<Person>::describe().unwrap().name(), "people");
}

#[test]
fn test_inherited_fields_reach_the_base() {
    let metadata = EntityMetadata::<Person>::describe().unwrap();
    let mut person = Person::default();

    metadata
        .get("created_by")
        .unwrap()
        .set(&mut person, Value::Text("ada".into()))
        .unwrap();
    metadata
        .get("revision")
        .unwrap()
        .set(&mut person, Value::Int(3))
        .unwrap();

    assert_eq!(person.audit.created_by.as_deref(), Some("ada"));
    assert_eq!(person.audit.revision, 3);
    assert_eq!(metadata.get("revision").unwrap().get(&person), Value::Int(3));
}

#[test]
fn test_duplicate_key_through_inherit() {
    let err = EntityMetadata::<Clash>::describe().unwrap_err();
    match err {
        Error::Configuration(message) => assert!(message.contains("'revision'"), "{message}"),
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn test_map_record() {
    let metadata = Arc::new(EntityMetadata::<Person>::describe().unwrap());
    let mapper = RowMapper::from_metadata(metadata, Arc::new(Coercer::new()));

    let mut record = BTreeMap::new();
    record.insert("ID".to_string(), Value::Int(9));
    record.insert("Display_Name".to_string(), Value::Text("Grace".into()));
    record.insert("created_by".to_string(), Value::Null);
    record.insert("revision".to_string(), Value::Long(2));
    record.insert(
        "tags".to_string(),
        Value::Array(vec![Value::Text("a".into()), Value::Text("b".into())]),
    );
    record.insert("unmapped".to_string(), Value::Bool(true));

    let person = mapper.map_record(&record).unwrap();
    assert_eq!(
        person,
        Person {
            audit: Audited {
                created_by: None,
                revision: 2,
            },
            id: 9,
            name: "Grace".into(),
            tags: vec!["a".into(), "b".into()],
            scratch: HashMap::new(),
        }
    );
}
