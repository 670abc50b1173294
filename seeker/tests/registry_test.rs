use seeker::config::RegistrationMode;
use seeker::registry::{Registry, RegistryKey};
use seeker::schema::{DocumentDescriptor, FieldSchema, MemorySource};
use seeker::Error;
use std::sync::Arc;

fn descriptor(record_type: &str, index: &str) -> DocumentDescriptor {
    DocumentDescriptor::builder(Arc::new(MemorySource::new(record_type, vec![])))
        .index_name(index)
        .field(FieldSchema::string("title"))
        .build()
        .unwrap()
}

#[test]
fn test_strict_registry_rejects_duplicates() {
    let registry = Registry::new(RegistrationMode::Strict);
    let key = RegistryKey::new("library", "Book");
    registry.register(key.clone(), descriptor("Book", "books")).unwrap();

    let result = registry.register(key.clone(), descriptor("Book", "books-v2"));

    assert!(matches!(result, Err(Error::DuplicateRegistration(ref k)) if k == "library/Book"));
    assert_eq!(registry.lookup(&key).unwrap().index_name(), "books");
}

#[test]
fn test_permissive_registry_replaces_in_place() {
    let registry = Registry::new(RegistrationMode::Permissive);
    registry
        .register(RegistryKey::new("library", "Book"), descriptor("Book", "books"))
        .unwrap();
    registry
        .register(RegistryKey::new("library", "Author"), descriptor("Author", "authors"))
        .unwrap();
    registry
        .register(RegistryKey::new("library", "Book"), descriptor("Book", "books-v2"))
        .unwrap();

    let indexes: Vec<String> = registry
        .all()
        .iter()
        .map(|d| d.index_name().to_string())
        .collect();
    assert_eq!(indexes, vec!["books-v2", "authors"]);
}

#[test]
fn test_lookup_by_namespace_and_record_type() {
    let registry = Registry::default();
    registry
        .register(RegistryKey::new("public", "Book"), descriptor("Book", "books"))
        .unwrap();
    registry
        .register(RegistryKey::new("staff", "Book"), descriptor("Book", "staff-books"))
        .unwrap();
    registry
        .register(RegistryKey::new("staff", "Author"), descriptor("Author", "authors"))
        .unwrap();

    assert_eq!(registry.for_record_type("Book").len(), 2);
    assert_eq!(registry.namespace("staff").len(), 2);
    assert!(matches!(
        registry.lookup(&RegistryKey::new("public", "Author")),
        Err(Error::NotRegistered(_))
    ));

    registry.reset();
    assert!(registry.is_empty());
}

#[test]
fn test_key_must_match_record_type() {
    let registry = Registry::default();
    let result = registry.register(RegistryKey::new("library", "Author"), descriptor("Book", "books"));
    assert!(matches!(result, Err(Error::InvalidDescriptor(_))));
}
