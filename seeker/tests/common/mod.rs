#![allow(dead_code)]

use seeker::config::{RetryConfig, SeekerConfig};
use seeker::schema::{
    DocumentDescriptor, FieldSchema, JsonRecord, MemorySource, SourceField, SourceFieldKind,
};
use serde_json::json;
use std::sync::Arc;

pub fn config() -> SeekerConfig {
    SeekerConfig {
        retry: RetryConfig::immediate(3),
        ..SeekerConfig::default()
    }
}

pub fn book_source() -> Arc<MemorySource> {
    Arc::new(MemorySource::new(
        "Book",
        vec![
            SourceField::new("id", SourceFieldKind::Integer).auto_created(),
            SourceField::new("title", SourceFieldKind::Text),
            SourceField::new("genre", SourceFieldKind::Text),
            SourceField::new("year", SourceFieldKind::Integer),
        ],
    ))
}

pub fn book(key: i64, title: &str, genre: &str, year: i64) -> JsonRecord {
    JsonRecord::new(key, json!({ "title": title, "genre": genre, "year": year }))
}

/// `n` books with keys 1..=n
pub fn books(n: i64) -> Arc<MemorySource> {
    let source = book_source();
    for key in 1..=n {
        source.insert(book(key, &format!("Book {}", key), "scifi", 1950 + key));
    }
    source
}

pub fn book_descriptor(source: Arc<MemorySource>, batch_size: usize) -> DocumentDescriptor {
    DocumentDescriptor::builder(source)
        .field(FieldSchema::string("title"))
        .field(FieldSchema::raw_string("genre"))
        .field(FieldSchema::integer("year"))
        .batch_size(batch_size)
        .build()
        .unwrap()
}
