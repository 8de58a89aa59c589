// Shared fixtures for the inline test modules: a small user/post schema
// with one scalar field per concern, plus builders tests can extend.

use crate::line::Line;
use crate::linetype::{ChildSpec, Linetype};
use crate::registry::{Registry, RegistryBuilder};
use crate::sequence::Sequence;
use serde_json::Value;
use std::sync::Arc;

pub const SECRET: &str = "correct-horse-battery-staple-0123456789";

pub fn sequence() -> Sequence {
    Sequence::new(SECRET, 10_000).unwrap()
}

pub fn line(value: Value) -> Line {
    Line::from_value(value).unwrap()
}

/// Wire `name` as a plain stored scalar: read straight off the record,
/// write straight from the line.
pub fn scalar(linetype: Linetype, name: &str) -> Linetype {
    let read = name.to_string();
    let write = name.to_string();
    linetype
        .field(name, Arc::new(move |records| Ok(records.root_field(&read))))
        .unfuse(
            name,
            Arc::new(move |line, _| Ok(line.get(&write).cloned().unwrap_or(Value::Null))),
        )
}

pub fn user_linetype() -> Linetype {
    let linetype = scalar(scalar(Linetype::new("user"), "name"), "email");
    linetype.validate(Arc::new(|line| {
        match line.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => None,
            _ => Some("name is required".to_string()),
        }
    }))
}

pub fn post_linetype() -> Linetype {
    scalar(Linetype::new("post"), "title")
}

/// A builder seeded with the given user linetype and the stock post.
pub fn base_builder(user: Linetype) -> RegistryBuilder {
    RegistryBuilder::new(sequence())
        .linetype(user)
        .linetype(post_linetype())
}

pub fn builder() -> RegistryBuilder {
    base_builder(
        user_linetype().child(ChildSpec::new("posts", "post", "user_post").alias("user")),
    )
}

pub fn registry() -> Arc<Registry> {
    Arc::new(builder().build().unwrap())
}
