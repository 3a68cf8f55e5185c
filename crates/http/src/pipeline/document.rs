use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use mime::Mime;

use crate::source::HttpDataSource;

/// The response body under construction plus a side table shared by the services of a task.
///
/// Services must treat side table keys they did not define as opaque.
#[derive(Default)]
pub struct Document {
    sources: Vec<Box<dyn HttpDataSource>>,
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_source<S: HttpDataSource + 'static>(&mut self, source: S) {
        self.sources.push(Box::new(source));
    }

    pub fn push_boxed(&mut self, source: Box<dyn HttpDataSource>) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Box<dyn HttpDataSource>] {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut [Box<dyn HttpDataSource>] {
        &mut self.sources
    }

    pub fn take_sources(&mut self) -> Vec<Box<dyn HttpDataSource>> {
        std::mem::take(&mut self.sources)
    }

    pub fn clear_sources(&mut self) {
        self.sources.clear();
    }

    pub fn has_body(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Total length of all sources, `None` if any of them is of unknown length.
    pub fn length(&self) -> Option<u64> {
        self.sources.iter().map(|source| source.length()).sum()
    }

    /// Content type of the first source.
    pub fn mime_type(&self) -> Option<Mime> {
        self.sources.first().and_then(|source| source.mime_type())
    }

    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|value| value.downcast_mut())
    }

    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let value = self.values.remove(key)?;
        value.downcast().ok().map(|value| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("sources", &self.sources.len())
            .field("length", &self.length())
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BytesSource, LazySource};

    #[test]
    fn length_sums_known_sources() {
        let mut document = Document::new();
        assert_eq!(document.length(), Some(0));

        document.push_source(BytesSource::text("hello "));
        document.push_source(BytesSource::new("world"));
        assert_eq!(document.length(), Some(11));
        assert_eq!(document.mime_type(), Some(mime::TEXT_PLAIN_UTF_8));

        document.push_source(LazySource::new(Vec::<Box<dyn HttpDataSource>>::new()));
        assert_eq!(document.length(), None);
    }

    #[test]
    fn side_table() {
        let mut document = Document::new();
        document.insert("user", String::from("alice"));
        document.insert("attempts", 3_u8);

        assert_eq!(document.get::<String>("user").map(String::as_str), Some("alice"));
        assert_eq!(document.get::<u32>("attempts"), None);
        *document.get_mut::<u8>("attempts").unwrap() += 1;
        assert_eq!(document.remove::<u8>("attempts"), Some(4));
        assert!(!document.contains_key("attempts"));
    }
}
