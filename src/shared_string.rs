use std::fmt;
use std::sync::Arc;

/// A cheaply clonable, immutable string used for map names, symbol names
/// and build-ids. These strings are read on every frame but written once,
/// so they are shared by reference count instead of copied.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct SharedString(Arc<str>);

impl SharedString {
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        SharedString(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw bytes of the string. Build-ids are stored as raw bytes in a
    /// `SharedString`, so this is not always valid UTF-8 text semantically.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for SharedString {
    fn from(s: &str) -> Self {
        SharedString(Arc::from(s))
    }
}

impl From<String> for SharedString {
    fn from(s: String) -> Self {
        SharedString(Arc::from(s.as_str()))
    }
}

impl std::ops::Deref for SharedString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SharedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SharedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl PartialEq<str> for SharedString {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for SharedString {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}
