//! Interface for services
use std::sync::Arc;

/// Describes the name of a logical service.
///
/// The pool uses this for diagnostics only; resolution of the name into
/// backends is entirely the resolver's business.
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(s: impl ToString) -> Self {
        Self(Arc::from(s.to_string()))
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(Arc::from(s))
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
