use std::fmt;

use uuid::Uuid;

/// Execution identifier.
///
/// Correlates input, output and progress of one request across processes,
/// and doubles as the store namespace for that request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Qid(String);

impl Qid {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (32 lowercase hex characters).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Qid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Qid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Qid {
    fn from(value: String) -> Self {
        Self(value)
    }
}
