use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Names who flags are evaluated for: a context key within an environment.
///
/// `Identity` is immutable and is used as the key for the flag store and the persistent cache.
/// Two identities are equal iff both the context key and the environment key match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    context_key: String,
    environment_key: String,
}

impl Identity {
    /// Create a new identity.
    ///
    /// ```
    /// # use flagsync::Identity;
    /// let identity = Identity::new("user-42", "mob-key-123");
    /// assert_eq!(identity.context_key(), "user-42");
    /// ```
    pub fn new(context_key: impl Into<String>, environment_key: impl Into<String>) -> Identity {
        Identity {
            context_key: context_key.into(),
            environment_key: environment_key.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn context_key(&self) -> &str {
        &self.context_key
    }

    #[allow(missing_docs)]
    pub fn environment_key(&self) -> &str {
        &self.environment_key
    }

    /// Key used to address this identity in durable storage.
    ///
    /// The key is a hex-encoded digest, so it is safe to use as a file name and does not leak the
    /// raw context key into storage listings.
    pub fn storage_key(&self) -> String {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        let digest = md5::compute(format!(
            "{}:{}{}",
            self.context_key.len(),
            self.context_key,
            self.environment_key
        ));
        format!("{:x}", digest)
    }

    /// URL-safe base64 of the JSON context, used as a path segment in flag requests.
    pub(crate) fn encoded_context(&self) -> String {
        let context = serde_json::json!({ "key": self.context_key });
        base64::engine::general_purpose::URL_SAFE.encode(context.to_string())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.context_key, self.environment_key)
    }
}

impl log::kv::ToValue for Identity {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}
