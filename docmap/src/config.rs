use serde::{Deserialize, Serialize};

/// Environment variable overriding [`Settings::hash_secret`].
pub const HASH_SECRET_ENV: &str = "DOCMAP_HASH_SECRET";

/// Mapper-wide settings, read from the `settings:` section of schema.yaml.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Secret mixed into every hash of an `encrypted` field
    pub hash_secret: String,
    /// Stamp `created_at`/`updated_at` on schemas that keep timestamps
    pub timestamps_by_default: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            hash_secret: String::new(),
            timestamps_by_default: true,
        }
    }
}

impl Settings {
    pub fn with_hash_secret(mut self, secret: impl Into<String>) -> Self {
        self.hash_secret = secret.into();
        self
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(mut self) -> Self {
        if let Ok(secret) = std::env::var(HASH_SECRET_ENV) {
            if !secret.is_empty() {
                self.hash_secret = secret;
            }
        }
        self
    }
}
