//! Process instance identity.

use uuid::Uuid;

/// Stable unique identifier for this proxy process.
///
/// Owned slots in the active-request store and emitted metrics are tagged
/// with this id so a restarted instance can clean up after its predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceId(String);

impl InstanceId {
    /// From the INSTANCE_ID environment variable if set, otherwise a random
    /// value generated at startup.
    pub fn resolve() -> Self {
        match std::env::var("INSTANCE_ID") {
            Ok(id) if !id.trim().is_empty() => Self(id),
            _ => Self(format!("proxy-{}", Uuid::new_v4())),
        }
    }

    #[cfg(test)]
    pub fn fixed(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
