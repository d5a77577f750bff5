/// Key layout in the fast store. Every key carries the deployment prefix so
/// several environments can share one Redis.
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Passed to scripts that derive inventory or hold keys from stored entries.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn inventory(&self, event_id: &str, category_id: &str) -> String {
        format!("{}inventory:{}:{}", self.prefix, event_id, category_id)
    }

    pub fn hold(&self, hold_token: &str) -> String {
        format!("{}holds:{}", self.prefix, hold_token)
    }

    pub fn expiry_index(&self) -> String {
        format!("{}holds:expiration-index", self.prefix)
    }

    /// Token to entries json for every hold in the expiry index. No TTL.
    pub fn indexed_entries(&self) -> String {
        format!("{}holds:indexed-entries", self.prefix)
    }

    pub fn queue(&self, event_id: &str) -> String {
        format!("{}queue:{}", self.prefix, event_id)
    }

    pub fn queue_entry(&self, queue_id: &str) -> String {
        format!("{}queue:entry:{}", self.prefix, queue_id)
    }

    pub fn rate_limit(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}
