use crate::ocsp::is_fresh;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use trustgate_types::OcspResponse;

/// Process-wide OCSP evidence cache keyed by certificate hash.
#[derive(Debug, Default)]
pub struct OcspCache {
    entries: RwLock<HashMap<String, OcspResponse>>,
}

impl OcspCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached response for `cert_hash` if it is still fresh.
    pub fn get_fresh(&self, cert_hash: &str, now: DateTime<Utc>, freshness: Duration) -> Option<OcspResponse> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| {
            tracing::error!("OCSP cache lock poisoned, recovering");
            poisoned.into_inner()
        });
        entries
            .get(cert_hash)
            .filter(|response| is_fresh(response, now, freshness))
            .cloned()
    }

    /// Stores a verified response, replacing an older one.
    pub fn insert(&self, response: OcspResponse) {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| {
            tracing::error!("OCSP cache lock poisoned, recovering");
            poisoned.into_inner()
        });
        match entries.get(&response.cert_hash) {
            Some(existing) if existing.this_update > response.this_update => {}
            _ => {
                entries.insert(response.cert_hash.clone(), response);
            }
        }
    }

    /// Drops stale entries. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>, freshness: Duration) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| {
            tracing::error!("OCSP cache lock poisoned, recovering");
            poisoned.into_inner()
        });
        let before = entries.len();
        entries.retain(|_, response| is_fresh(response, now, freshness));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgate_types::CertStatus;

    fn response(hash: &str, this_update: DateTime<Utc>) -> OcspResponse {
        OcspResponse {
            cert_hash: hash.into(),
            status: CertStatus::Good,
            this_update,
            next_update: None,
            responder: "r".into(),
            signature: String::new(),
        }
    }

    #[test]
    fn stale_entries_are_not_served_and_get_pruned() {
        let cache = OcspCache::new();
        let now = Utc::now();
        cache.insert(response("fresh", now));
        cache.insert(response("stale", now - Duration::hours(3)));
        assert!(cache.get_fresh("fresh", now, Duration::hours(1)).is_some());
        assert!(cache.get_fresh("stale", now, Duration::hours(1)).is_none());
        assert_eq!(cache.prune(now, Duration::hours(1)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn older_response_does_not_replace_newer() {
        let cache = OcspCache::new();
        let now = Utc::now();
        cache.insert(response("a", now));
        cache.insert(response("a", now - Duration::minutes(10)));
        assert_eq!(cache.get_fresh("a", now, Duration::hours(1)).unwrap().this_update, now);
    }
}
