use http::Uri;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Why an install was rejected. Both map to a 400 on the control API.
#[derive(Debug, PartialEq, Eq)]
pub enum InstallError {
    EmptyDecoyList,
    MalformedUrl(String),
    EmptySourceAddress,
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::EmptyDecoyList => write!(f, "decoy_urls must not be empty"),
            InstallError::MalformedUrl(u) => write!(f, "malformed decoy url: {}", u),
            InstallError::EmptySourceAddress => write!(f, "source_ip must not be empty"),
        }
    }
}

/// One blocked source address: its fixed decoy URL list and the round-robin
/// cursor. The counter is process-local and resets on restart; selection
/// order within an entry is exactly the counter order.
pub struct BlockEntry {
    decoy_urls: Vec<Uri>,
    counter: AtomicU64,
}

impl BlockEntry {
    /// Read-and-advance: the k-th call returns `decoy_urls[k mod len]`.
    /// `fetch_add` wraps at u64::MAX, which the modulo absorbs.
    pub fn select(&self) -> &Uri {
        let k = self.counter.fetch_add(1, Ordering::Relaxed);
        &self.decoy_urls[(k % self.decoy_urls.len() as u64) as usize]
    }

    pub fn decoy_urls(&self) -> &[Uri] {
        &self.decoy_urls
    }

    #[cfg(test)]
    fn set_counter(&self, v: u64) {
        self.counter.store(v, Ordering::Relaxed);
    }
}

/// The attacker → decoy-set table owned by the gateway.
///
/// Readers (every proxied request) take the read lock only long enough to
/// clone the entry Arc; the hot-path counter advance is the entry's atomic.
/// Writers (control API) are rare. Mutations are linearizable with respect
/// to each other and to reads via the table lock.
#[derive(Default)]
pub struct BlockTable {
    entries: RwLock<HashMap<String, Arc<BlockEntry>>>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or overwrite the entry for `source_ip`. Overwrite discards
    /// the previous URL list and resets the counter to zero.
    pub fn install(&self, source_ip: &str, decoy_urls: &[String]) -> Result<(), InstallError> {
        if source_ip.trim().is_empty() {
            return Err(InstallError::EmptySourceAddress);
        }
        if decoy_urls.is_empty() {
            return Err(InstallError::EmptyDecoyList);
        }
        let mut parsed = Vec::with_capacity(decoy_urls.len());
        for raw in decoy_urls {
            let uri: Uri = raw
                .parse()
                .map_err(|_| InstallError::MalformedUrl(raw.clone()))?;
            if uri.scheme().is_none() || uri.authority().is_none() {
                return Err(InstallError::MalformedUrl(raw.clone()));
            }
            parsed.push(uri);
        }

        let entry = Arc::new(BlockEntry {
            decoy_urls: parsed,
            counter: AtomicU64::new(0),
        });

        let mut entries = self.entries.write().expect("block table lock poisoned");
        entries.insert(source_ip.to_string(), entry);
        metrics::gauge!("mirage_blocked_ips").set(entries.len() as f64);
        Ok(())
    }

    /// Remove the entry if present; returns whether one was removed.
    /// Idempotent — clearing an unknown address is a no-op.
    pub fn clear(&self, source_ip: &str) -> bool {
        let mut entries = self.entries.write().expect("block table lock poisoned");
        let removed = entries.remove(source_ip).is_some();
        metrics::gauge!("mirage_blocked_ips").set(entries.len() as f64);
        removed
    }

    pub fn lookup(&self, source_ip: &str) -> Option<Arc<BlockEntry>> {
        self.entries
            .read()
            .expect("block table lock poisoned")
            .get(source_ip)
            .cloned()
    }

    /// Snapshot for the stats/health endpoints: count plus sorted addresses.
    pub fn snapshot(&self) -> (usize, Vec<String>) {
        let entries = self.entries.read().expect("block table lock poisoned");
        let mut ips: Vec<String> = entries.keys().cloned().collect();
        ips.sort();
        (entries.len(), ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("http://d{}:8080", i)).collect()
    }

    #[test]
    fn round_robin_rotation_from_slot_zero() {
        let table = BlockTable::new();
        table.install("10.0.0.9", &urls(3)).unwrap();
        let entry = table.lookup("10.0.0.9").unwrap();

        let picked: Vec<String> = (0..7).map(|_| entry.select().to_string()).collect();
        assert_eq!(
            picked,
            vec![
                "http://d1:8080/",
                "http://d2:8080/",
                "http://d3:8080/",
                "http://d1:8080/",
                "http://d2:8080/",
                "http://d3:8080/",
                "http://d1:8080/",
            ]
        );
    }

    #[test]
    fn first_three_k_requests_hit_each_decoy_k_times() {
        let table = BlockTable::new();
        table.install("10.0.0.9", &urls(3)).unwrap();
        let entry = table.lookup("10.0.0.9").unwrap();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            *counts.entry(entry.select().to_string()).or_insert(0) += 1;
        }
        assert!(counts.values().all(|&c| c == 3));
    }

    #[test]
    fn clear_removes_and_is_idempotent() {
        let table = BlockTable::new();
        table.install("10.0.0.9", &urls(3)).unwrap();
        assert!(table.clear("10.0.0.9"));
        assert!(table.lookup("10.0.0.9").is_none());
        assert!(!table.clear("10.0.0.9"));
    }

    #[test]
    fn reinstall_replaces_urls_and_resets_counter() {
        let table = BlockTable::new();
        table.install("10.0.0.9", &urls(3)).unwrap();
        let first = table.lookup("10.0.0.9").unwrap();
        first.select();
        first.select();

        table
            .install("10.0.0.9", &["http://fresh:9090".to_string()])
            .unwrap();
        let entry = table.lookup("10.0.0.9").unwrap();
        assert_eq!(entry.decoy_urls().len(), 1);
        assert_eq!(entry.select().to_string(), "http://fresh:9090/");
    }

    #[test]
    fn at_most_one_entry_per_address() {
        let table = BlockTable::new();
        table.install("10.0.0.9", &urls(3)).unwrap();
        table.install("10.0.0.9", &urls(2)).unwrap();
        let (count, ips) = table.snapshot();
        assert_eq!(count, 1);
        assert_eq!(ips, vec!["10.0.0.9"]);
    }

    #[test]
    fn install_rejects_empty_list() {
        let table = BlockTable::new();
        assert_eq!(
            table.install("10.0.0.9", &[]),
            Err(InstallError::EmptyDecoyList)
        );
        assert!(table.lookup("10.0.0.9").is_none());
    }

    #[test]
    fn install_rejects_malformed_url() {
        let table = BlockTable::new();
        let err = table
            .install("10.0.0.9", &["not a url".to_string()])
            .unwrap_err();
        assert!(matches!(err, InstallError::MalformedUrl(_)));
        // relative URIs parse but carry no authority
        let err = table
            .install("10.0.0.9", &["/just/a/path".to_string()])
            .unwrap_err();
        assert!(matches!(err, InstallError::MalformedUrl(_)));
        assert!(table.lookup("10.0.0.9").is_none());
    }

    #[test]
    fn install_rejects_empty_source() {
        let table = BlockTable::new();
        assert_eq!(
            table.install("  ", &urls(1)),
            Err(InstallError::EmptySourceAddress)
        );
    }

    #[test]
    fn counter_at_max_wraps_through_modulo() {
        let table = BlockTable::new();
        table.install("10.0.0.9", &urls(3)).unwrap();
        let entry = table.lookup("10.0.0.9").unwrap();
        entry.set_counter(u64::MAX);

        // u64::MAX % 3 == 0, then the counter wraps to 0
        assert_eq!(entry.select().to_string(), "http://d1:8080/");
        assert_eq!(entry.select().to_string(), "http://d1:8080/");
        assert_eq!(entry.select().to_string(), "http://d2:8080/");
    }
}
