//! Route -> tunnel index with bounded weight and optional persistence

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::LruCache;
use crate::config::RegistryConfig;
use crate::error::ServerError;
use crate::journal::{Journal, JournalEntry};
use crate::tunnel::{normalize_host, Tunnel, TunnelRecord};

/// Public routes and the tunnels serving them
///
/// Bounded by a weight budget: when over it, the least recently used entry whose
/// owner is not live is evicted. Entries with a live owner are never evicted, so
/// the budget is soft when every entry is live.
pub struct TunnelRegistry {
    cache: Mutex<LruCache<String, Arc<Tunnel>>>,
    journal: Option<Journal>,
    capacity: usize,
    restore_grace: Duration,
    opened_at: Instant,
}

impl TunnelRegistry {
    /// In-memory registry with no journal
    pub fn new(capacity: usize, restore_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(LruCache::new()),
            journal: None,
            capacity,
            restore_grace,
            opened_at: Instant::now(),
        })
    }

    /// Build the registry from config, restoring journaled tunnels if a cache file is set
    pub fn open(config: &RegistryConfig) -> Result<Arc<Self>, ServerError> {
        let Some(path) = &config.cache_file else {
            return Ok(Self::new(config.capacity_bytes, config.restore_grace));
        };

        let (journal, records) = Journal::open(path)?;
        let mut cache = LruCache::new();
        for record in records {
            let tunnel = Tunnel::restore(record);
            cache.insert(tunnel.route().to_string(), tunnel);
        }

        // Oldest first; nothing restored is live
        let mut trimmed = 0;
        while cache.weight() > config.capacity_bytes {
            if cache.evict_lru_where(|_, _| true).is_none() {
                break;
            }
            trimmed += 1;
        }
        if trimmed > 0 {
            tracing::info!(trimmed, "Dropped restored tunnels over capacity");
        }

        let records: Vec<TunnelRecord> = cache.values_lru().map(|t| t.record().clone()).collect();
        journal.writer().compact(&records)?;

        tracing::info!(
            path = %path.display(),
            restored = cache.len(),
            grace_secs = config.restore_grace.as_secs(),
            "Tunnel registry opened"
        );

        Ok(Arc::new(Self {
            cache: Mutex::new(cache),
            journal: Some(journal),
            capacity: config.capacity_bytes,
            restore_grace: config.restore_grace,
            opened_at: Instant::now(),
        }))
    }

    fn in_grace(&self) -> bool {
        self.opened_at.elapsed() < self.restore_grace
    }

    /// Whether `tunnel` still holds its route against other clients
    fn holds_reservation(&self, tunnel: &Tunnel) -> bool {
        tunnel.is_live() || (tunnel.is_restored() && self.in_grace())
    }

    fn journal_put(&self, tunnel: &Tunnel) {
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::Put {
                tunnel: tunnel.record().clone(),
            });
        }
    }

    fn journal_remove(&self, route: &str) {
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::Remove {
                route: route.to_string(),
            });
        }
    }

    /// Bind `tunnel` to its route
    ///
    /// Re-registering a route by the same client replaces the old entry. A route
    /// held by another client's live tunnel (or a restored reservation still in its
    /// grace period) is refused with `RouteConflict`.
    pub fn add(&self, tunnel: Arc<Tunnel>) -> Result<(), ServerError> {
        let mut cache = self.cache.lock();

        if let Some(existing) = cache.peek(tunnel.route()) {
            if existing.client_id() != tunnel.client_id() && self.holds_reservation(existing) {
                return Err(ServerError::RouteConflict {
                    route: tunnel.route().to_string(),
                    owner: existing.client_id().to_string(),
                });
            }
        }

        let route = tunnel.route().to_string();
        let client_id = tunnel.client_id().to_string();
        self.journal_put(&tunnel);
        if let Some(previous) = cache.insert(route.clone(), tunnel) {
            if previous.client_id() != client_id {
                tracing::info!(
                    route = %route,
                    previous = %previous.client_id(),
                    client_id = %client_id,
                    "Route taken over from an offline owner"
                );
                previous.close();
            }
        }

        while cache.weight() > self.capacity {
            match cache.evict_lru_where(|key, t| *key != route && !t.is_live()) {
                Some((evicted, tunnel)) => {
                    tunnel.close();
                    self.journal_remove(&evicted);
                    tracing::debug!(route = %evicted, "Evicted tunnel");
                }
                None => {
                    tracing::warn!(
                        weight = cache.weight(),
                        capacity = self.capacity,
                        entries = cache.len(),
                        "Tunnel registry over capacity with no evictable entries"
                    );
                    break;
                }
            }
        }

        Ok(())
    }

    /// Look up a route, marking it recently used
    ///
    /// An entry whose owner is gone is pruned and reported missing, unless it is a
    /// restored reservation still inside its grace period.
    pub fn get(&self, route: &str) -> Option<Arc<Tunnel>> {
        let mut cache = self.cache.lock();
        let tunnel = cache.get(route)?.clone();

        if tunnel.is_live() || (tunnel.is_restored() && self.in_grace()) {
            return Some(tunnel);
        }

        cache.remove(route);
        tunnel.close();
        self.journal_remove(route);
        tracing::debug!(route = %route, "Pruned tunnel with no live owner");
        None
    }

    /// Look up an HTTP tunnel by Host header value
    pub fn lookup_host(&self, host: &str) -> Option<Arc<Tunnel>> {
        self.get(&normalize_host(host))
    }

    pub fn remove(&self, route: &str) -> Option<Arc<Tunnel>> {
        let mut cache = self.cache.lock();
        let removed = cache.remove(route)?;
        self.journal_remove(route);
        Some(removed)
    }

    /// Remove `tunnel` only if its route still maps to this exact instance
    pub fn release(&self, tunnel: &Arc<Tunnel>) -> bool {
        let mut cache = self.cache.lock();
        match cache.peek(tunnel.route()) {
            Some(current) if Arc::ptr_eq(current, tunnel) => {
                cache.remove(tunnel.route());
                self.journal_remove(tunnel.route());
                true
            }
            _ => false,
        }
    }

    /// Whether `client_id` could bind `route` without a conflict
    pub fn is_available(&self, route: &str, client_id: &str) -> bool {
        let cache = self.cache.lock();
        match cache.peek(route) {
            None => true,
            Some(existing) => existing.client_id() == client_id || !self.holds_reservation(existing),
        }
    }

    /// All entries, least recently used first
    pub fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        self.cache.lock().values_lru().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Current weight of all entries
    pub fn weight(&self) -> usize {
        self.cache.lock().weight()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_persistent(&self) -> bool {
        self.journal.is_some()
    }

    /// Write buffered journal entries, compacting when the file has grown large
    ///
    /// Blocking file I/O; call from `spawn_blocking` on the runtime.
    pub fn flush(&self) -> Result<(), ServerError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };

        let mut writer = journal.writer();
        let (pending, snapshot) = {
            let cache = self.cache.lock();
            let pending = journal.take_pending();
            let snapshot = writer
                .needs_compaction(pending.len(), cache.len())
                .then(|| {
                    cache
                        .values_lru()
                        .map(|t| t.record().clone())
                        .collect::<Vec<_>>()
                });
            (pending, snapshot)
        };

        let result = match &snapshot {
            Some(records) => writer.compact(records),
            None => writer.append(&pending),
        };

        if result.is_err() {
            // The file is untouched on failure; keep the entries for the next
            // attempt, ahead of anything newer
            let mut retry = pending;
            retry.extend(journal.take_pending());
            for entry in retry {
                journal.record(entry);
            }
            let lines = writer.lines();
            drop(writer);
            tracing::debug!(
                path = %journal.path().display(),
                pending = journal.pending_len(),
                lines,
                "Journal entries kept for the next flush"
            );
        }
        result
    }

    /// Flush on an interval until `cancel` fires, then flush once more
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.clone().flush_blocking().await;
                    }
                }
            }

            registry.flush_blocking().await;
            tracing::debug!("Tunnel journal flusher stopped");
        })
    }

    async fn flush_blocking(self: Arc<Self>) {
        match tokio::task::spawn_blocking(move || self.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to flush tunnel journal: {}", e),
            Err(e) => tracing::error!("Tunnel journal flush task failed: {}", e),
        }
    }
}
