use std::time::Duration;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::retx_listener::ReceiverId;
use crate::safe_converter::PrecheckedCast;

/// Per-product retransmission entry: everything a recovery worker needs to
/// service requests for the product, plus the bookkeeping that bounds the
/// entry's lifetime.
///
/// `data` and `metadata` are reference-counted handles shared with the
/// application; the bytes are never modified while the entry lives.
#[derive(Clone, Debug)]
pub struct RetxMetadata {
    pub prod_index: u32,
    /// product length in bytes
    pub prod_length: u32,
    pub metadata: Bytes,
    pub data: Bytes,
    /// stamped before the entry is published
    pub mcast_start: Instant,
    /// set once, when multicasting of the product finishes
    pub mcast_end: Option<Instant>,
    pub retx_timeout_ratio: f32,
    /// retention window; `None` until published by `set_timer_parameters`
    pub retx_timeout_period: Option<Duration>,
    /// receivers that have not yet confirmed complete reception
    pub unfinished: FxHashSet<ReceiverId>,
}

impl RetxMetadata {
    pub fn meta_size(&self) -> u16 {
        self.metadata.len().prechecked_cast()
    }
}

/// The registry of in-flight products, keyed by product index.
///
/// Lookups proceed in parallel on the worker hot path; mutations are
/// exclusive. An entry lives until either the retention timer evicts it or
/// the last unfinished receiver drains it - whichever happens first wins, the
/// other sees the entry gone.
pub struct RetxMetadataMap {
    entries: RwLock<FxHashMap<u32, RetxMetadata>>,
}

impl Default for RetxMetadataMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RetxMetadataMap {
    pub fn new() -> RetxMetadataMap {
        RetxMetadataMap {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Publishes an entry. The entry must be fully filled in except for the
    /// timer parameters, which `set_timer_parameters` publishes after the
    /// multicast burst.
    pub async fn insert(&self, meta: RetxMetadata) {
        let prod_index = meta.prod_index;
        let previous = self.entries.write().await.insert(prod_index, meta);
        if previous.is_some() {
            // only reachable when the 32-bit index wraps around with the old
            // product still retained
            warn!("replaced a live retransmission entry for product #{prod_index}");
        }
    }

    pub async fn lookup(&self, prod_index: u32) -> Option<RetxMetadata> {
        self.entries.read().await.get(&prod_index).cloned()
    }

    /// Stamps the multicast end time and computes the retention window,
    /// exactly once per entry. `link_speed` (bits per second, 0 = unknown)
    /// floors the measured multicast period by the nominal serialization time
    /// of the product on the constrained link.
    ///
    /// Returns the window, or `None` if the entry is already gone.
    pub async fn set_timer_parameters(&self, prod_index: u32, link_speed: u64) -> Option<Duration> {
        let mut entries = self.entries.write().await;
        let meta = entries.get_mut(&prod_index)?;

        if let Some(period) = meta.retx_timeout_period {
            warn!("timer parameters of product #{prod_index} are already set");
            return Some(period);
        }

        let mcast_end = Instant::now();
        meta.mcast_end = Some(mcast_end);

        let mut mcast_period = mcast_end - meta.mcast_start;
        if link_speed > 0 {
            let serialization =
                Duration::from_secs_f64(f64::from(meta.prod_length) * 8.0 / link_speed as f64);
            mcast_period = mcast_period.max(serialization);
        }

        let period =
            Duration::from_secs_f64(mcast_period.as_secs_f64() * f64::from(meta.retx_timeout_ratio));
        meta.retx_timeout_period = Some(period);
        Some(period)
    }

    /// Removes `receiver` from the product's unfinished set. Returns true iff
    /// that left the set empty, in which case the entry is evicted in the same
    /// critical section.
    pub async fn clear_receiver(&self, prod_index: u32, receiver: ReceiverId) -> bool {
        let mut entries = self.entries.write().await;
        let Some(meta) = entries.get_mut(&prod_index) else {
            return false;
        };

        meta.unfinished.remove(&receiver);
        if meta.unfinished.is_empty() {
            entries.remove(&prod_index);
            debug!("product #{prod_index} drained by its last unfinished receiver {receiver}");
            true
        } else {
            false
        }
    }

    /// Evicts the entry. Returns true iff it was present.
    pub async fn remove(&self, prod_index: u32) -> bool {
        self.entries.write().await.remove(&prod_index).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prod_index: u32, unfinished: &[u32]) -> RetxMetadata {
        RetxMetadata {
            prod_index,
            prod_length: 5,
            metadata: Bytes::new(),
            data: Bytes::from_static(b"hello"),
            mcast_start: Instant::now(),
            mcast_end: None,
            retx_timeout_ratio: 20.0,
            retx_timeout_period: None,
            unfinished: unfinished.iter().map(|&id| ReceiverId::from_raw(id)).collect(),
        }
    }

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let map = RetxMetadataMap::new();
        map.insert(entry(3, &[])).await;

        let found = map.lookup(3).await.unwrap();
        assert_eq!(found.prod_index, 3);
        assert_eq!(found.data.as_ref(), b"hello");
        assert!(found.retx_timeout_period.is_none());

        assert!(map.remove(3).await);
        assert!(map.lookup(3).await.is_none());
        assert!(!map.remove(3).await);
    }

    #[tokio::test]
    async fn test_clear_receiver_retains_entry_while_others_unfinished() {
        let map = RetxMetadataMap::new();
        map.insert(entry(0, &[1, 2])).await;

        assert!(!map.clear_receiver(0, ReceiverId::from_raw(1)).await);
        assert!(map.lookup(0).await.is_some());

        assert!(map.clear_receiver(0, ReceiverId::from_raw(2)).await);
        assert!(map.lookup(0).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_receiver_after_eviction_is_not_drained() {
        let map = RetxMetadataMap::new();
        map.insert(entry(0, &[1])).await;

        assert!(map.remove(0).await);
        // the timer won; the worker's RETX_END must not report a drain
        assert!(!map.clear_receiver(0, ReceiverId::from_raw(1)).await);
    }

    #[tokio::test]
    async fn test_clear_unknown_receiver_can_still_drain() {
        // a receiver that connected after the product was registered sends
        // RETX_END: it is not in the unfinished set, but an empty set still
        // evicts, matching the drain rule
        let map = RetxMetadataMap::new();
        map.insert(entry(0, &[])).await;

        assert!(map.clear_receiver(0, ReceiverId::from_raw(9)).await);
        assert!(map.lookup(0).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timer_parameters_scales_mcast_period() {
        let map = RetxMetadataMap::new();
        map.insert(entry(0, &[])).await;

        tokio::time::advance(Duration::from_millis(100)).await;

        let period = map.set_timer_parameters(0, 0).await.unwrap();
        assert_eq!(period, Duration::from_secs(2)); // 100ms * ratio 20

        let found = map.lookup(0).await.unwrap();
        assert!(found.mcast_end.is_some());
        assert_eq!(found.retx_timeout_period, Some(period));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timer_parameters_only_once() {
        let map = RetxMetadataMap::new();
        map.insert(entry(0, &[])).await;

        tokio::time::advance(Duration::from_millis(50)).await;
        let first = map.set_timer_parameters(0, 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = map.set_timer_parameters(0, 0).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_set_timer_parameters_on_missing_entry() {
        let map = RetxMetadataMap::new();
        assert!(map.set_timer_parameters(42, 0).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_speed_floors_the_period() {
        let map = RetxMetadataMap::new();
        let mut meta = entry(0, &[]);
        meta.prod_length = 1_000_000;
        map.insert(meta).await;

        // measured burst is instantaneous, but 8 Mbit at 1 Mbit/s nominally
        // takes 8 seconds
        let period = map.set_timer_parameters(0, 1_000_000).await.unwrap();
        assert_eq!(period, Duration::from_secs(160)); // 8s * ratio 20
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ratio_yields_zero_period() {
        let map = RetxMetadataMap::new();
        let mut meta = entry(0, &[]);
        meta.retx_timeout_ratio = 0.0;
        map.insert(meta).await;

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(map.set_timer_parameters(0, 0).await, Some(Duration::ZERO));
    }
}
