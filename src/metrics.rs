use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
pub struct CacheStat {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    /// Entries decoded and committed; at most one per name.
    pub decodes: u64,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub class: CacheStat,
    pub protocol: CacheStat,
    pub selector: CacheStat,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cache Statistics:")?;
        writeln!(f, "  Class Cache:     {}", self.class)?;
        writeln!(f, "  Protocol Cache:  {}", self.protocol)?;
        writeln!(f, "  Selector Cache:  {}", self.selector)?;
        Ok(())
    }
}

impl std::fmt::Display for CacheStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hits: {:>8}, misses: {:>8}, hit_rate: {:>6.2}%, size: {:>8}, decodes: {:>8}",
            self.hits,
            self.misses,
            self.hit_rate * 100.0,
            self.size,
            self.decodes
        )
    }
}

/// Hit/miss/decode counters for one cache.
///
/// All counters use `Ordering::Relaxed`: they are independent and only need
/// to be updated atomically.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    decodes: AtomicU64,
}

impl CacheCounters {
    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode(&self) {
        self.decodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decodes(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, size: usize) -> CacheStat {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStat {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size,
            decodes: self.decodes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_hit_rate() {
        let c = CacheCounters::default();
        assert_eq!(c.snapshot(0).hit_rate, 0.0);
        c.record_miss();
        c.record_hit();
        c.record_hit();
        c.record_hit();
        c.record_decode();
        let s = c.snapshot(1);
        assert_eq!(s.hits, 3);
        assert_eq!(s.misses, 1);
        assert_eq!(s.hit_rate, 0.75);
        assert_eq!(s.decodes, 1);
    }

    #[test]
    fn test_display_and_serialize() {
        let c = CacheCounters::default();
        c.record_hit();
        let stat = c.snapshot(2);
        let text = stat.to_string();
        assert!(text.contains("hit_rate: 100.00%"));
        let json = serde_json::to_value(stat).unwrap();
        assert_eq!(json["size"], 2);
    }
}
