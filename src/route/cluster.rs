use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

/// Сколько последних `(origin, seq)` помнит сервер.
pub const SEEN_CACHE_SIZE: usize = 8192;

/// Кластерное состояние сервера: счётчики интереса, полученного с
/// маршрутов, и память о недавно пересланных сообщениях.
pub struct Cluster {
    /// Ключ интереса → сколько маршрутов его держат.
    interest: DashMap<Arc<str>, usize>,
    seen: Mutex<LruCache<(Arc<str>, u64), ()>>,
    seq: AtomicU64,
}

/// Ключ интереса: подписка `rsid` на сервере `origin`.
pub fn interest_key(
    origin: &str,
    rsid: &str,
) -> String {
    format!("{origin} {rsid}")
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_seen_capacity(SEEN_CACHE_SIZE)
    }

    pub fn with_seen_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            interest: DashMap::new(),
            seen: Mutex::new(LruCache::new(capacity)),
            seq: AtomicU64::new(0),
        }
    }

    /// Номер следующей локальной публикации, уходящей в кластер.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Отмечает сообщение; `false`, если оно уже встречалось.
    pub fn mark_seen(
        &self,
        origin: &Arc<str>,
        seq: u64,
    ) -> bool {
        self.seen.lock().put((origin.clone(), seq), ()).is_none()
    }

    /// Увеличивает счётчик; `true` для первой копии ключа.
    pub fn acquire(
        &self,
        key: &str,
    ) -> bool {
        let mut count = self.interest.entry(Arc::from(key)).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Уменьшает счётчик; `true`, когда ушла последняя копия ключа.
    pub fn release(
        &self,
        key: &str,
    ) -> bool {
        self.interest
            .remove_if_mut(key, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            })
            .is_some()
    }

    /// Количество различных ключей интереса.
    pub fn interest_len(&self) -> usize {
        self.interest.len()
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}
