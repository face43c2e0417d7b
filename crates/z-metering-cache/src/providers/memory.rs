//! In-memory cache backend.
//!
//! A single mutex guards every key, so each operation is atomic the same way a
//! Redis command or script is. Expiry is measured on the tokio clock, which
//! lets tests drive TTLs with a paused runtime.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::{CacheBackend, ChannelSubscription};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
enum Value {
    Text(String),
    SortedSet(BTreeMap<String, i64>),
    Stream(VecDeque<(String, String)>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<String>>,
    stream_seq: u64,
}

impl State {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn live_or_insert(&mut self, key: &str, empty: impl FnOnce() -> Value) -> &mut Entry {
        self.live(key);
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: empty(),
            expires_at: None,
        })
    }

    fn counter(&mut self, key: &str) -> Result<i64> {
        match self.live(key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::Text(text)) => text.parse().map_err(|_| {
                CacheError::Backend("ERR value is not an integer or out of range".into())
            }),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Store a counter value, keeping any existing expiry.
    fn store_counter(&mut self, key: &str, value: i64) {
        let expires_at = self.live(key).and_then(|entry| entry.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }
}

fn wrong_type() -> CacheError {
    CacheError::Backend(
        "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
    )
}

/// Process-local [`CacheBackend`].
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").finish_non_exhaustive()
    }
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CacheError::Backend("memory cache lock poisoned".into()))
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state()?;
        match state.live(key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.state()?.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state()?.entries.remove(key);
        Ok(())
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut state = self.state()?;
        Ok(state
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut state = self.state()?;
        let value = state.counter(key)? + 1;
        state.store_counter(key, value);
        let has_expiry = state.live(key).is_some_and(|entry| entry.expires_at.is_some());
        if value == 1 || !has_expiry {
            state.expire(key, ttl);
        }
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut state = self.state()?;
        let value = state.counter(key)? - 1;
        state.store_counter(key, value);
        Ok(value)
    }

    async fn saturate_with_ttl(&self, key: &str, ceiling: i64, ttl: Duration) -> Result<i64> {
        let mut state = self.state()?;
        let value = state.counter(key)?.max(ceiling);
        state.store_counter(key, value);
        state.expire(key, ttl);
        Ok(value)
    }

    async fn semaphore_acquire(
        &self,
        key: &str,
        member: &str,
        limit: u32,
        now_ms: i64,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut state = self.state()?;
        let cutoff = now_ms - i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);

        let entry = state.live_or_insert(key, || Value::SortedSet(BTreeMap::new()));
        let Value::SortedSet(members) = &mut entry.value else {
            return Err(wrong_type());
        };

        let before = members.len();
        members.retain(|_, score| *score > cutoff);
        if members.len() < before {
            debug!(key, reaped = before - members.len(), "Reaped stale semaphore entries");
        }

        if members.len() < limit as usize {
            members.insert(member.to_string(), now_ms);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn semaphore_release(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state()?;
        match state.live(key).map(|entry| &mut entry.value) {
            None => Ok(false),
            Some(Value::SortedSet(members)) => Ok(members.remove(member).is_some()),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn semaphore_count(&self, key: &str) -> Result<u64> {
        let mut state = self.state()?;
        match state.live(key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::SortedSet(members)) => Ok(members.len() as u64),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn stream_append(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<String> {
        let mut state = self.state()?;
        state.stream_seq += 1;
        let id = format!("{}-0", state.stream_seq);

        let entry = state.live_or_insert(key, || Value::Stream(VecDeque::new()));
        let Value::Stream(log) = &mut entry.value else {
            return Err(wrong_type());
        };
        log.push_back((id.clone(), payload.to_string()));
        while log.len() > max_len {
            log.pop_front();
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(id)
    }

    async fn stream_read(&self, key: &str) -> Result<Vec<String>> {
        let mut state = self.state()?;
        match state.live(key).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Stream(log)) => Ok(log.iter().map(|(_, payload)| payload.clone()).collect()),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut state = self.state()?;
        let Some(sender) = state.channels.get(channel) else {
            return Ok(0);
        };
        if let Ok(receivers) = sender.send(payload.to_string()) {
            return Ok(receivers as u64);
        }
        state.channels.remove(channel);
        Ok(0)
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelSubscription> {
        let receiver = self
            .state()?
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let name = channel.to_string();
        let payloads = futures::stream::unfold(receiver, move |mut receiver| {
            let name = name.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "Subscriber lagged; messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(ChannelSubscription::new(channel, payloads))
    }

    async fn health_check(&self) -> Result<()> {
        self.state().map(|_| ())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn set_ex_expires() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_sets_ttl_once() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_with_ttl("c", MINUTE).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.incr_with_ttl("c", MINUTE).await.unwrap(), 2);

        let ttl = cache.pttl("c").await.unwrap().unwrap();
        assert_eq!(ttl, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(41)).await;
        assert_eq!(cache.incr_with_ttl("c", MINUTE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn decr_keeps_expiry() {
        let cache = MemoryCache::new();
        cache.incr_with_ttl("c", MINUTE).await.unwrap();
        cache.incr_with_ttl("c", MINUTE).await.unwrap();
        assert_eq!(cache.decr("c").await.unwrap(), 1);
        assert!(cache.pttl("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn saturate_raises_but_never_lowers() {
        let cache = MemoryCache::new();
        assert_eq!(cache.saturate_with_ttl("c", 5, MINUTE).await.unwrap(), 5);
        for _ in 0..3 {
            cache.incr_with_ttl("c", MINUTE).await.unwrap();
        }
        assert_eq!(cache.saturate_with_ttl("c", 5, MINUTE).await.unwrap(), 8);
        assert!(cache.pttl("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn semaphore_bounds_membership() {
        let cache = MemoryCache::new();
        let stale = Duration::from_secs(600);
        assert!(cache.semaphore_acquire("s", "a", 2, 1_000, stale).await.unwrap());
        assert!(cache.semaphore_acquire("s", "b", 2, 1_001, stale).await.unwrap());
        assert!(!cache.semaphore_acquire("s", "c", 2, 1_002, stale).await.unwrap());
        assert_eq!(cache.semaphore_count("s").await.unwrap(), 2);

        assert!(cache.semaphore_release("s", "a").await.unwrap());
        assert!(!cache.semaphore_release("s", "a").await.unwrap());
        assert!(cache.semaphore_acquire("s", "c", 2, 1_003, stale).await.unwrap());
    }

    #[tokio::test]
    async fn semaphore_reaps_stale_members() {
        let cache = MemoryCache::new();
        let stale = Duration::from_secs(600);
        assert!(cache.semaphore_acquire("s", "crashed", 1, 0, stale).await.unwrap());
        assert!(!cache.semaphore_acquire("s", "next", 1, 599_000, stale).await.unwrap());
        assert!(cache.semaphore_acquire("s", "next", 1, 600_001, stale).await.unwrap());
        assert_eq!(cache.semaphore_count("s").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_is_capped_and_refreshed() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(300);
        for i in 0..5 {
            cache.stream_append("log", &format!("e{i}"), 3, ttl).await.unwrap();
            tokio::time::advance(Duration::from_secs(200)).await;
        }
        assert_eq!(cache.stream_read("log").await.unwrap(), vec!["e2", "e3", "e4"]);

        tokio::time::advance(Duration::from_secs(101)).await;
        assert!(cache.stream_read("log").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_live_subscribers_only() {
        let cache = MemoryCache::new();
        assert_eq!(cache.publish("ch", "before").await.unwrap(), 0);

        let mut sub = cache.subscribe("ch").await.unwrap();
        assert_eq!(sub.channel(), "ch");
        assert_eq!(cache.publish("ch", "after").await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("after"));

        drop(sub);
        assert_eq!(cache.publish("ch", "gone").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_type_is_a_backend_error() {
        let cache = MemoryCache::new();
        cache.stream_append("k", "x", 10, MINUTE).await.unwrap();
        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
    }
}
