//! Page proxies: long-lived handles that outlive the pages they name
//!
//! A [`PageProxy`] names a page by key and is cheap to clone across threads.
//! Resolving it inside a transaction reloads the page if it was evicted in the
//! meantime. A proxy becomes permanently stale when its file is deleted or the
//! whole cache is cleared; resolving a stale proxy fails.
//!
//! The registry hands out one shared proxy per key and is swept periodically:
//! entries nobody outside the registry holds anymore are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::page::PageKey;

#[derive(Debug)]
struct ProxyState {
    key: PageKey,
    stale: AtomicBool,
    cacheable: bool,
}

/// Re-resolvable handle to a page.
#[derive(Debug, Clone)]
pub struct PageProxy(Arc<ProxyState>);

impl PageProxy {
    fn new(key: PageKey, cacheable: bool) -> Self {
        Self(Arc::new(ProxyState { key, stale: AtomicBool::new(false), cacheable }))
    }

    pub fn key(&self) -> PageKey {
        self.0.key
    }

    /// The page this proxy names may be cached when resolved.
    pub fn is_cacheable(&self) -> bool {
        self.0.cacheable
    }

    pub fn is_stale(&self) -> bool {
        self.0.stale.load(Ordering::Acquire)
    }

    fn mark_stale(&self) {
        self.0.stale.store(true, Ordering::Release);
    }

    fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Key-addressed table of live proxies.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    proxies: HashMap<PageKey, PageProxy>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live proxy for `key`, created on first request.
    pub fn proxy(&mut self, key: PageKey, cacheable: bool) -> PageProxy {
        if let Some(proxy) = self.proxies.get(&key) {
            if !proxy.is_stale() {
                return proxy.clone();
            }
        }
        let proxy = PageProxy::new(key, cacheable);
        self.proxies.insert(key, proxy.clone());
        proxy
    }

    /// Invalidate every proxy of one file.
    pub fn invalidate_file(&mut self, file_index: u32) {
        self.proxies.retain(|key, proxy| {
            if key.file_index == file_index {
                proxy.mark_stale();
                false
            } else {
                true
            }
        });
    }

    /// Invalidate everything; used when all caches are cleared.
    pub fn invalidate_all(&mut self) {
        for proxy in self.proxies.values() {
            proxy.mark_stale();
        }
        self.proxies.clear();
    }

    /// Drop entries only the registry still holds. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let before = self.proxies.len();
        self.proxies.retain(|_, proxy| proxy.holders() > 1);
        before - self.proxies.len()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}
