//! # Read Cache
//!
//! Shared cache of GET and LIST responses served by the proxy.
//!
//! Object entries are keyed by `(kind, namespace, name)`, list entries by
//! `(kind, namespace, selector)`. Every kind has a generation counter. A
//! dynamic watch event for a kind replaces the object entry and bumps the
//! generation, which retires every list filled at an older generation. Writes
//! made through the proxy invalidate the object and the lists that may
//! contain it, and bump the generation too.
//!
//! A read takes a [`FillToken`] before it goes upstream. The response is only
//! stored if the kind's generation has not moved in the meantime, so a body
//! fetched before a watch event can never overwrite the event's object.
//!
//! Watches are tracked per `(kind, namespace)` scope, `None` meaning every
//! namespace. Entries outside a watched scope have no event feed and expire
//! after the configured TTL. When a watch (re)lists, objects of its scope
//! that the list did not refresh are dropped.

use crate::controller::kind::ResourceKind;
use axum::body::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Object {
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
    },
    List {
        kind: ResourceKind,
        namespace: Option<String>,
        selector: String,
    },
}

impl CacheKey {
    #[must_use]
    pub fn kind(&self) -> &ResourceKind {
        match self {
            CacheKey::Object { kind, .. } | CacheKey::List { kind, .. } => kind,
        }
    }

    fn namespace(&self) -> Option<&str> {
        match self {
            CacheKey::Object { namespace, .. } | CacheKey::List { namespace, .. } => {
                namespace.as_deref()
            }
        }
    }
}

/// Generation of a kind observed before a read went upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillToken(u64);

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: Option<String>,
    generation: u64,
    inserted: Instant,
}

type Scope = (ResourceKind, Option<String>);

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CachedResponse>,
    generations: HashMap<ResourceKind, u64>,
    watched: HashSet<Scope>,
    resyncs: HashMap<Scope, u64>,
}

impl CacheState {
    fn generation(&self, kind: &ResourceKind) -> u64 {
        self.generations.get(kind).copied().unwrap_or(0)
    }

    fn bump(&mut self, kind: &ResourceKind) -> u64 {
        let generation = self.generation(kind) + 1;
        self.generations.insert(kind.clone(), generation);
        generation
    }

    fn is_watched(&self, kind: &ResourceKind, namespace: Option<&str>) -> bool {
        let scoped = namespace.map(str::to_string);
        self.watched.contains(&(kind.clone(), None))
            || (scoped.is_some() && self.watched.contains(&(kind.clone(), scoped)))
    }
}

#[derive(Debug)]
pub struct ReadCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl ReadCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let kind = key.kind();
        let current = state.generation(kind);
        let watched = state.is_watched(kind, key.namespace());

        let entry = state.entries.get(key)?;
        let retired = matches!(key, CacheKey::List { .. }) && entry.generation < current;
        let expired = !watched && entry.inserted.elapsed() > self.ttl;
        if retired || expired {
            state.entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    /// Snapshot the generation of `kind` ahead of an upstream read
    #[must_use]
    pub fn token(&self, kind: &ResourceKind) -> FillToken {
        FillToken(
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .generation(kind),
        )
    }

    /// Store a response read under `token`. Returns `false` and drops the body
    /// when a watch event or write for the kind landed after the token was taken.
    pub fn insert(
        &self,
        key: CacheKey,
        body: Bytes,
        content_type: Option<String>,
        token: FillToken,
    ) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation(key.kind()) != token.0 {
            return false;
        }
        state.entries.insert(
            key,
            CachedResponse {
                body,
                content_type,
                generation: token.0,
                inserted: Instant::now(),
            },
        );
        true
    }

    /// Drop the object and every list of its kind that may contain it
    pub fn invalidate(&self, kind: &ResourceKind, namespace: Option<&str>, name: Option<&str>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.bump(kind);
        state.entries.retain(|key, _| match key {
            CacheKey::Object {
                kind: k,
                namespace: ns,
                name: n,
            } => !(k == kind && ns.as_deref() == namespace && name.is_none_or(|name| n == name)),
            CacheKey::List {
                kind: k,
                namespace: ns,
                ..
            } => !(k == kind && (ns.is_none() || ns.as_deref() == namespace)),
        });
    }

    /// Record that `kind` in `namespace` now has a watch feeding `apply_event`.
    /// `None` covers every namespace.
    pub fn mark_watched(&self, kind: &ResourceKind, namespace: Option<&str>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .insert((kind.clone(), namespace.map(str::to_string)));
    }

    /// A watch on the scope started a fresh list
    pub fn begin_resync(&self, kind: &ResourceKind, namespace: Option<&str>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = state.generation(kind);
        state
            .resyncs
            .insert((kind.clone(), namespace.map(str::to_string)), generation);
    }

    /// The list finished. Objects in scope it did not refresh are gone upstream.
    pub fn finish_resync(&self, kind: &ResourceKind, namespace: Option<&str>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(started) = state
            .resyncs
            .remove(&(kind.clone(), namespace.map(str::to_string)))
        else {
            return;
        };
        state.entries.retain(|key, entry| match key {
            CacheKey::Object {
                kind: k,
                namespace: ns,
                ..
            } => {
                let in_scope = namespace.is_none() || ns.as_deref() == namespace;
                !(k == kind && in_scope && entry.generation <= started)
            }
            CacheKey::List { .. } => true,
        });
        state.bump(kind);
    }

    /// Fold a watch event into the cache. `None` removes the object.
    pub fn apply_event(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
        object: Option<Bytes>,
    ) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = state.bump(kind);

        let key = CacheKey::Object {
            kind: kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        match object {
            Some(body) => {
                state.entries.insert(
                    key,
                    CachedResponse {
                        body,
                        content_type: Some("application/json".to_string()),
                        generation,
                        inserted: Instant::now(),
                    },
                );
            }
            None => {
                state.entries.remove(&key);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
