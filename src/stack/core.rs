//! Shared slice-table state composed into every stack type.
//!
//! `StackCore` owns the per-slice bookkeeping (memoized properties, resident
//! cached payloads), the LRU index cache and the homogeneity tracking. Stack
//! types compose it rather than inheriting from a base class.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::dtype::ElementType;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::source::SliceProps;

/// Lazily tracked uniformity of one metadata axis across all slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tracked<T> {
    /// Not currently known; recomputed from slice metadata on next query.
    Unknown,
    /// Every slice shares this value.
    Uniform(T),
    /// At least two slices disagree.
    Mixed,
}

/// Per-slice state owned by the stack.
#[derive(Default)]
pub(crate) struct SliceState {
    /// Memoized shape/element type, if known.
    pub props: Option<SliceProps>,
    /// Resident cached payload; only populated while caching is enabled.
    /// Payloads are immutable snapshots behind `Arc`.
    pub resident: Option<Arc<Image>>,
}

impl SliceState {
    pub fn with_props(props: SliceProps) -> SliceState {
        SliceState {
            props: Some(props),
            resident: None,
        }
    }
}

/// Slice table, LRU cache and homogeneity flags.
pub struct StackCore {
    slices: Vec<SliceState>,
    /// `None` while caching is disabled.
    cache: Option<LruCache<usize, ()>>,
    /// 0 = disabled, -1 = unbounded, N > 0 = bounded.
    cache_size: isize,
    pub(crate) shape: Tracked<(usize, usize)>,
    pub(crate) element_type: Tracked<ElementType>,
}

impl StackCore {
    pub(crate) fn new(slices: Vec<SliceState>) -> StackCore {
        StackCore {
            slices,
            cache: None,
            cache_size: 0,
            shape: Tracked::Unknown,
            element_type: Tracked::Unknown,
        }
    }

    pub(crate) fn with_len(d: usize) -> StackCore {
        StackCore::new((0..d).map(|_| SliceState::default()).collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.slices.len()
    }

    pub(crate) fn props(&self, z: usize) -> Option<SliceProps> {
        self.slices[z].props
    }

    pub(crate) fn set_props(&mut self, z: usize, props: SliceProps) {
        self.slices[z].props = Some(props);
    }

    // ---- cache protocol ----

    pub(crate) fn cache_size(&self) -> isize {
        self.cache_size
    }

    /// Change the cache bound. 0 disables caching and drops every resident
    /// payload; -1 removes the bound; shrinking a bounded cache evicts
    /// least-recently-used entries first; growing never evicts.
    pub(crate) fn set_cache_size(&mut self, size: isize) -> Result<()> {
        if size < -1 {
            return Err(Error::validation(format!("invalid cache size {size}")));
        }
        if size == self.cache_size {
            return Ok(());
        }
        match size {
            0 => {
                self.cache = None;
                for s in &mut self.slices {
                    s.resident = None;
                }
            }
            -1 => {
                let mut fresh = LruCache::unbounded();
                self.move_entries(&mut fresh);
                self.cache = Some(fresh);
            }
            n => {
                let cap = NonZeroUsize::new(n as usize).expect("n > 0 here");
                if let Some(cache) = &mut self.cache {
                    // evict before resizing so the payloads get dropped too
                    while cache.len() > n as usize {
                        if let Some((old, ())) = cache.pop_lru() {
                            self.slices[old].resident = None;
                        }
                    }
                    cache.resize(cap);
                } else {
                    self.cache = Some(LruCache::new(cap));
                }
            }
        }
        self.cache_size = size;
        Ok(())
    }

    /// Record an access to index `z`. Returns `true` when the index was
    /// already cached (it is promoted to most recently used); otherwise the
    /// index is inserted, evicting the least-recently-used entry when full.
    pub(crate) fn touch(&mut self, z: usize) -> bool {
        let Some(cache) = &mut self.cache else {
            return false;
        };
        if cache.contains(&z) {
            cache.promote(&z);
            return true;
        }
        if let Some((old, ())) = cache.push(z, ()) {
            if old != z {
                self.slices[old].resident = None;
            }
        }
        false
    }

    pub(crate) fn resident(&self, z: usize) -> Option<Arc<Image>> {
        self.slices[z].resident.clone()
    }

    pub(crate) fn store(&mut self, z: usize, im: Arc<Image>) {
        if self.cache.is_some() {
            self.slices[z].resident = Some(im);
        }
    }

    /// Number of resident cached payloads.
    pub fn resident_count(&self) -> usize {
        self.slices.iter().filter(|s| s.resident.is_some()).count()
    }

    /// Rebuild the cache with indices remapped through `f`; entries mapped to
    /// `None` are dropped. Recency order is preserved.
    fn remap_cache(&mut self, f: impl Fn(usize) -> Option<usize>) {
        let Some(cache) = &mut self.cache else {
            return;
        };
        let keys: Vec<usize> = cache.iter().map(|(k, ())| *k).collect(); // MRU first
        let mut fresh = match NonZeroUsize::new(cache.cap().get()) {
            Some(cap) if self.cache_size > 0 => LruCache::new(cap),
            _ => LruCache::unbounded(),
        };
        for k in keys.into_iter().rev() {
            if let Some(nk) = f(k) {
                fresh.push(nk, ());
            }
        }
        self.cache = Some(fresh);
    }

    fn move_entries(&mut self, target: &mut LruCache<usize, ()>) {
        if let Some(cache) = &mut self.cache {
            let keys: Vec<usize> = cache.iter().map(|(k, ())| *k).collect();
            for k in keys.into_iter().rev() {
                target.push(k, ());
            }
        }
    }

    // ---- mutation bookkeeping ----

    /// Record that slice `z` now holds an image with the given properties:
    /// memoize them and downgrade any known-uniform homogeneity axis that the
    /// new value contradicts. Never rescans eagerly.
    pub(crate) fn note_write(&mut self, z: usize, props: SliceProps) {
        if let Tracked::Uniform(shape) = self.shape {
            if shape != props.shape {
                self.shape = Tracked::Mixed;
            }
        }
        if let Tracked::Uniform(et) = self.element_type {
            if !et.congruent(&props.element_type) {
                self.element_type = Tracked::Mixed;
            }
        }
        self.set_props(z, props);
    }

    /// Splice freshly inserted slice states in at `idx`, shifting cache keys
    /// above the insertion point.
    pub(crate) fn after_insert(&mut self, idx: usize, states: Vec<SliceState>) {
        let n = states.len();
        if n == 0 {
            return;
        }
        // inserted metadata may contradict a known-uniform axis
        for s in &states {
            match s.props {
                Some(p) => {
                    if let Tracked::Uniform(shape) = self.shape {
                        if shape != p.shape {
                            self.shape = Tracked::Mixed;
                        }
                    }
                    if let Tracked::Uniform(et) = self.element_type {
                        if !et.congruent(&p.element_type) {
                            self.element_type = Tracked::Mixed;
                        }
                    }
                }
                None => {
                    self.shape = Tracked::Unknown;
                    self.element_type = Tracked::Unknown;
                }
            }
        }
        self.slices.splice(idx..idx, states);
        self.remap_cache(|k| if k >= idx { Some(k + n) } else { Some(k) });
    }

    /// Remove slices `start..stop`, dropping their cache entries and shifting
    /// the keys above the range down. Homogeneity goes back to unknown: the
    /// stack may have *become* homogeneous through the deletion, so a stale
    /// `Mixed` cannot be kept either.
    pub(crate) fn after_delete(&mut self, start: usize, stop: usize) {
        let n = stop - start;
        self.slices.drain(start..stop);
        self.remap_cache(|k| {
            if k < start {
                Some(k)
            } else if k >= stop {
                Some(k - n)
            } else {
                None
            }
        });
        self.shape = Tracked::Unknown;
        self.element_type = Tracked::Unknown;
    }

    /// Resident indices ordered most-recently-used first (test hook).
    #[cfg(test)]
    pub(crate) fn cached_indices(&self) -> Vec<usize> {
        self.cache
            .as_ref()
            .map(|c| c.iter().map(|(k, ())| *k).collect())
            .unwrap_or_default()
    }
}
