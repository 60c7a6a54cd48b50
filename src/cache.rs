//! The owning cache handle.
//!
//! A [`Cache`] ties together one root layer-stack identifier, the layer
//! provider, the muted-layer set, the layer-stack registry, and the host's
//! dependency index. Handles are cheap clones of shared state; identity is
//! the shared allocation, which is what the change processor keys its
//! per-cache batches on.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::deps::DependencyIndex;
use crate::layer::{Layer, LayerProvider, resolve_asset_path};
use crate::stack::{LayerStack, LayerStackContext, LayerStackIdentifier, LayerStackRegistry};

// =========================================================================
// Muted layers
// =========================================================================

/// The set of muted layer paths, in canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutedLayers {
    paths: BTreeSet<String>,
}

impl MutedLayers {
    /// The canonical form of a mute path: resolved against the anchoring
    /// layer's identifier when relative.
    pub fn canonical(anchor_identifier: &str, path: &str) -> String {
        resolve_asset_path(anchor_identifier, path)
    }

    /// Adds a canonical path; returns false if it was already muted.
    pub fn mute(&mut self, canonical: impl Into<String>) -> bool {
        self.paths.insert(canonical.into())
    }

    /// Removes a canonical path; returns false if it was not muted.
    pub fn unmute(&mut self, canonical: &str) -> bool {
        self.paths.remove(canonical)
    }

    /// True if the canonical path is muted.
    pub fn is_muted(&self, canonical: &str) -> bool {
        self.paths.contains(canonical)
    }

    /// The muted paths, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// True if nothing is muted.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

// =========================================================================
// Cache
// =========================================================================

struct CacheInner {
    root_identifier: LayerStackIdentifier,
    provider: Arc<dyn LayerProvider>,
    dependency_index: Arc<dyn DependencyIndex>,
    layer_stacks: LayerStackRegistry,
    muted: RwLock<MutedLayers>,
    usd_mode: bool,
    config: Config,
}

/// A shared handle to one composition cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Creates a cache for `root_identifier`.
    ///
    /// `usd_mode` declares that this cache never composes property indexes
    /// or legacy relocations and that its layers open without thread-unsafe
    /// side effects (which permits parallel sublayer prefetch).
    pub fn new(
        root_identifier: LayerStackIdentifier,
        provider: Arc<dyn LayerProvider>,
        dependency_index: Arc<dyn DependencyIndex>,
        usd_mode: bool,
        config: Config,
    ) -> Cache {
        Cache {
            inner: Arc::new(CacheInner {
                root_identifier,
                provider,
                dependency_index,
                layer_stacks: LayerStackRegistry::new(),
                muted: RwLock::new(MutedLayers::default()),
                usd_mode,
                config,
            }),
        }
    }

    /// The identifier of this cache's root layer stack.
    pub fn root_identifier(&self) -> &LayerStackIdentifier {
        &self.inner.root_identifier
    }

    /// The layer provider.
    pub fn provider(&self) -> &Arc<dyn LayerProvider> {
        &self.inner.provider
    }

    /// The host's dependency index.
    pub fn dependency_index(&self) -> &Arc<dyn DependencyIndex> {
        &self.inner.dependency_index
    }

    /// The registry of computed layer stacks.
    pub fn layer_stacks(&self) -> &LayerStackRegistry {
        &self.inner.layer_stacks
    }

    /// A snapshot of the muted-layer set.
    pub fn muted_layers(&self) -> MutedLayers {
        self.inner.muted.read().clone()
    }

    /// True for USD-mode caches.
    pub fn usd_mode(&self) -> bool {
        self.inner.usd_mode
    }

    /// The feature toggles this cache was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The canonical form of `path` and whether it is currently muted,
    /// anchored to the layer that refers to it.
    pub fn is_layer_muted(&self, anchor: &Layer, path: &str) -> (bool, String) {
        let canonical = MutedLayers::canonical(&anchor.identifier(), path);
        let muted = self.inner.muted.read().is_muted(&canonical);
        (muted, canonical)
    }

    /// Runs `f` with a layer-stack context snapshotting this cache's state.
    pub fn with_context<R>(&self, f: impl FnOnce(&LayerStackContext<'_>) -> R) -> R {
        let muted = self.inner.muted.read();
        let ctx = LayerStackContext {
            provider: &*self.inner.provider,
            muted: &muted,
            usd_mode: self.inner.usd_mode,
            config: &self.inner.config,
            cache_root: &self.inner.root_identifier,
        };
        f(&ctx)
    }

    /// The stack for `identifier`, computing it on first use.
    pub fn find_or_create_layer_stack(
        &self,
        identifier: &LayerStackIdentifier,
    ) -> Arc<RwLock<LayerStack>> {
        self.with_context(|ctx| self.inner.layer_stacks.find_or_create(identifier, ctx))
    }

    /// The cache's root layer stack, computing it on first use.
    pub fn compute_root_layer_stack(&self) -> Arc<RwLock<LayerStack>> {
        self.find_or_create_layer_stack(&self.inner.root_identifier)
    }

    /// Commits mute/unmute requests into the muted set. Called during apply,
    /// before layer stacks recompute.
    pub(crate) fn apply_muting(&self, to_mute: &[String], to_unmute: &[String]) {
        let mut muted = self.inner.muted.write();
        for path in to_mute {
            muted.mute(path.clone());
        }
        for path in to_unmute {
            muted.unmute(path);
        }
    }
}

impl PartialEq for Cache {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Cache {}

impl std::hash::Hash for Cache {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache(root=@{}@)",
            self.inner.root_identifier.root_layer.identifier()
        )
    }
}
