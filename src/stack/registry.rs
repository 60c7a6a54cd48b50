//! The registry owning every computed layer stack for one cache.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::stack::{LayerStack, LayerStackContext, LayerStackIdentifier};
use crate::layer::Layer;

/// Shared ownership of layer stacks keyed by identifier.
///
/// Stacks are created on first use and dropped when the identifier is
/// released. Interior locks follow a fixed order: the registry map lock is
/// never held while a stack's own lock is taken.
#[derive(Default)]
pub struct LayerStackRegistry {
    stacks: RwLock<FxHashMap<LayerStackIdentifier, Arc<RwLock<LayerStack>>>>,
}

impl LayerStackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        LayerStackRegistry::default()
    }

    /// The stack for `identifier`, if already computed.
    pub fn find(&self, identifier: &LayerStackIdentifier) -> Option<Arc<RwLock<LayerStack>>> {
        self.stacks.read().get(identifier).cloned()
    }

    /// The stack for `identifier`, computing it on first use.
    pub fn find_or_create(
        &self,
        identifier: &LayerStackIdentifier,
        ctx: &LayerStackContext<'_>,
    ) -> Arc<RwLock<LayerStack>> {
        if let Some(existing) = self.find(identifier) {
            return existing;
        }
        let stack = Arc::new(RwLock::new(LayerStack::compute(identifier.clone(), ctx)));
        let mut stacks = self.stacks.write();
        Arc::clone(stacks.entry(identifier.clone()).or_insert(stack))
    }

    /// Releases the stack for `identifier`, returning it so a lifeboat can
    /// keep it alive through a transition.
    pub fn remove(&self, identifier: &LayerStackIdentifier) -> Option<Arc<RwLock<LayerStack>>> {
        self.stacks.write().remove(identifier)
    }

    /// Every computed stack, with its identifier.
    pub fn all(&self) -> Vec<(LayerStackIdentifier, Arc<RwLock<LayerStack>>)> {
        self.stacks
            .read()
            .iter()
            .map(|(id, stack)| (id.clone(), Arc::clone(stack)))
            .collect()
    }

    /// Every stack that composes `layer` anywhere in its layer list.
    pub fn stacks_using_layer(
        &self,
        layer: &Layer,
    ) -> Vec<(LayerStackIdentifier, Arc<RwLock<LayerStack>>)> {
        self.all()
            .into_iter()
            .filter(|(_, stack)| stack.read().has_layer(layer))
            .collect()
    }

    /// Every stack that recorded `canonical_path` as muted.
    pub fn stacks_using_muted_layer(
        &self,
        canonical_path: &str,
    ) -> Vec<(LayerStackIdentifier, Arc<RwLock<LayerStack>>)> {
        self.all()
            .into_iter()
            .filter(|(_, stack)| stack.read().muted_layers().contains(canonical_path))
            .collect()
    }

    /// Every stack whose sublayer expressions consumed the named variable.
    pub fn stacks_using_expression_variable(
        &self,
        name: &str,
    ) -> Vec<(LayerStackIdentifier, Arc<RwLock<LayerStack>>)> {
        self.all()
            .into_iter()
            .filter(|(_, stack)| stack.read().used_expression_variables().contains(name))
            .collect()
    }
}
