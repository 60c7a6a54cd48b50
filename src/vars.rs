//! Expression variables: composed name/value dictionaries with provenance.
//!
//! A layer stack's variables come from its own layers (session over root) and
//! may be overridden by another stack named as the override source. Change
//! detection compares provenance as well as values, so the composed result
//! remembers which identifier owns the effective dictionary.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::stack::LayerStackIdentifier;

// =========================================================================
// Source
// =========================================================================

/// Where a stack's composed variables come from: another layer stack, or the
/// owning cache's root stack (the default).
#[derive(Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct ExpressionVariablesSource {
    id: Option<Arc<LayerStackIdentifier>>,
}

impl ExpressionVariablesSource {
    /// The default source: the owning cache's root layer stack.
    pub fn cache_root() -> Self {
        ExpressionVariablesSource::default()
    }

    /// A source naming a specific layer stack. Normalized so that naming the
    /// cache root explicitly compares equal to the default.
    pub fn new(id: LayerStackIdentifier, cache_root: &LayerStackIdentifier) -> Self {
        if &id == cache_root {
            ExpressionVariablesSource::default()
        } else {
            ExpressionVariablesSource { id: Some(Arc::new(id)) }
        }
    }

    /// True if this is the default cache-root source.
    pub fn is_cache_root(&self) -> bool {
        self.id.is_none()
    }

    /// The identifier this source resolves to.
    pub fn resolve<'a>(&'a self, cache_root: &'a LayerStackIdentifier) -> &'a LayerStackIdentifier {
        self.id.as_deref().unwrap_or(cache_root)
    }
}

// =========================================================================
// Variables
// =========================================================================

/// A composed variable dictionary plus the source that owns it.
///
/// Equality is by value on both fields; stacks whose override chains resolve
/// identically share one allocation.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ExpressionVariables {
    source: ExpressionVariablesSource,
    variables: Map<String, Value>,
}

impl ExpressionVariables {
    /// Creates variables with explicit provenance.
    pub fn new(source: ExpressionVariablesSource, variables: Map<String, Value>) -> Self {
        ExpressionVariables { source, variables }
    }

    /// The provenance of the effective dictionary.
    pub fn source(&self) -> &ExpressionVariablesSource {
        &self.source
    }

    /// The composed name/value dictionary.
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// The names whose values differ between `self` and `other`, in sorted
    /// order. Includes names present on only one side.
    pub fn changed_names(&self, other: &ExpressionVariables) -> Vec<String> {
        let mut names: Vec<String> = self
            .variables
            .iter()
            .filter(|(k, v)| other.variables.get(*k) != Some(v))
            .map(|(k, _)| k.clone())
            .collect();
        names.extend(
            other
                .variables
                .keys()
                .filter(|k| !self.variables.contains_key(*k))
                .cloned(),
        );
        names.sort();
        names.dedup();
        names
    }
}

// =========================================================================
// Composer
// =========================================================================

/// Composes variables for layer-stack identifiers, memoizing per identifier.
///
/// The memo lives exactly as long as the composer, so a tree of stacks
/// sharing an override ancestor pays the recursive cost once per batch and
/// nothing persists across batches.
#[derive(Default)]
pub struct ExpressionVariableComposer {
    memo: FxHashMap<LayerStackIdentifier, Arc<ExpressionVariables>>,
}

impl ExpressionVariableComposer {
    /// Creates a composer with an empty memo.
    pub fn new() -> Self {
        ExpressionVariableComposer::default()
    }

    /// The composed variables for `id` within the cache rooted at
    /// `cache_root`.
    pub fn compute(
        &mut self,
        id: &LayerStackIdentifier,
        cache_root: &LayerStackIdentifier,
    ) -> Arc<ExpressionVariables> {
        if let Some(hit) = self.memo.get(id) {
            return Arc::clone(hit);
        }

        let intrinsic = intrinsic_variables(id);
        let override_id = id
            .expression_variables_override_source
            .resolve(cache_root)
            .clone();

        let result = if &override_id == id {
            // No distinct override source: intrinsic variables stand alone.
            Arc::new(ExpressionVariables::new(
                ExpressionVariablesSource::new(id.clone(), cache_root),
                intrinsic,
            ))
        } else {
            let overriding = self.compute(&override_id, cache_root);
            if intrinsic.is_empty() {
                // Nothing authored locally: share the override's result,
                // provenance included.
                Arc::clone(&overriding)
            } else {
                let mut composed = intrinsic;
                for (name, value) in overriding.variables() {
                    composed.insert(name.clone(), value.clone());
                }
                Arc::new(ExpressionVariables::new(
                    ExpressionVariablesSource::new(id.clone(), cache_root),
                    composed,
                ))
            }
        };
        self.memo.insert(id.clone(), Arc::clone(&result));
        result
    }
}

/// The variables authored directly in `id`'s own layers, session over root.
fn intrinsic_variables(id: &LayerStackIdentifier) -> Map<String, Value> {
    let mut composed = id.root_layer.expression_variables().unwrap_or_default();
    if let Some(session) = &id.session_layer {
        if let Some(session_vars) = session.expression_variables() {
            for (name, value) in session_vars {
                composed.insert(name, value);
            }
        }
    }
    composed
}

// =========================================================================
// String expressions
// =========================================================================

/// True if `text` contains a `${name}` variable reference.
pub fn is_variable_expression(text: &str) -> bool {
    text.contains("${")
}

/// The result of evaluating a string expression: the substituted text plus
/// every variable name the expression consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedExpression {
    /// The substituted text.
    pub value: String,
    /// Variable names read during evaluation, in reference order.
    pub used_variables: Vec<String>,
}

/// Substitutes `${name}` references in `text` from `variables`.
///
/// An undefined variable or a non-scalar value is an error described by the
/// returned message; the caller wraps it with layer context.
pub fn evaluate_string_expression(
    text: &str,
    variables: &Map<String, Value>,
) -> Result<EvaluatedExpression, String> {
    let mut value = String::with_capacity(text.len());
    let mut used_variables = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        value.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(format!("unterminated variable reference in '{text}'"));
        };
        let name = &after[..end];
        let Some(var) = variables.get(name) else {
            return Err(format!("undefined variable '{name}'"));
        };
        match var {
            Value::String(s) => value.push_str(s),
            Value::Number(n) => value.push_str(&n.to_string()),
            Value::Bool(b) => value.push_str(if *b { "true" } else { "false" }),
            _ => return Err(format!("variable '{name}' is not a scalar value")),
        }
        used_variables.push(name.to_owned());
        rest = &after[end + 1..];
    }
    value.push_str(rest);
    Ok(EvaluatedExpression { value, used_variables })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;
    use serde_json::json;

    fn vars(layer: &Layer, entries: &[(&str, Value)]) {
        let mut map = Map::new();
        for (k, v) in entries {
            map.insert((*k).to_owned(), v.clone());
        }
        layer.set_field(
            &crate::path::ScenePath::absolute_root(),
            crate::layer::fields::EXPRESSION_VARIABLES,
            Value::Object(map),
        );
    }

    #[test]
    fn test_override_wins_and_memo_shares() {
        let root = Layer::new("root.layer");
        vars(&root, &[("shot", json!("s01")), ("lod", json!("high"))]);
        let referenced = Layer::new("asset.layer");
        vars(&referenced, &[("lod", json!("low")), ("variant", json!("a"))]);

        let cache_root = LayerStackIdentifier::new(root, None);
        let asset_id = LayerStackIdentifier {
            root_layer: referenced,
            session_layer: None,
            expression_variables_override_source: ExpressionVariablesSource::cache_root(),
        };

        let mut composer = ExpressionVariableComposer::new();
        let composed = composer.compute(&asset_id, &cache_root);
        assert_eq!(composed.variables()["lod"], json!("high"));
        assert_eq!(composed.variables()["variant"], json!("a"));
        assert_eq!(composed.variables()["shot"], json!("s01"));

        let again = composer.compute(&asset_id, &cache_root);
        assert!(Arc::ptr_eq(&composed, &again));
    }

    #[test]
    fn test_sharing_when_nothing_authored_locally() {
        let root = Layer::new("root.layer");
        vars(&root, &[("shot", json!("s01"))]);
        let referenced = Layer::new("asset.layer");

        let cache_root = LayerStackIdentifier::new(root, None);
        let asset_id = LayerStackIdentifier {
            root_layer: referenced,
            session_layer: None,
            expression_variables_override_source: ExpressionVariablesSource::cache_root(),
        };

        let mut composer = ExpressionVariableComposer::new();
        let over = composer.compute(&cache_root, &cache_root);
        let composed = composer.compute(&asset_id, &cache_root);
        assert!(Arc::ptr_eq(&over, &composed));
        assert!(composed.source().is_cache_root());
    }

    #[test]
    fn test_session_over_root() {
        let root = Layer::new("root.layer");
        vars(&root, &[("lod", json!("high"))]);
        let session = Layer::new("session.layer");
        vars(&session, &[("lod", json!("proxy"))]);
        let id = LayerStackIdentifier::new(root, Some(session));
        let mut composer = ExpressionVariableComposer::new();
        let composed = composer.compute(&id, &id);
        assert_eq!(composed.variables()["lod"], json!("proxy"));
    }

    #[test]
    fn test_string_expression() {
        let mut map = Map::new();
        map.insert("shot".to_owned(), json!("s01"));
        map.insert("lod".to_owned(), json!(2));
        let out = evaluate_string_expression("shots/${shot}/geo_${lod}.layer", &map).unwrap();
        assert_eq!(out.value, "shots/s01/geo_2.layer");
        assert_eq!(out.used_variables, vec!["shot", "lod"]);
        assert!(evaluate_string_expression("${missing}", &map).is_err());
        assert!(evaluate_string_expression("${shot", &map).is_err());
    }

    #[test]
    fn test_changed_names() {
        let mut a = Map::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = Map::new();
        b.insert("x".into(), json!(1));
        b.insert("z".into(), json!(3));
        let va = ExpressionVariables::new(ExpressionVariablesSource::cache_root(), a);
        let vb = ExpressionVariables::new(ExpressionVariablesSource::cache_root(), b);
        assert_eq!(va.changed_names(&vb), vec!["y", "z"]);
    }
}
