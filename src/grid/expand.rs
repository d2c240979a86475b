//! Template walker: one recursive pass classifies every leaf, then the
//! Cartesian product over axes is instantiated against a stripped copy of
//! the template.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GridError;
use crate::grid::expr::{Candidates, DEFAULT_ZIP_GROUP, Leaf};

/// Keys with this prefix are dropped from every expanded set.
pub const META_PREFIX: &str = "_meta";

/// Most parameter sets one template may expand to.
pub const MAX_EXPANSION: usize = 1_000_000;

/// A fully concrete parameter mapping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(pub Map<String, Value>);

impl ParameterSet {
    /// Look up a dotted path such as `model.depth`.
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        let mut parts = dotted.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

#[derive(Debug)]
enum AxisKind {
    Product,
    Zip(String),
}

#[derive(Debug)]
struct Member {
    path: Vec<String>,
    values: Candidates,
}

#[derive(Debug)]
struct Axis {
    kind: AxisKind,
    members: Vec<Member>,
}

impl Axis {
    fn len(&self) -> usize {
        self.members.first().map(|m| m.values.len()).unwrap_or(0)
    }
}

/// Classified template: the stripped base mapping plus its axes in
/// declaration order.
#[derive(Debug)]
struct Plan {
    base: Map<String, Value>,
    axes: Vec<Axis>,
    total: usize,
}

impl Plan {
    fn build(template: &Value) -> Result<Self, GridError> {
        let Value::Object(root) = template else {
            return Err(GridError::NotAMapping);
        };

        let mut axes = Vec::new();
        let mut path = Vec::new();
        let base = walk(root, &mut path, &mut axes)?;

        for axis in &axes {
            if let AxisKind::Zip(group) = &axis.kind {
                let len = axis.len();
                if axis.members.iter().any(|m| m.values.len() != len) {
                    let detail = axis
                        .members
                        .iter()
                        .map(|m| format!("{}={}", m.path.join("."), m.values.len()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let group = if group == DEFAULT_ZIP_GROUP {
                        "(default)".to_string()
                    } else {
                        group.clone()
                    };
                    return Err(GridError::ZipLengthMismatch { group, detail });
                }
            }
        }

        let total = axes
            .iter()
            .try_fold(1usize, |acc, axis| acc.checked_mul(axis.len()))
            .filter(|&n| n <= MAX_EXPANSION)
            .ok_or(GridError::ExpansionTooLarge {
                limit: MAX_EXPANSION,
            })?;

        Ok(Self { base, axes, total })
    }

    /// Instantiate the combination at `index`; the last axis varies fastest.
    fn instantiate(&self, mut index: usize) -> ParameterSet {
        let mut choice = vec![0usize; self.axes.len()];
        for (slot, axis) in choice.iter_mut().zip(&self.axes).rev() {
            let len = axis.len();
            *slot = index % len;
            index /= len;
        }

        let mut map = self.base.clone();
        for (axis, &pick) in self.axes.iter().zip(&choice) {
            for member in &axis.members {
                set_path(&mut map, &member.path, member.values.get(pick));
            }
        }
        ParameterSet(map)
    }
}

fn walk(
    node: &Map<String, Value>,
    path: &mut Vec<String>,
    axes: &mut Vec<Axis>,
) -> Result<Map<String, Value>, GridError> {
    let mut out = Map::new();

    for (key, value) in node {
        if key.starts_with(META_PREFIX) {
            continue;
        }
        path.push(key.clone());

        match value {
            Value::Object(child) => {
                let stripped = walk(child, path, axes)?;
                out.insert(key.clone(), Value::Object(stripped));
            }
            leaf => {
                let dotted = path.join(".");
                match Leaf::classify(&dotted, leaf)? {
                    Leaf::Scalar(v) => {
                        out.insert(key.clone(), v);
                    }
                    Leaf::Product(values) => {
                        push_product(axes, path, values, &mut out, key);
                    }
                    Leaf::Zip { group, values } => {
                        out.insert(key.clone(), Value::Null);
                        let member = Member {
                            path: path.clone(),
                            values,
                        };
                        let existing = axes.iter_mut().find(
                            |a| matches!(&a.kind, AxisKind::Zip(g) if *g == group),
                        );
                        match existing {
                            Some(axis) => axis.members.push(member),
                            None => axes.push(Axis {
                                kind: AxisKind::Zip(group),
                                members: vec![member],
                            }),
                        }
                    }
                }
            }
        }

        path.pop();
    }

    Ok(out)
}

fn push_product(
    axes: &mut Vec<Axis>,
    path: &[String],
    values: Candidates,
    out: &mut Map<String, Value>,
    key: &str,
) {
    // Placeholder keeps the key in declaration position.
    out.insert(key.to_string(), Value::Null);
    axes.push(Axis {
        kind: AxisKind::Product,
        members: vec![Member {
            path: path.to_vec(),
            values,
        }],
    });
}

fn set_path(map: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = map;
    for part in parents {
        match current.get_mut(part).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return,
        }
    }
    current.insert(last.clone(), value);
}

/// Expand a template into every concrete parameter set, in a stable order.
pub fn expand(template: &Value) -> Result<Vec<ParameterSet>, GridError> {
    let plan = Plan::build(template)?;
    let total = plan.total;
    tracing::debug!(axes = plan.axes.len(), total, "Expanding parameter template");
    Ok((0..total).map(|i| plan.instantiate(i)).collect())
}

/// Number of sets `expand` would produce, from axis lengths alone; 0 for
/// malformed templates.
pub fn count(template: &Value) -> usize {
    match Plan::build(template) {
        Ok(plan) => plan.total,
        Err(e) => {
            tracing::debug!(error = %e, "Template preview count is 0");
            0
        }
    }
}

/// Collapse every expression to its first candidate.
pub fn first_values(template: &Value) -> Result<ParameterSet, GridError> {
    let plan = Plan::build(template)?;
    Ok(plan.instantiate(0))
}
