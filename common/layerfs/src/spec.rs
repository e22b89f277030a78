//! The layer-spec query language: `<reference><relops>`, e.g. `root^2~3` or
//! `my-tag@1`.

use crate::{error::LayerFsError, layer::Layer};

/// A single relation operator parsed out of a layer-spec's relops tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    /// `^d` — the d-th direct child (1-based).
    NthChild(u32),
    /// `~d` — descend d times, always taking the first child.
    FirstDescendant(u32),
    /// `@d` — ascend d parents.
    Ancestor(u32),
}

/// Splits a layer-spec into its reference prefix and the raw relops tail.
///
/// The reference is everything up to the first relop character (`^`, `~`,
/// `@`); the tail is parsed separately by [`parse_relops`].
pub fn split_reference(spec: &str) -> (&str, &str) {
    let split_at = spec
        .find(['^', '~', '@'])
        .unwrap_or(spec.len());
    spec.split_at(split_at)
}

/// Hand-rolled scanner over the relops grammar: a concatenation of
/// `(^|~|@) [0-9]+?` tokens, byte by byte. Deliberately not a regex or parser
/// combinator -- the grammar is small enough that a scanner is clearer.
pub fn parse_relops(tail: &str) -> Result<Vec<RelOp>, LayerFsError> {
    let bytes = tail.as_bytes();
    let mut ops = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let op_char = bytes[i] as char;
        i += 1;

        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let depth: u32 = if digits_start == i {
            1
        } else {
            tail[digits_start..i].parse().map_err(|_| invalid(tail))?
        };
        if depth == 0 {
            return Err(invalid(tail));
        }

        let op = match op_char {
            '^' => RelOp::NthChild(depth),
            '~' => RelOp::FirstDescendant(depth),
            '@' => RelOp::Ancestor(depth),
            _ => return Err(invalid(tail)),
        };
        ops.push(op);
    }

    Ok(ops)
}

fn invalid(spec: &str) -> LayerFsError {
    LayerFsError::InvalidSpec {
        spec: spec.to_string(),
        reason: "expected a concatenation of ^N, ~N, @N tokens".to_string(),
    }
}

/// Resolves a layer-spec against a receiver layer (used when the reference
/// is empty, meaning "this layer").
pub fn find_layer(spec: &str, receiver: &Layer) -> Result<Layer, LayerFsError> {
    let (reference, tail) = split_reference(spec);
    let relops = parse_relops(tail).map_err(|_| LayerFsError::InvalidSpec {
        spec: spec.to_string(),
        reason: "expected a concatenation of ^N, ~N, @N tokens".to_string(),
    })?;

    let mut current = resolve_reference(reference, receiver)?;
    for op in relops {
        current = apply_relop(&current, op)?;
    }
    Ok(current)
}

fn resolve_reference(reference: &str, receiver: &Layer) -> Result<Layer, LayerFsError> {
    if reference.is_empty() {
        return Ok(receiver.clone());
    }
    let root = receiver.root()?;
    if reference == "root" {
        return Ok(root);
    }

    if root.layer_id() == reference || root.tags()?.contains(reference) {
        return Ok(root);
    }
    for layer in root.descendants()? {
        if layer.layer_id() == reference || layer.tags()?.contains(reference) {
            return Ok(layer);
        }
    }

    Err(LayerFsError::LayerNotFound(reference.to_string()))
}

fn apply_relop(layer: &Layer, op: RelOp) -> Result<Layer, LayerFsError> {
    match op {
        RelOp::NthChild(d) => {
            let children = layer.children()?;
            children
                .into_iter()
                .nth(d as usize - 1)
                .ok_or_else(|| LayerFsError::LayerNotFound(format!("^{d} from {}", layer.layer_id())))
        }
        RelOp::FirstDescendant(d) => {
            let mut current = layer.clone();
            for _ in 0..d {
                let first_child = current
                    .children()?
                    .into_iter()
                    .next()
                    .ok_or_else(|| LayerFsError::LayerNotFound(format!("~{d} from {}", layer.layer_id())))?;
                current = first_child;
            }
            Ok(current)
        }
        RelOp::Ancestor(d) => {
            let mut current = layer.clone();
            for _ in 0..d {
                current = current
                    .parent()?
                    .ok_or_else(|| LayerFsError::LayerNotFound(format!("@{d} from {}", layer.layer_id())))?;
            }
            Ok(current)
        }
    }
}
