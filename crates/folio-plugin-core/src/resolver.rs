//! Dependency resolution over a manifest.
//!
//! Everything here is a pure function of the manifest: no runtime state is
//! read or written, unknown ids resolve to empty results, and cycles never
//! cause a panic or an endless walk. A cyclic edge is dropped with a warning
//! and resolution carries on.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::Manifest;
use std::collections::HashSet;
use tracing::warn;

/// Transitive dependencies of `id`, deduplicated, dependencies first.
///
/// For `top -> mid -> base` this returns `["base", "mid"]`, which is also the
/// order in which they must be enabled.
pub fn get_dependencies(manifest: &Manifest, id: &str) -> Vec<String> {
    let id = id.trim();
    if id.is_empty() {
        return Vec::new();
    }

    let mut path = vec![id.to_string()];
    let mut resolved = Vec::new();
    collect_dependencies(manifest, id, &mut path, &mut resolved);
    resolved
}

fn collect_dependencies(
    manifest: &Manifest,
    id: &str,
    path: &mut Vec<String>,
    resolved: &mut Vec<String>,
) {
    let Some(descriptor) = manifest.get(id) else {
        return;
    };

    for dep in &descriptor.dependencies {
        if let Err(e) = check_edge(path, id, dep) {
            warn!(plugin = %id, dependency = %dep, "{}, dropping edge", e);
            continue;
        }
        if resolved.contains(dep) {
            continue;
        }

        path.push(dep.clone());
        collect_dependencies(manifest, dep, path, resolved);
        path.pop();

        if !resolved.contains(dep) {
            resolved.push(dep.clone());
        }
    }
}

/// The cycle policy: an edge `from -> to` is admissible unless `to` is already
/// on the branch currently being expanded.
pub fn check_edge(path: &[String], from: &str, to: &str) -> RuntimeResult<()> {
    if path.iter().any(|p| p == to) {
        let mut cycle: Vec<String> = path
            .iter()
            .skip_while(|p| p.as_str() != to)
            .cloned()
            .collect();
        if cycle.last().map(String::as_str) != Some(from) {
            cycle.push(from.to_string());
        }
        return Err(RuntimeError::DependencyCycle {
            id: to.to_string(),
            path: cycle,
        });
    }
    Ok(())
}

/// Ids whose manifest entry lists `id` as a direct dependency.
pub fn get_dependents(manifest: &Manifest, id: &str) -> Vec<String> {
    let id = id.trim();
    if id.is_empty() {
        return Vec::new();
    }

    manifest
        .iter()
        .filter(|p| p.dependencies.iter().any(|dep| dep == id))
        .map(|p| p.id.clone())
        .collect()
}

/// Order in which `enabled` plugins should be loaded: every dependency comes
/// before its dependents.
///
/// Dependencies that are missing from `enabled` are still inserted so the
/// order is complete; callers are expected to have enabled them already.
pub fn load_order(manifest: &Manifest, enabled: &[String]) -> Vec<String> {
    let mut processed = HashSet::new();
    let mut order = Vec::new();

    for id in enabled {
        visit(manifest, id, &mut processed, &mut order);
    }

    order
}

fn visit(
    manifest: &Manifest,
    id: &str,
    processed: &mut HashSet<String>,
    order: &mut Vec<String>,
) {
    if !processed.insert(id.to_string()) {
        return;
    }

    if let Some(descriptor) = manifest.get(id) {
        for dep in &descriptor.dependencies {
            visit(manifest, dep, processed, order);
        }
    }

    order.push(id.to_string());
}
