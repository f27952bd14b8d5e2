//! Minimal `{{expr}}` template substitution for step commands, working
//! directories and environment values.
//!
//! An expression is a dotted path (`job.id`, `deps.prepare`, `index`)
//! resolved against a JSON context assembled by the planner. Resolution
//! failures are submission-time errors; plan-time rendering of a validated
//! template cannot fail for the same context shape.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::Value;

use crate::error::{GridError, Result};

const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Vec<String>),
}

#[derive(Debug)]
struct Template {
    segments: Vec<Segment>,
}

/// Template compiler and renderer with a bounded compilation cache.
///
/// The cache is owned by this engine, not process-global; eviction is plain
/// LRU with a fixed entry capacity.
pub struct TemplateEngine {
    cache: Mutex<LruCache<String, Arc<Template>>>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Render `template` against `ctx`, substituting every `{{expr}}`.
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String> {
        let compiled = self.compile(template)?;
        let mut out = String::with_capacity(template.len());
        for segment in &compiled.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Expr(path) => out.push_str(&lookup(template, path, ctx)?),
            }
        }
        Ok(out)
    }

    /// Submission-time validation: the template must parse, and every
    /// expression's root must be one of the declared context variables.
    /// Data-dependent sub-paths (e.g. into a dependency's task map) are only
    /// resolvable at plan time and are not probed here.
    pub fn validate(&self, template: &str, roots: &[&str]) -> Result<()> {
        let compiled = self.compile(template)?;
        for segment in &compiled.segments {
            if let Segment::Expr(path) = segment {
                let root = path[0].as_str();
                if !roots.contains(&root) {
                    return Err(GridError::Template(format!(
                        "unknown variable \"{root}\" in \"{template}\""
                    )));
                }
            }
        }
        Ok(())
    }

    fn compile(&self, template: &str) -> Result<Arc<Template>> {
        if let Some(hit) = self.cache.lock().unwrap().get(template) {
            return Ok(hit.clone());
        }
        let compiled = Arc::new(parse(template)?);
        self.cache
            .lock()
            .unwrap()
            .put(template.to_string(), compiled.clone());
        Ok(compiled)
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

fn parse(template: &str) -> Result<Template> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let (literal, tail) = rest.split_at(start);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal.to_string()));
        }
        let tail = &tail[2..];
        let end = tail.find("}}").ok_or_else(|| {
            GridError::Template(format!("unclosed \"{{{{\" in \"{template}\""))
        })?;
        segments.push(Segment::Expr(parse_expr(template, &tail[..end])?));
        rest = &tail[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(Template { segments })
}

fn parse_expr(template: &str, raw: &str) -> Result<Vec<String>> {
    let path: Vec<String> = raw.trim().split('.').map(str::to_string).collect();
    let well_formed = !path.is_empty()
        && path.iter().all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if !well_formed {
        return Err(GridError::Template(format!(
            "malformed expression \"{raw}\" in \"{template}\""
        )));
    }
    Ok(path)
}

fn lookup(template: &str, path: &[String], ctx: &Value) -> Result<String> {
    let mut current = ctx;
    for seg in path {
        current = match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| {
            GridError::Template(format!(
                "unresolved expression \"{}\" in \"{template}\"",
                path.join(".")
            ))
        })?;
    }
    Ok(stringify(current))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
