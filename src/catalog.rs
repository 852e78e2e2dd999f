//! Model catalog: size estimates, fallback chains, and OOM detection.
//!
//! Size estimates come from a glob-keyed table (config overrides first, then
//! a built-in table keyed on parameter-count substrings). They are estimates
//! of quantized weights plus working set, good enough for feasibility checks;
//! an unknown model is never excluded by a fit check.

use std::sync::Arc;

use anyhow::Context;
use regex::Regex;

use crate::{
    config::{CatalogConfig, NodeClass},
    registry::Node,
};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Built-in size table. First match wins, so more specific parameter counts
/// come first.
const BUILTIN_SIZES: &[(&str, u64)] = &[
    ("*405b*", 230 * GIB),
    ("*180b*", 101 * GIB),
    ("*72b*", 41 * GIB),
    ("*70b*", 40 * GIB),
    ("*65b*", 37 * GIB),
    ("*34b*", 20 * GIB),
    ("*33b*", 19 * GIB),
    ("*32b*", 19 * GIB),
    ("*30b*", 18 * GIB),
    ("*27b*", 16 * GIB),
    ("*22b*", 13 * GIB),
    ("*14b*", 9 * GIB),
    ("*13b*", 8 * GIB),
    ("*12b*", 7 * GIB),
    ("*11b*", 7 * GIB),
    ("*9b*", 6 * GIB),
    ("*8b*", 5 * GIB),
    ("*7b*", 4 * GIB + 512 * MIB),
    ("*4b*", 3 * GIB),
    ("*3b*", 2 * GIB),
    ("*2b*", GIB + 512 * MIB),
    ("*1.5b*", GIB),
    ("*1b*", 900 * MIB),
    ("*0.5b*", 500 * MIB),
    ("*mini*", 2 * GIB + 512 * MIB),
];

/// Patterns that mark a backend error as an out-of-memory condition.
const BUILTIN_OOM_PATTERNS: &[&str] = &[
    "out of memory",
    "oom",
    "cannot allocate",
    "resource exhausted",
    "killed",
    "terminated",
    r"signal:\s*killed",
];

/// Compiled OOM detector, shared with the backend client so it can classify
/// error bodies at the transport layer.
pub struct OomMatcher {
    patterns: Vec<Regex>,
}

impl OomMatcher {
    fn compile(extra: &[String]) -> anyhow::Result<Self> {
        let mut patterns = Vec::with_capacity(BUILTIN_OOM_PATTERNS.len() + extra.len());
        for p in BUILTIN_OOM_PATTERNS.iter().copied().chain(extra.iter().map(String::as_str)) {
            let re = Regex::new(&format!("(?i){p}"))
                .with_context(|| format!("bad OOM pattern `{p}`"))?;
            patterns.push(re);
        }
        Ok(Self { patterns })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }
}

struct SizeEntry {
    pattern: Regex,
    bytes: u64,
}

struct Chain {
    task: String,
    models: Vec<String>,
}

/// Immutable model knowledge: sizes, fallback chains, OOM patterns.
pub struct ModelCatalog {
    sizes: Vec<SizeEntry>,
    chains: Vec<Chain>,
    oom: Arc<OomMatcher>,
    safety_margin_bytes: u64,
}

impl ModelCatalog {
    pub fn new(cfg: &CatalogConfig) -> anyhow::Result<Self> {
        // Config overrides are consulted before the built-in table.
        let mut sizes = Vec::new();
        for (glob, bytes) in &cfg.model_sizes {
            sizes.push(SizeEntry {
                pattern: glob_regex(glob)?,
                bytes: *bytes,
            });
        }
        for (glob, bytes) in BUILTIN_SIZES {
            sizes.push(SizeEntry {
                pattern: glob_regex(glob)?,
                bytes: *bytes,
            });
        }

        let chains: Vec<Chain> = cfg
            .chains
            .iter()
            .map(|c| Chain {
                task: c.task.clone(),
                models: c.models.clone(),
            })
            .collect();

        let catalog = Self {
            sizes,
            chains,
            oom: Arc::new(OomMatcher::compile(&cfg.oom_patterns)?),
            safety_margin_bytes: cfg.safety_margin_bytes,
        };

        // Chains must walk from most to least demanding.
        for chain in &catalog.chains {
            let mut last: Option<u64> = None;
            for model in &chain.models {
                if let Some(size) = catalog.approx_size(model) {
                    if let Some(prev) = last {
                        anyhow::ensure!(
                            size <= prev,
                            "chain for task `{}` is not ordered by decreasing size: \
                             `{model}` ({size} bytes) exceeds its predecessor ({prev} bytes)",
                            chain.task
                        );
                    }
                    last = Some(size);
                }
            }
        }

        Ok(catalog)
    }

    /// Estimated resident size of a model, or `None` when nothing matches.
    pub fn approx_size(&self, model: &str) -> Option<u64> {
        self.sizes
            .iter()
            .find(|e| e.pattern.is_match(model))
            .map(|e| e.bytes)
    }

    /// Whether `model` plausibly fits on `node` right now.
    ///
    /// A model that is already resident always fits. Unknown model sizes and
    /// unknown node memory never exclude a node; the check only filters when
    /// it has real numbers on both sides. GPU nodes are checked against free
    /// VRAM, everything else against free RAM, with a configured slack to
    /// tolerate stale readings.
    pub fn fits(&self, model: &str, node: &Node) -> bool {
        if node.loaded_models.iter().any(|m| m.name == model) {
            return true;
        }
        let Some(size) = self.approx_size(model) else {
            return true;
        };
        let (total, free) = match node.class {
            NodeClass::Gpu => (node.vram_total_bytes, node.vram_free_bytes),
            NodeClass::Cpu | NodeClass::Unknown => (node.ram_total_bytes, node.ram_free_bytes),
        };
        if total == 0 {
            return true;
        }
        size <= free.saturating_add(self.safety_margin_bytes)
    }

    /// The next smaller model after `model` in the chain for `task_kind`.
    pub fn fallback_after(&self, model: &str, task_kind: &str) -> Option<&str> {
        let chain = self
            .chains
            .iter()
            .find(|c| c.task == task_kind && c.models.iter().any(|m| m == model))?;
        let idx = chain.models.iter().position(|m| m == model)?;
        chain.models.get(idx + 1).map(String::as_str)
    }

    pub fn looks_like_oom(&self, error_text: &str) -> bool {
        self.oom.matches(error_text)
    }

    /// Shared handle for the backend client.
    pub fn oom_matcher(&self) -> Arc<OomMatcher> {
        Arc::clone(&self.oom)
    }
}

/// Compile a case-insensitive glob (only `*` is special) to an anchored regex.
fn glob_regex(glob: &str) -> anyhow::Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?i)^");
    for (i, segment) in glob.split('*').enumerate() {
        if i > 0 {
            pattern.push_str(".*");
        }
        pattern.push_str(&regex::escape(segment));
    }
    pattern.push('$');
    Regex::new(&pattern).with_context(|| format!("bad size glob `{glob}`"))
}
