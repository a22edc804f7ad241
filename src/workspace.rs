//! Workspace Locator (§4.C): resolves a `task_id` to its workspace
//! directory, including across sibling projects, by consulting multiple
//! registries before giving up.
//!
//! Grounded on the teacher's `workspace.rs` (directory-per-task layout,
//! `WORKSPACE_DIR`-style base resolution) generalized from "create one
//! workspace for the task currently being built" to "locate an existing
//! task's workspace from anywhere on disk".

use crate::error::{Result, SpiralError};
use crate::registry::global::{self, GlobalRegistryStore};
use std::path::{Path, PathBuf};

const MAX_UPWARD_LEVELS: usize = 5;

#[derive(Debug, Clone)]
pub struct WorkspaceLocatorConfig {
    /// Default workspace base (`WORKSPACE_BASE`, placeholders resolved).
    pub default_base: PathBuf,
    /// Additional project bases whose global registries should also be
    /// consulted (e.g. sibling project roots the operator configured).
    pub extra_bases: Vec<PathBuf>,
}

impl WorkspaceLocatorConfig {
    pub fn new(default_base: PathBuf) -> Self {
        Self {
            default_base,
            extra_bases: vec![],
        }
    }

    /// Resolves `{workspaceFolder}` (and other `{...}` placeholders) in a
    /// configured path to the current working directory.
    pub fn resolve_placeholders(path: &str, cwd: &Path) -> PathBuf {
        let resolved = path.replace("{workspaceFolder}", &cwd.display().to_string());
        PathBuf::from(resolved)
    }
}

pub struct WorkspaceLocator {
    config: WorkspaceLocatorConfig,
}

impl WorkspaceLocator {
    pub fn new(config: WorkspaceLocatorConfig) -> Self {
        Self { config }
    }

    pub fn workspace_for_new_task(&self, task_id: &str) -> PathBuf {
        self.config.default_base.join(task_id)
    }

    /// Implements the ordered lookup strategy from §4.C.
    pub fn locate(&self, task_id: &str) -> Result<PathBuf> {
        // 1. Check {default_workspace_base}/{task_id}.
        let direct = self.config.default_base.join(task_id);
        if direct.join("AGENT_REGISTRY.json").exists() {
            return Ok(direct);
        }

        // 2. Consult every candidate global registry.
        let mut bases = vec![self.config.default_base.clone()];
        bases.extend(self.config.extra_bases.iter().cloned());
        for base in &bases {
            if let Ok(store) = global::open(base) {
                if let Ok(doc) = store.read_snapshot() {
                    if let Some(entry) = doc.tasks.get(task_id) {
                        let path = PathBuf::from(&entry.workspace);
                        if path.join("AGENT_REGISTRY.json").exists() {
                            return Ok(path);
                        }
                    }
                }
            }
        }

        // 3. Walk upward from cwd up to five levels.
        if let Ok(cwd) = std::env::current_dir() {
            let mut dir = cwd.as_path();
            for _ in 0..=MAX_UPWARD_LEVELS {
                let candidate = dir.join(".agent-workspace").join(task_id);
                if candidate.join("AGENT_REGISTRY.json").exists() {
                    return Ok(candidate);
                }
                match dir.parent() {
                    Some(parent) => dir = parent,
                    None => break,
                }
            }
        }

        // 4. Fail.
        Err(SpiralError::TaskNotFound {
            task_id: task_id.to_string(),
        })
    }

    /// Opens (creating if needed) the default global registry for this
    /// locator's base, for use by callers recording new tasks.
    pub fn default_global_registry(&self) -> Result<GlobalRegistryStore> {
        global::open(&self.config.default_base)
    }
}
