use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// One test class handed to the server at startup. Discovery itself is the
/// caller's business; the server only consumes this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredClass {
    pub module: String,
    pub class: String,
    pub methods: Vec<String>,
}

impl DiscoveredClass {
    /// Canonical `"<module> <Class>"` dispatch key.
    pub fn class_path(&self) -> String {
        format!("{} {}", self.module, self.class)
    }
}

/// Load a discovery manifest: a JSON array of discovered classes.
pub fn load_manifest<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<DiscoveredClass>> {
    let raw = fs::read_to_string(path.as_ref())
        .with_context(|| format!("reading test manifest {}", path.as_ref().display()))?;
    let classes: Vec<DiscoveredClass> =
        serde_json::from_str(&raw).context("parsing test manifest")?;
    Ok(classes)
}
