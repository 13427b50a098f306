use std::collections::BTreeMap;
use std::path::Path;

use eyre::WrapErr;
use serde_yaml::Value;

use crate::Result;
use crate::error::Error;
use crate::params::ParamStore;

pub const DEFAULT_CONFIG_FILE: &str = "DynaMake.yaml";

/// Load one configuration file into the store as a new layer.
///
/// The file is a mapping of parameter names to values. A key suffixed with
/// `?` names a parameter that may not be defined in this invocation; unknown
/// `?` keys are ignored, unknown plain keys are an error.
pub fn load_file(store: &mut ParamStore, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
    let parsed: BTreeMap<String, Value> = serde_yaml::from_str(&raw)
        .wrap_err_with(|| format!("failed to parse config file: {}", path.display()))?;

    let mut layer = BTreeMap::new();
    for (key, value) in parsed {
        let (name, lenient) = match key.strip_suffix('?') {
            Some(name) => (name.to_string(), true),
            None => (key, false),
        };
        if !store.is_defined(&name) {
            if lenient {
                debug!("{}: ignoring unknown parameter `{name}?`", path.display());
                continue;
            }
            return Err(Error::UnknownParameter(name))
                .wrap_err_with(|| format!("in config file: {}", path.display()));
        }
        layer.insert(name, value);
    }
    store.push_file_layer(layer);
    Ok(())
}

/// Load the project config file from `root` if one is present.
pub fn load_project_file(store: &mut ParamStore, root: &Path) -> Result<()> {
    let path = root.join(DEFAULT_CONFIG_FILE);
    if path.exists() {
        load_file(store, &path)?;
    } else {
        debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
    }
    Ok(())
}
