pub mod ask;
pub mod serve;
pub mod tools;

use std::path::Path;

use anyhow::Context;
use toolbridge_config::AppConfig;

/// Load the deployment config, from `path` or the working directory.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    AppConfig::load(path).context("Failed to load config")
}
