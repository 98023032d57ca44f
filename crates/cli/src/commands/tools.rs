//! `toolbridge tools`: List the tools the registry offers.

use std::path::Path;

use anyhow::Context;
use toolbridge_core::tool::ToolRegistryClient;

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let backend = toolbridge_tools::build_from_config(&config);
    let endpoint = backend.endpoint().to_string();

    let mut registry = ToolRegistryClient::new(backend);
    let tools = registry
        .discover()
        .await
        .with_context(|| format!("Tool discovery failed for {endpoint}"))?;

    if tools.is_empty() {
        println!("No tools available from {endpoint}");
        return Ok(());
    }

    println!("{} tool(s) from {endpoint}:", tools.len());
    for tool in tools {
        println!();
        println!("  {}", tool.name);
        if !tool.description.is_empty() {
            println!("    {}", tool.description);
        }
        let schema = serde_json::to_string(&tool.input_schema)?;
        println!("    input: {schema}");
    }
    Ok(())
}
