//! On-disk catalog format (YAML, or JSON for `.json` files).

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::{AgentDefinition, EnvironmentId, ScheduleEntry, StaticCatalog};
use crate::mcp::ToolServerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub environments: Vec<EnvironmentFile>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentFile {
    pub id: EnvironmentId,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl CatalogFile {
    pub fn parse(contents: &str, json: bool) -> anyhow::Result<Self> {
        if json {
            serde_json::from_str(contents).context("Failed to parse catalog JSON")
        } else {
            serde_yaml::from_str(contents).context("Failed to parse catalog YAML")
        }
    }

    pub fn into_catalog(self) -> anyhow::Result<StaticCatalog> {
        let mut catalog = StaticCatalog::new();
        for env in self.environments {
            let mut seen = std::collections::HashSet::new();
            for server in &env.tool_servers {
                if !seen.insert(server.name.clone()) {
                    anyhow::bail!(
                        "environment '{}' declares tool server '{}' twice",
                        env.id,
                        server.name
                    );
                }
            }
            for (name, value) in env.variables {
                catalog = catalog.with_variable(env.id.clone(), name, value);
            }
            for server in env.tool_servers {
                catalog = catalog.with_tool_server(env.id.clone(), server);
            }
            for mut agent in env.agents {
                agent.environment = env.id.clone();
                catalog = catalog.with_agent(agent);
            }
        }
        for schedule in self.schedules {
            catalog = catalog.with_schedule(schedule);
        }
        Ok(catalog)
    }
}

impl StaticCatalog {
    /// Load a catalog file from disk.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        CatalogFile::parse(&contents, json)?.into_catalog()
    }
}
