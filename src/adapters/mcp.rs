use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::config::McpServer;
use crate::fsutil;

use super::Materializer;

pub const MCP_FILE: &str = ".mcp.json";

/// Writes the town's MCP servers into each worker home before its session starts.
#[derive(Debug, Clone)]
pub struct McpMaterializer {
    servers: BTreeMap<String, McpServer>,
}

#[derive(Serialize)]
struct McpFile<'a> {
    #[serde(rename = "mcpServers")]
    servers: &'a BTreeMap<String, McpServer>,
}

impl McpMaterializer {
    pub const fn new(servers: BTreeMap<String, McpServer>) -> Self {
        Self { servers }
    }
}

impl Materializer for McpMaterializer {
    fn materialize(&self, home: &Path, rig: &str, worker: &str) -> anyhow::Result<()> {
        if self.servers.is_empty() {
            return Ok(());
        }
        let path = home.join(MCP_FILE);
        fsutil::write_json_atomic(&path, &McpFile { servers: &self.servers })
            .with_context(|| format!("writing MCP config for {rig}/{worker}"))?;
        tracing::debug!(path = %path.display(), servers = self.servers.len(), "materialized MCP config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_servers_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let servers = BTreeMap::from([(
            "search".to_string(),
            McpServer {
                command: "search-mcp".into(),
                args: vec!["--stdio".into()],
                env: BTreeMap::new(),
            },
        )]);
        McpMaterializer::new(servers)
            .materialize(dir.path(), "gastown", "nux")
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(MCP_FILE)).unwrap())
                .unwrap();
        assert_eq!(written["mcpServers"]["search"]["command"], "search-mcp");
        assert_eq!(written["mcpServers"]["search"]["args"][0], "--stdio");
    }

    #[test]
    fn nothing_written_without_servers() {
        let dir = tempfile::tempdir().unwrap();
        McpMaterializer::new(BTreeMap::new())
            .materialize(dir.path(), "gastown", "nux")
            .unwrap();
        assert!(!dir.path().join(MCP_FILE).exists());
    }
}
