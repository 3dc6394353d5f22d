use std::error::Error;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MCP_ENDPOINT: &str = "https://mcp.granola.ai/mcp";
pub const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_COMPRESSION_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_mcp_endpoint")]
    pub mcp_endpoint: String,
    #[serde(default = "default_openai_api_url")]
    pub openai_api_url: String,
    #[serde(default = "default_compression_model")]
    pub compression_model: String,
}

fn default_mcp_endpoint() -> String {
    DEFAULT_MCP_ENDPOINT.to_string()
}

fn default_openai_api_url() -> String {
    DEFAULT_OPENAI_API_URL.to_string()
}

fn default_compression_model() -> String {
    DEFAULT_COMPRESSION_MODEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mcp_endpoint: default_mcp_endpoint(),
            openai_api_url: default_openai_api_url(),
            compression_model: default_compression_model(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn Error>> {
        let Some(path) = config_file_path() else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self) -> Result<(), Box<dyn Error>> {
        let Some(path) = config_file_path() else {
            return Err("could not determine a configuration directory".into());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "notula", "notula")
}

fn config_file_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("notula.toml"))
}

/// Location of the JSON key-value store backing credentials, the meetings
/// cache, memories, and context handoffs.
pub fn default_state_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("state.json"))
        .unwrap_or_else(|| PathBuf::from("notula-state.json"))
}
