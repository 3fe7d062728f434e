//! Persisted agent identity (`agent-state.json`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::credentials::{write_atomic, STATE_MODE};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
}

impl AgentState {
    /// Load the state file. A missing file is an empty state.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &content, STATE_MODE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::load(&dir.path().join("agent-state.json")).unwrap();
        assert!(state.agent_id.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent-state.json");
        AgentState {
            agent_id: "0b7e".to_string(),
        }
        .save(&path)
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"agent_id\": \"0b7e\""));
        assert_eq!(AgentState::load(&path).unwrap().agent_id, "0b7e");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(AgentState::load(&path).is_err());
    }
}
