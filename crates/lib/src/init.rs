//! Initialize the configuration directory: create ~/.concierge, a default config, the knowledge
//! corpus and the stub adapter fixtures.
//!
//! Layout mirrors `crates/lib/config/`: `config/knowledge/` → `~/.concierge/knowledge/`,
//! `config/fixtures/` → `~/.concierge/fixtures/`.

use anyhow::{Context, Result};
use include_dir::Dir;
use std::path::{Path, PathBuf};

use crate::adapters::BUNDLED_FIXTURES;
use crate::config;
use crate::knowledge::BUNDLED_KNOWLEDGE;

/// Ensure the configuration directory has been initialized (config file and knowledge directory exist).
pub fn require_initialized(config_path: &Path, config: &config::Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `concierge init` first (config file not found: {})",
            config_path.display()
        );
    }
    let knowledge_dir = config::resolve_knowledge_dir(config, config_path);
    if !knowledge_dir.exists() {
        anyhow::bail!(
            "configuration not initialized; run `concierge init` first (knowledge directory not found: {})",
            knowledge_dir.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Writes `config.json` with `{}` if missing.
/// - Extracts the bundled knowledge corpus into `knowledge` if it does not exist.
/// - Extracts the bundled stub fixtures into `fixtures` if it does not exist.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    extract_once(&BUNDLED_KNOWLEDGE, &config_dir.join("knowledge"), "knowledge corpus")?;
    extract_once(&BUNDLED_FIXTURES, &config_dir.join("fixtures"), "adapter fixtures")?;

    Ok(config_dir.to_path_buf())
}

fn extract_once(bundle: &Dir<'_>, target: &Path, what: &str) -> Result<()> {
    if target.exists() {
        log::debug!("{} already present at {}, skipping", what, target.display());
        return Ok(());
    }
    std::fs::create_dir_all(target)
        .with_context(|| format!("creating {} directory {}", what, target.display()))?;
    if let Err(e) = bundle.extract(target) {
        anyhow::bail!("extracting bundled {} to {}: {}", what, target.display(), e);
    }
    log::info!("extracted bundled {} to {}", what, target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("concierge-init-{}-{}", name, uuid::Uuid::new_v4()));
        dir.join("config.json")
    }

    #[test]
    fn init_creates_config_knowledge_and_fixtures() {
        let path = temp_config_path("fresh");
        let (config, _) = config::load_config(Some(path.clone())).unwrap();
        assert!(require_initialized(&path, &config).is_err());

        let dir = init_config_dir(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(dir.join("knowledge").join("catalog.json").exists());
        assert!(dir.join("knowledge").join("errors").join("E5678.md").exists());
        assert!(dir.join("fixtures").join("orders.json").exists());
        require_initialized(&path, &config).unwrap();

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn init_keeps_an_existing_config() {
        let path = temp_config_path("existing");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"gateway":{"port":9000}}"#).unwrap();
        let dir = init_config_dir(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("9000"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
