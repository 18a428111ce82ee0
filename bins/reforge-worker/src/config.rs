// Language configuration management for the repair worker
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use reforge_common::types::Language;
use tracing::debug;

const DEFAULT_CONFIG_PATH: &str = "config/languages.json";

/// How to build and run one language.
///
/// Commands run inside the candidate's working directory (a scratch
/// directory for the process engine, `/code` inside a container), so they
/// refer to `file_name` relatively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub file_name: String,
    #[serde(default)]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read languages.json")?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .context("Failed to parse languages.json")?;

        Ok(Self::from_configs(languages_json.languages))
    }

    /// Load `REFORGE_LANGUAGES` (default config/languages.json), or the
    /// built-in table when no file is present
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("REFORGE_LANGUAGES")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);

        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No languages.json found, using built-in language table");
            Ok(Self::builtin())
        }
    }

    pub fn from_configs(configs: Vec<LanguageConfig>) -> Self {
        let configs = configs
            .into_iter()
            .map(|lang| (lang.name.clone(), lang))
            .collect();
        Self { configs }
    }

    /// Built-in table for the supported languages
    pub fn builtin() -> Self {
        let command = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self::from_configs(vec![
            LanguageConfig {
                name: "python".to_string(),
                version: "3.11".to_string(),
                image: "python:3.11-slim".to_string(),
                file_name: "main.py".to_string(),
                compile_command: Some(command(&["python3", "-m", "py_compile", "main.py"])),
                run_command: command(&["python3", "-u", "main.py"]),
                memory_limit_mb: 256,
                cpu_limit: 0.5,
            },
            LanguageConfig {
                name: "java".to_string(),
                version: "17".to_string(),
                image: "eclipse-temurin:17-jdk".to_string(),
                file_name: "Main.java".to_string(),
                compile_command: Some(command(&["javac", "Main.java"])),
                run_command: command(&["java", "-cp", ".", "Main"]),
                memory_limit_mb: 512,
                cpu_limit: 1.0,
            },
            LanguageConfig {
                name: "rust".to_string(),
                version: "1.75".to_string(),
                image: "rust:1.75-slim".to_string(),
                file_name: "main.rs".to_string(),
                compile_command: Some(command(&["rustc", "-O", "-o", "main", "main.rs"])),
                run_command: command(&["./main"]),
                memory_limit_mb: 512,
                cpu_limit: 1.0,
            },
        ])
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        let lang_name = language.to_string();
        self.configs
            .get(&lang_name)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", lang_name))
    }

    /// Get Docker image for a language
    pub fn get_image(&self, language: &Language) -> Result<String> {
        Ok(self.get_config(language)?.image.clone())
    }

    /// Get memory limit for a language
    pub fn get_memory_limit_mb(&self, language: &Language) -> Result<u32> {
        Ok(self.get_config(language)?.memory_limit_mb)
    }

    /// Get CPU limit for a language
    pub fn get_cpu_limit(&self, language: &Language) -> Result<f32> {
        Ok(self.get_config(language)?.cpu_limit)
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_language() {
        let manager = LanguageConfigManager::builtin();
        for language in [Language::Python, Language::Java, Language::Rust] {
            let config = manager.get_config(&language).unwrap();
            assert_eq!(config.name, language.to_string());
            assert!(!config.run_command.is_empty());
        }
        assert_eq!(manager.list_languages(), vec!["java", "python", "rust"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("reforge-config-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("languages.json");
        fs::write(
            &path,
            r#"{"languages": [{
                "name": "python",
                "version": "3.12",
                "image": "python:3.12-alpine",
                "file_name": "solution.py",
                "run_command": ["python3", "solution.py"],
                "memory_limit_mb": 128,
                "cpu_limit": 0.25
            }]}"#,
        )
        .unwrap();

        let manager = LanguageConfigManager::load(&path).unwrap();
        let config = manager.get_config(&Language::Python).unwrap();

        assert_eq!(config.image, "python:3.12-alpine");
        assert!(config.compile_command.is_none());
        assert_eq!(manager.get_memory_limit_mb(&Language::Python).unwrap(), 128);
        assert!(manager.get_config(&Language::Java).is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = LanguageConfigManager::load(Path::new("/nonexistent/languages.json"));
        assert!(result.is_err());
    }
}
