//! Language table: canonical identifiers, aliases and executor kinds

use std::collections::HashMap;

use anyhow::Context;
use serde::Deserialize;

/// How a language is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Evaluated by the embedded scripting engine
    InProcess,
    /// Sent to the compile service, with a local fallback interpreter
    RemoteCompile,
}

/// Configuration for a supported language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    /// Canonical identifier (e.g., "cpp")
    pub name: String,
    pub executor: ExecutorKind,
    /// Compile service path (remote languages only)
    pub service_path: Option<String>,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    executor: ExecutorKind,
    service_path: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Languages keyed by canonical name, with an alias index
#[derive(Debug, Clone, Default)]
pub struct LanguageTable {
    languages: HashMap<String, LanguageConfig>,
    aliases: HashMap<String, String>,
}

impl LanguageTable {
    /// Table built from the embedded `files/languages.toml`
    pub fn builtin() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content).context("Invalid embedded languages.toml")
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut table = Self::default();

        for (name, raw) in raw_configs {
            let canonical = normalize(&name);

            if raw.executor == ExecutorKind::RemoteCompile && raw.service_path.is_none() {
                anyhow::bail!("Remote language {} has no service_path", canonical);
            }

            let config = LanguageConfig {
                name: canonical.clone(),
                executor: raw.executor,
                service_path: raw.service_path,
            };

            // Add main language name
            table.insert_alias(&canonical, &canonical)?;

            // Add aliases
            for alias in raw.aliases {
                table.insert_alias(&normalize(&alias), &canonical)?;
            }

            table.languages.insert(canonical, config);
        }

        Ok(table)
    }

    fn insert_alias(&mut self, alias: &str, canonical: &str) -> anyhow::Result<()> {
        if let Some(existing) = self.aliases.get(alias) {
            if existing != canonical {
                anyhow::bail!(
                    "Alias {} is claimed by both {} and {}",
                    alias,
                    existing,
                    canonical
                );
            }
        }
        self.aliases.insert(alias.to_string(), canonical.to_string());
        Ok(())
    }

    /// Resolve a raw identifier or alias to its canonical language
    pub fn resolve(&self, language: &str) -> Option<&LanguageConfig> {
        let canonical = self.aliases.get(&normalize(language))?;
        self.languages.get(canonical)
    }

    pub fn languages(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.languages.values()
    }

    /// All accepted identifiers, canonical names and aliases
    pub fn supported_identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.aliases.keys().cloned().collect();
        names.sort();
        names
    }
}

fn normalize(language: &str) -> String {
    language.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[javascript]
executor = "in_process"
aliases = ["js", "JS-Script"]

[cpp]
executor = "remote_compile"
service_path = "/api/compile/cpp"
aliases = ["c++", "cc"]
"#;

    #[test]
    fn test_load_languages() {
        let table = LanguageTable::from_toml_str(TEST_CONFIG).unwrap();

        let js = table.resolve("javascript").unwrap();
        assert_eq!(js.executor, ExecutorKind::InProcess);
        assert_eq!(js.service_path, None);

        let cpp = table.resolve("cpp").unwrap();
        assert_eq!(cpp.executor, ExecutorKind::RemoteCompile);
        assert_eq!(cpp.service_path.as_deref(), Some("/api/compile/cpp"));
    }

    #[test]
    fn test_aliases_are_case_insensitive() {
        let table = LanguageTable::from_toml_str(TEST_CONFIG).unwrap();

        assert_eq!(table.resolve("JS").unwrap().name, "javascript");
        assert_eq!(table.resolve("js-script").unwrap().name, "javascript");
        assert_eq!(table.resolve("  C++ ").unwrap().name, "cpp");
        assert_eq!(table.resolve("CPP").unwrap().name, "cpp");
    }

    #[test]
    fn test_unknown_language() {
        let table = LanguageTable::from_toml_str(TEST_CONFIG).unwrap();
        assert!(table.resolve("cobol").is_none());
        assert!(table.resolve("").is_none());
    }

    #[test]
    fn test_remote_language_requires_service_path() {
        let config = r#"
[rust]
executor = "remote_compile"
"#;
        assert!(LanguageTable::from_toml_str(config).is_err());
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let config = r#"
[javascript]
executor = "in_process"
aliases = ["x"]

[typescript]
executor = "in_process"
aliases = ["x"]
"#;
        assert!(LanguageTable::from_toml_str(config).is_err());
    }

    #[test]
    fn test_builtin_table() {
        let table = LanguageTable::builtin().unwrap();
        assert_eq!(table.resolve("js").unwrap().name, "javascript");
        assert_eq!(table.resolve("c++").unwrap().name, "cpp");
        assert!(table.supported_identifiers().contains(&"cxx".to_string()));
    }
}
