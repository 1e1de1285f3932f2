//! # Migration Generator
//!
//! Creates and removes migration files in the local store.

use super::errors::{MigrationError, MigrationResult};
use super::MigratePolicy;
use chrono::{SecondsFormat, Utc};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Migration generator
pub struct MigrationGenerator {
    migrations_dir: PathBuf,
}

impl MigrationGenerator {
    /// Create a new migration generator
    pub fn new(migrations_dir: PathBuf) -> Self {
        Self { migrations_dir }
    }

    /// Generate a new migration file, returning its path
    pub fn create(&self, name: &str, policy: MigratePolicy, author: &str) -> MigrationResult<PathBuf> {
        if name.trim().is_empty() {
            return Err(MigrationError::validation("migration name", "cannot be empty"));
        }

        if !self.migrations_dir.exists() {
            fs::create_dir_all(&self.migrations_dir)
                .map_err(|e| MigrationError::io(&self.migrations_dir, e))?;
        }

        let next_number = self.next_number()?;

        // Sanitize name (lowercase, underscores)
        let sanitized_name = name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect::<String>();

        let filename = format!("{:03}_{}.yaml", next_number, sanitized_name);
        let file_path = self.migrations_dir.join(&filename);

        let content = Self::template(name.trim(), policy, author);
        fs::write(&file_path, content).map_err(|e| MigrationError::io(&file_path, e))?;

        Ok(file_path)
    }

    /// Delete the migration file at a store-relative location
    pub fn remove(&self, location: &str) -> MigrationResult<PathBuf> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if location.trim().is_empty() || escapes {
            return Err(MigrationError::validation(
                "migration location",
                format!("'{}' is not a relative path inside the store", location),
            ));
        }

        let path = self.migrations_dir.join(relative);
        if !path.is_file() {
            return Err(MigrationError::ScriptMissing {
                location: location.to_string(),
            });
        }
        fs::remove_file(&path).map_err(|e| MigrationError::io(&path, e))?;
        Ok(path)
    }

    /// Next numeric prefix in the top-level directory
    fn next_number(&self) -> MigrationResult<u64> {
        if !self.migrations_dir.exists() {
            return Ok(1);
        }

        let mut max_number = 0;

        for entry in fs::read_dir(&self.migrations_dir)
            .map_err(|e| MigrationError::io(&self.migrations_dir, e))?
        {
            let entry = entry.map_err(|e| MigrationError::io(&self.migrations_dir, e))?;

            let path = entry.path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                // 001_name -> 1
                let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(number) = digits.parse::<u64>() {
                    max_number = max_number.max(number);
                }
            }
        }

        Ok(max_number + 1)
    }

    /// Migration file body for a new migration
    pub fn template(description: &str, policy: MigratePolicy, author: &str) -> String {
        let authored_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        format!(
            r#"policy: {policy}
author: "{author}"
description: "{description}"
authored_at: {authored_at}
migrate: |
  -- forward change
  SELECT 1;
rollback: |
  -- reverse of the forward change
  SELECT 1;
"#,
            policy = policy,
            author = author.replace('"', "'"),
            description = description.replace('"', "'"),
            authored_at = authored_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{FsMigrationStore, MigrationStore, StoreOptions};
    use tempfile::TempDir;

    #[test]
    fn test_create_first_migration() {
        let temp_dir = TempDir::new().unwrap();
        let migrations_dir = temp_dir.path().join("migrations");

        let generator = MigrationGenerator::new(migrations_dir.clone());
        let path = generator
            .create("create_users", MigratePolicy::Once, "alice")
            .unwrap();

        assert!(path.exists());
        assert!(path.to_string_lossy().contains("001_create_users.yaml"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("policy: once"));
        assert!(content.contains("author: \"alice\""));
    }

    #[test]
    fn test_create_sequential_migrations() {
        let temp_dir = TempDir::new().unwrap();
        let generator = MigrationGenerator::new(temp_dir.path().join("migrations"));

        let path1 = generator.create("create_users", MigratePolicy::Once, "a").unwrap();
        let path2 = generator.create("create_posts", MigratePolicy::Once, "a").unwrap();
        let path3 = generator
            .create("refresh_views", MigratePolicy::OnchangeAfter, "a")
            .unwrap();

        assert!(path1.to_string_lossy().contains("001_"));
        assert!(path2.to_string_lossy().contains("002_"));
        assert!(path3.to_string_lossy().contains("003_"));
    }

    #[test]
    fn test_sanitize_name() {
        let temp_dir = TempDir::new().unwrap();
        let generator = MigrationGenerator::new(temp_dir.path().join("migrations"));

        let path = generator
            .create("Add User's Table!", MigratePolicy::Once, "a")
            .unwrap();
        assert!(path.to_string_lossy().contains("add_user_s_table_"));
    }

    #[test]
    fn test_generated_file_loads() {
        let temp_dir = TempDir::new().unwrap();
        let migrations_dir = temp_dir.path().join("migrations");
        let generator = MigrationGenerator::new(migrations_dir.clone());
        generator
            .create("grants", MigratePolicy::AlwaysAfter, "bob")
            .unwrap();

        let store = FsMigrationStore::new(migrations_dir, StoreOptions::default());
        let migration = store.get("001_grants.yaml").unwrap().unwrap();
        assert_eq!(migration.policy, MigratePolicy::AlwaysAfter);
        assert_eq!(migration.author, "bob");
        assert!(migration.authored_at.is_some());
        assert!(migration.script.is_reversible());
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let generator = MigrationGenerator::new(temp_dir.path().to_path_buf());
        let path = generator.create("x", MigratePolicy::Once, "a").unwrap();

        generator.remove("001_x.yaml").unwrap();
        assert!(!path.exists());
        assert!(matches!(
            generator.remove("001_x.yaml"),
            Err(MigrationError::ScriptMissing { .. })
        ));
        assert!(generator.remove("../outside.yaml").is_err());
    }
}
