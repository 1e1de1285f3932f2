//! # Migration Store
//!
//! Produces migrations lazily, in a deterministic order.
//!
//! The filesystem store walks the migrations directory depth-first, listing
//! directories before files at every level. Names are compared either
//! naturally (`2_x` before `10_x`) or lexically, with configurable case
//! sensitivity. Only `.yaml`/`.yml` files are migrations.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::checksum::compute_checksum;
use super::errors::{MigrationError, MigrationResult};
use super::{normalize_location, same_location, Migration, MigrationFile};

/// Lazily produced, ordered migrations
pub type MigrationStream<'a> = Box<dyn Iterator<Item = MigrationResult<Migration>> + 'a>;

/// Source of migrations
pub trait MigrationStore {
    /// Restartable stream over every migration, in deployment order
    fn migrations(&self) -> MigrationResult<MigrationStream<'_>>;

    /// Current migration at `location` (case-insensitive)
    fn get(&self, location: &str) -> MigrationResult<Option<Migration>>;
}

/// Ordering options for the filesystem store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    #[serde(default = "default_natural_sort")]
    pub natural_sort: bool,

    #[serde(default)]
    pub case_sensitive: bool,
}

fn default_natural_sort() -> bool {
    true
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            natural_sort: default_natural_sort(),
            case_sensitive: false,
        }
    }
}

impl StoreOptions {
    /// Compare two entry names according to the options
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        let ordering = if self.natural_sort {
            natural_cmp(a, b, self.case_sensitive)
        } else if self.case_sensitive {
            a.cmp(b)
        } else {
            a.to_lowercase().cmp(&b.to_lowercase())
        };
        // keep the order total when names differ only by case
        ordering.then_with(|| a.cmp(b))
    }
}

/// Natural comparison: digit runs compare by numeric value
fn natural_cmp(a: &str, b: &str, case_sensitive: bool) -> Ordering {
    let a_chunks = chunks(a);
    let b_chunks = chunks(b);

    for (x, y) in a_chunks.iter().zip(b_chunks.iter()) {
        let ordering = match (x, y) {
            (Chunk::Digits(x), Chunk::Digits(y)) => {
                let xt = x.trim_start_matches('0');
                let yt = y.trim_start_matches('0');
                xt.len()
                    .cmp(&yt.len())
                    .then_with(|| xt.cmp(yt))
                    .then_with(|| x.len().cmp(&y.len()))
            }
            (Chunk::Text(x), Chunk::Text(y)) => {
                if case_sensitive {
                    x.cmp(y)
                } else {
                    x.to_lowercase().cmp(&y.to_lowercase())
                }
            }
            (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
            (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    a_chunks.len().cmp(&b_chunks.len())
}

enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

fn chunks(s: &str) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut digits: Option<bool> = None;

    for (i, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        match digits {
            Some(prev) if prev != is_digit => {
                out.push(chunk(&s[start..i], prev));
                start = i;
            }
            _ => {}
        }
        digits = Some(is_digit);
    }
    if let Some(prev) = digits {
        out.push(chunk(&s[start..], prev));
    }
    out
}

fn chunk(s: &str, digits: bool) -> Chunk<'_> {
    if digits {
        Chunk::Digits(s)
    } else {
        Chunk::Text(s)
    }
}

fn is_migration_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Migrations stored as YAML files under a directory
#[derive(Debug, Clone)]
pub struct FsMigrationStore {
    root: PathBuf,
    options: StoreOptions,
}

impl FsMigrationStore {
    pub fn new(root: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative locations of every migration, in deployment order
    pub fn locations(&self) -> MigrationResult<Vec<String>> {
        if !self.root.is_dir() {
            return Err(MigrationError::io(
                self.root.clone(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "migrations directory not found"),
            ));
        }
        let mut out = Vec::new();
        self.walk(&self.root, "", &mut out)?;
        Ok(out)
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> MigrationResult<()> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();

        for entry in fs::read_dir(dir).map_err(|e| MigrationError::io(dir, e))? {
            let entry = entry.map_err(|e| MigrationError::io(dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| MigrationError::io(&path, e))?;
            if file_type.is_dir() {
                dirs.push(name);
            } else if is_migration_file(&path) {
                files.push(name);
            }
        }

        dirs.sort_by(|a, b| self.options.compare(a, b));
        files.sort_by(|a, b| self.options.compare(a, b));

        for name in dirs {
            let location = format!("{}{}/", prefix, name);
            self.walk(&dir.join(&name), &location, out)?;
        }
        out.extend(files.into_iter().map(|name| format!("{}{}", prefix, name)));
        Ok(())
    }

    /// Load the migration at a relative location
    pub fn load(&self, location: &str) -> MigrationResult<Migration> {
        let path = self.root.join(location);
        let content = fs::read(&path).map_err(|e| MigrationError::io(&path, e))?;

        let file: MigrationFile =
            serde_yaml::from_slice(&content).map_err(|e| MigrationError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let migration = file.into_migration(location.to_string(), compute_checksum(&content));
        migration.validate()?;
        debug!(location = %migration.location, checksum = %migration.checksum, "loaded migration");
        Ok(migration)
    }
}

impl MigrationStore for FsMigrationStore {
    fn migrations(&self) -> MigrationResult<MigrationStream<'_>> {
        let locations = self.locations()?;
        Ok(Box::new(
            locations.into_iter().map(move |location| self.load(&location)),
        ))
    }

    fn get(&self, location: &str) -> MigrationResult<Option<Migration>> {
        let wanted = normalize_location(location);
        for candidate in self.locations()? {
            if normalize_location(&candidate) == wanted {
                return self.load(&candidate).map(Some);
            }
        }
        Ok(None)
    }
}

/// In-memory store, deployment order is insertion order
#[derive(Debug, Clone, Default)]
pub struct VecMigrationStore {
    migrations: Vec<Migration>,
}

impl VecMigrationStore {
    pub fn new(migrations: Vec<Migration>) -> Self {
        Self { migrations }
    }

    /// Add or replace the migration at the same location
    pub fn put(&mut self, migration: Migration) {
        match self
            .migrations
            .iter_mut()
            .find(|m| same_location(&m.location, &migration.location))
        {
            Some(existing) => *existing = migration,
            None => self.migrations.push(migration),
        }
    }
}

impl MigrationStore for VecMigrationStore {
    fn migrations(&self) -> MigrationResult<MigrationStream<'_>> {
        Ok(Box::new(self.migrations.iter().cloned().map(Ok)))
    }

    fn get(&self, location: &str) -> MigrationResult<Option<Migration>> {
        Ok(self.migrations.iter().find(|m| m.is_at(location)).cloned())
    }
}
