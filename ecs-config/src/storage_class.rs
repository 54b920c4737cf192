//! Storage class definitions.
//!
//! A storage class names a coding scheme and its parameters; files snapshot
//! the class into their metadata at write time, so a later change to the
//! definition file never affects stored data.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Error};
use serde::Deserialize;

use ecs_api_types::{CodingMeta, CodingScheme};

#[derive(Debug, Clone, Deserialize)]
pub struct StorageClassConfig {
    pub coding: String,
    pub n: u8,
    pub k: u8,
    #[serde(default)]
    pub f: u8,
    pub max_chunk_size: u32,
    #[serde(default)]
    pub default: bool,
}

impl StorageClassConfig {
    pub fn coding_meta(&self) -> Result<CodingMeta, Error> {
        let scheme: CodingScheme = self
            .coding
            .parse()
            .map_err(|err| anyhow::format_err!("{err}"))?;
        Ok(CodingMeta::new(scheme, self.n, self.k, self.f, self.max_chunk_size))
    }
}

/// All configured storage classes, keyed by name.
#[derive(Debug, Clone)]
pub struct StorageClassRegistry {
    classes: HashMap<String, StorageClassConfig>,
    default_class: String,
}

impl StorageClassRegistry {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read storage class file {path:?}"))?;
        let classes: HashMap<String, StorageClassConfig> =
            toml::from_str(&raw).with_context(|| format!("unable to parse {path:?}"))?;
        Self::from_classes(classes)
    }

    pub fn from_classes(classes: HashMap<String, StorageClassConfig>) -> Result<Self, Error> {
        if classes.is_empty() {
            bail!("no storage class defined");
        }
        let mut default_class = None;
        for (name, class) in &classes {
            if class.n == 0 || class.k == 0 || class.n < class.k {
                bail!("storage class '{name}' has invalid parameters (n = {}, k = {})", class.n, class.k);
            }
            if class.f > 0 && usize::from(class.n - class.k) / usize::from(class.f) == 0 {
                bail!("storage class '{name}' cannot place chunks under f = {}", class.f);
            }
            class.coding_meta()
                .with_context(|| format!("storage class '{name}'"))?;
            if class.default {
                if let Some(other) = &default_class {
                    bail!("both '{other}' and '{name}' are marked as the default storage class");
                }
                default_class = Some(name.clone());
            }
        }
        let default_class = match default_class {
            Some(name) => name,
            // a single class is the implicit default
            None if classes.len() == 1 => classes.keys().next().unwrap().clone(),
            None => bail!("no default storage class defined"),
        };
        Ok(Self {
            classes,
            default_class,
        })
    }

    pub fn get(&self, name: &str) -> Option<&StorageClassConfig> {
        self.classes.get(name)
    }

    pub fn default_class(&self) -> &str {
        &self.default_class
    }

    /// Resolve a (possibly empty) class name to its coding parameters.
    pub fn resolve(&self, name: &str) -> Option<(String, CodingMeta)> {
        let name = if name.is_empty() {
            self.default_class.as_str()
        } else {
            name
        };
        let class = self.classes.get(name)?;
        let meta = class.coding_meta().ok()?;
        Some((name.to_string(), meta))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    const CLASSES: &str = r#"
        [standard]
        coding = "rs"
        n = 4
        k = 2
        f = 1
        max_chunk_size = 1048576
        default = true

        [archive]
        coding = "rs"
        n = 6
        k = 4
        max_chunk_size = 4194304
    "#;

    #[test]
    fn load_and_resolve() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CLASSES.as_bytes()).unwrap();
        let registry = StorageClassRegistry::load(file.path()).unwrap();

        assert_eq!(registry.default_class(), "standard");
        let (name, meta) = registry.resolve("").unwrap();
        assert_eq!(name, "standard");
        assert_eq!(meta.scheme(), CodingScheme::ReedSolomon);
        assert_eq!((meta.n, meta.k, meta.f), (4, 2, 1));

        let (_, archive) = registry.resolve("archive").unwrap();
        assert_eq!((archive.n, archive.k, archive.f), (6, 4, 0));
        assert!(registry.resolve("no-such-class").is_none());
    }

    #[test]
    fn rejects_bad_definitions() {
        let bad: HashMap<String, StorageClassConfig> = toml::from_str(
            "[broken]\ncoding = \"rs\"\nn = 2\nk = 4\nmax_chunk_size = 1024\n",
        )
        .unwrap();
        assert!(StorageClassRegistry::from_classes(bad).is_err());

        let two_defaults: HashMap<String, StorageClassConfig> = toml::from_str(concat!(
            "[a]\ncoding = \"rs\"\nn = 4\nk = 2\nmax_chunk_size = 1024\ndefault = true\n",
            "[b]\ncoding = \"rs\"\nn = 4\nk = 2\nmax_chunk_size = 1024\ndefault = true\n",
        ))
        .unwrap();
        assert!(StorageClassRegistry::from_classes(two_defaults).is_err());
    }

    #[test]
    fn single_class_is_implicit_default() {
        let one: HashMap<String, StorageClassConfig> =
            toml::from_str("[only]\ncoding = \"rs\"\nn = 3\nk = 2\nmax_chunk_size = 1024\n")
                .unwrap();
        let registry = StorageClassRegistry::from_classes(one).unwrap();
        assert_eq!(registry.default_class(), "only");
    }
}
