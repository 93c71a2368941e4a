//! Backup descriptors.
//!
//! A descriptor is a YAML file named `<project>-backup.yaml` mapping a target
//! kind to the names that target should protect:
//!
//! ```yaml
//! files:
//!   - /opt/thing/logs/
//!   - /opt/thing/
//! mysql-database:
//!   - mydb1
//!   - mydb2.table1
//! postgresql-database:
//!   - dbx
//! ```
//!
//! A descriptor can be narrowed to a subset of itself with `kind.name`
//! selectors, e.g. `mysql-database.mydb1` or `files./opt/thing/`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_yml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

pub const DESCRIPTOR_SUFFIX: &str = "-backup.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    Files,
    TarGzipped,
    MysqlDatabase,
    PostgresqlDatabase,
    RdsSnapshot,
}

impl TargetKind {
    pub const ALL: [TargetKind; 5] = [
        TargetKind::Files,
        TargetKind::TarGzipped,
        TargetKind::MysqlDatabase,
        TargetKind::PostgresqlDatabase,
        TargetKind::RdsSnapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Files => "files",
            TargetKind::TarGzipped => "tar-gzipped",
            TargetKind::MysqlDatabase => "mysql-database",
            TargetKind::PostgresqlDatabase => "postgresql-database",
            TargetKind::RdsSnapshot => "rds-snapshot",
        }
    }

    fn known() -> String {
        Self::ALL
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "we don't recognize what a {s:?} is. known targets: {}",
                    Self::known()
                ))
            })
    }
}

/// Target kinds mapped to the names each should back up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(BTreeMap<TargetKind, Vec<String>>);

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: TargetKind) -> Option<&[String]> {
        self.0.get(&kind).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetKind, &[String])> {
        self.0.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Just the given kind's section, or an empty descriptor.
    pub fn only(&self, kind: TargetKind) -> Descriptor {
        self.0
            .get(&kind)
            .map(|names| Descriptor::from_iter([(kind, names.clone())]))
            .unwrap_or_default()
    }

    /// Drops the given kind's section.
    pub fn without(&self, kind: TargetKind) -> Descriptor {
        let mut copy = self.clone();
        copy.0.remove(&kind);
        copy
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yml::to_string(self)?)
    }

    /// Appends `name` under `kind` unless it is already there.
    fn merge_name(&mut self, kind: TargetKind, name: String) {
        let names = self.0.entry(kind).or_default();
        if !names.contains(&name) {
            names.push(name);
        }
    }
}

impl<S: Into<String>> FromIterator<(TargetKind, Vec<S>)> for Descriptor {
    fn from_iter<I: IntoIterator<Item = (TargetKind, Vec<S>)>>(iter: I) -> Self {
        Descriptor(
            iter.into_iter()
                .map(|(k, names)| (k, names.into_iter().map(Into::into).collect()))
                .collect(),
        )
    }
}

/// Parses descriptor text. An empty document is an empty mapping.
pub fn parse(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Mapping(Default::default()));
    }
    match serde_yml::from_str::<Value>(text)? {
        Value::Null => Ok(Value::Mapping(Default::default())),
        value => Ok(value),
    }
}

/// Checks the parsed document is a mapping of known target kinds to lists of
/// strings and returns it as a typed descriptor.
pub fn validate(value: &Value) -> Result<Descriptor> {
    let mapping = match value {
        Value::Mapping(m) => m,
        other => {
            return Err(Error::Validation(format!(
                "a descriptor must be a mapping of target kind to a list of names, got: {other:?}"
            )))
        }
    };

    let mut sections = BTreeMap::new();
    for (key, val) in mapping {
        let key = key.as_str().ok_or_else(|| {
            Error::Validation(format!("target kinds must be strings, got: {key:?}"))
        })?;
        let kind = TargetKind::from_str(key)?;

        let items = val.as_sequence().ok_or_else(|| {
            Error::Validation(format!("a target's list of things to back up must be a list: {key}"))
        })?;
        let names = items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    Error::Validation(format!("{key}: every name must be a string, got: {item:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        sections.insert(kind, names);
    }
    Ok(Descriptor(sections))
}

fn split_selector(selector: &str) -> Result<(&str, &str)> {
    selector.split_once('.').ok_or_else(|| {
        Error::InvalidName(format!(
            "expecting a selector like <kind>.<name> (e.g. mysql-database.mydb1), got: {selector:?}"
        ))
    })
}

/// Resolves one selector against the descriptor. `None` when the kind or name
/// isn't present.
fn resolve(descriptor: &Descriptor, selector: &str) -> Result<Option<(TargetKind, String)>> {
    let (kind, name) = split_selector(selector)?;
    let Ok(kind) = TargetKind::from_str(kind) else {
        warn!("unknown target kind in selector {:?}", selector);
        return Ok(None);
    };
    let Some(names) = descriptor.get(kind) else {
        warn!("no {:?} in descriptor: {:?}", kind.as_str(), descriptor);
        return Ok(None);
    };
    if !names.iter().any(|n| n == name) {
        warn!("given descriptor has no path {:?}", selector);
        return Ok(None);
    }
    Ok(Some((kind, name.to_string())))
}

fn narrow_with(descriptor: &Descriptor, selectors: &[String], strict: bool) -> Result<Descriptor> {
    if selectors.is_empty() {
        return Ok(descriptor.clone());
    }
    let mut narrowed = Descriptor::new();
    for selector in selectors {
        match resolve(descriptor, selector)? {
            Some((kind, name)) => narrowed.merge_name(kind, name),
            None if strict => {
                return Err(Error::Validation(format!(
                    "selector {selector:?} doesn't match anything in the descriptor"
                )))
            }
            None => {}
        }
    }
    Ok(narrowed)
}

/// Restricts `descriptor` to the given `kind.name` selectors. Selectors that
/// don't match are logged and ignored; an empty selector list is a no-op.
pub fn narrow(descriptor: &Descriptor, selectors: &[String]) -> Result<Descriptor> {
    narrow_with(descriptor, selectors, false)
}

/// Like [`narrow`] but a selector that doesn't match is a validation error.
pub fn narrow_strict(descriptor: &Descriptor, selectors: &[String]) -> Result<Descriptor> {
    narrow_with(descriptor, selectors, true)
}

/// `/etc/stash-backup/lax-backup.yaml` => `lax`
pub fn project_name(path: &Path) -> Option<String> {
    let filename = path.file_name()?.to_str()?;
    match filename.strip_suffix(DESCRIPTOR_SUFFIX) {
        Some(project) if !project.is_empty() => Some(project.to_string()),
        _ => {
            debug!(
                "given descriptor file isn't suffixed with {:?}, can't determine the project name: {}",
                DESCRIPTOR_SUFFIX,
                path.display()
            );
            None
        }
    }
}

pub fn is_descriptor(path: &Path) -> bool {
    project_name(path).is_some()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Descriptor files in `location`, sorted. `location` may also be a single
/// descriptor file.
pub fn find_descriptors(location: &Path) -> Result<Vec<PathBuf>> {
    let location = absolute(location)?;
    if location.is_file() {
        return Ok(if is_descriptor(&location) {
            vec![location]
        } else {
            Vec::new()
        });
    }
    if !location.is_dir() {
        return Err(Error::NotFound(format!(
            "descriptor directory {}",
            location.display()
        )));
    }

    let mut found: Vec<PathBuf> = fs::read_dir(&location)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.exists() && is_descriptor(path))
        .collect();
    found.sort();
    Ok(found)
}

/// Reads, validates and optionally narrows the descriptor at `path`.
pub fn load_descriptor(path: &Path, selectors: &[String], strict: bool) -> Result<Descriptor> {
    let text = fs::read_to_string(path)?;
    let descriptor = validate(&parse(&text)?)?;
    narrow_with(&descriptor, selectors, strict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sel(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> Descriptor {
        Descriptor::from_iter([
            (TargetKind::MysqlDatabase, vec!["mdb1", "mdb2", "mdb3"]),
            (TargetKind::Files, vec!["/etc/foo/", "/var/bar/", "/bin/baz/"]),
        ])
    }

    #[test]
    fn test_parse_and_validate() {
        let text = "files:\n  - /opt/thing/logs/\n  - /opt/thing/\nmysql-database:\n  - mydb1\n  - mydb2.table1\npostgresql-database:\n  - dbx\n";
        let descriptor = validate(&parse(text).unwrap()).unwrap();
        assert_eq!(
            descriptor.get(TargetKind::Files).unwrap(),
            ["/opt/thing/logs/", "/opt/thing/"]
        );
        assert_eq!(
            descriptor.get(TargetKind::MysqlDatabase).unwrap(),
            ["mydb1", "mydb2.table1"]
        );
        assert_eq!(descriptor.get(TargetKind::PostgresqlDatabase).unwrap(), ["dbx"]);
    }

    #[test]
    fn test_empty_document_is_empty_descriptor() {
        for text in ["", "   \n", "~\n", "---\n"] {
            assert!(validate(&parse(text).unwrap()).unwrap().is_empty(), "{text:?}");
        }
    }

    #[test]
    fn test_invalid_descriptors() {
        let bad = [
            "foo: bar\n",                      // unknown kind, and not a list
            "foo:\n  - baz\n  - bar\n",        // unknown kind
            "files: /opt/thing\n",             // not a list
            "files:\n  - 1\n",                 // not a string
            "- files\n",                       // not a mapping
        ];
        for text in bad {
            let result = validate(&parse(text).unwrap());
            assert!(matches!(result, Err(Error::Validation(_))), "{text:?}");
        }
    }

    #[test]
    fn test_validate_round_trip() {
        let descriptor = Descriptor::from_iter([
            (TargetKind::TarGzipped, vec!["/var/log/app/*", "/opt/app/uploads"]),
            (TargetKind::PostgresqlDatabase, vec!["db1", "db2"]),
            (TargetKind::RdsSnapshot, vec!["project-prod"]),
        ]);
        let text = descriptor.to_yaml().unwrap();
        assert_eq!(validate(&parse(&text).unwrap()).unwrap(), descriptor);
    }

    #[test]
    fn test_narrow_single() {
        let narrowed = narrow(&sample(), &sel(&["mysql-database.mdb2"])).unwrap();
        assert_eq!(
            narrowed,
            Descriptor::from_iter([(TargetKind::MysqlDatabase, vec!["mdb2"])])
        );
    }

    #[test]
    fn test_narrow_many_merges_in_first_seen_order() {
        let given = sel(&[
            "mysql-database.mdb3",
            "mysql-database.mdb2",
            "files./var/bar/",
            "mysql-database.mdb3",
        ]);
        let expected = Descriptor::from_iter([
            (TargetKind::MysqlDatabase, vec!["mdb3", "mdb2"]),
            (TargetKind::Files, vec!["/var/bar/"]),
        ]);
        assert_eq!(narrow(&sample(), &given).unwrap(), expected);
    }

    #[test]
    fn test_narrow_is_a_restriction() {
        let given = sel(&["files./etc/foo/", "files./nope", "postgresql-database.x", "bogus.y"]);
        let narrowed = narrow(&sample(), &given).unwrap();
        for (kind, names) in narrowed.iter() {
            let original = sample();
            let known = original.get(kind).unwrap();
            assert!(names.iter().all(|n| known.contains(n)));
        }
        assert_eq!(
            narrowed,
            Descriptor::from_iter([(TargetKind::Files, vec!["/etc/foo/"])])
        );
    }

    #[test]
    fn test_narrow_union_is_order_independent() {
        let a = sel(&["mysql-database.mdb1", "mysql-database.mdb2"]);
        let b = sel(&["mysql-database.mdb2", "mysql-database.mdb3"]);
        let ab = narrow(&sample(), &[a.clone(), b.clone()].concat()).unwrap();
        let ba = narrow(&sample(), &[b, a].concat()).unwrap();

        let mut ab_names = ab.get(TargetKind::MysqlDatabase).unwrap().to_vec();
        let mut ba_names = ba.get(TargetKind::MysqlDatabase).unwrap().to_vec();
        ab_names.sort();
        ba_names.sort();
        assert_eq!(ab_names, vec!["mdb1", "mdb2", "mdb3"]);
        assert_eq!(ab_names, ba_names);
    }

    #[test]
    fn test_narrow_soft_fails() {
        let files = Descriptor::from_iter([(TargetKind::Files, vec!["/a", "/b"])]);
        assert_eq!(
            narrow(&files, &sel(&["files./a"])).unwrap(),
            Descriptor::from_iter([(TargetKind::Files, vec!["/a"])])
        );
        assert_eq!(narrow(&Descriptor::new(), &sel(&["files./a"])).unwrap(), Descriptor::new());
    }

    #[test]
    fn test_narrow_empty_selectors_is_identity() {
        assert_eq!(narrow(&sample(), &[]).unwrap(), sample());
    }

    #[test]
    fn test_narrow_strict() {
        assert!(matches!(
            narrow_strict(&sample(), &sel(&["files./nope"])),
            Err(Error::Validation(_))
        ));
        assert!(narrow_strict(&sample(), &sel(&["files./etc/foo/"])).is_ok());
    }

    #[test]
    fn test_selector_without_dot() {
        assert!(matches!(
            narrow(&sample(), &sel(&["mysql-database"])),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_selector_splits_on_first_dot() {
        let desc = Descriptor::from_iter([(TargetKind::MysqlDatabase, vec!["mydb2.table1"])]);
        let narrowed = narrow(&desc, &sel(&["mysql-database.mydb2.table1"])).unwrap();
        assert_eq!(narrowed, desc);
    }

    #[test]
    fn test_project_name() {
        assert_eq!(
            project_name(Path::new("/etc/stash-backup/lax-backup.yaml")).as_deref(),
            Some("lax")
        );
        assert_eq!(project_name(Path::new("elife-api-backup.yaml")).as_deref(), Some("elife-api"));
        assert_eq!(project_name(Path::new("/etc/stash-backup/lax.yaml")), None);
        assert_eq!(project_name(Path::new("-backup.yaml")), None);
    }

    #[test]
    fn test_find_descriptors() {
        let dir = TempDir::new().unwrap();
        for name in ["b-backup.yaml", "a-backup.yaml", "notes.txt", "c-backup.yml"] {
            fs::write(dir.path().join(name), "files: []\n").unwrap();
        }
        let found = find_descriptors(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a-backup.yaml", "b-backup.yaml"]);
        assert!(found.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn test_find_no_descriptors() {
        let dir = TempDir::new().unwrap();
        assert!(find_descriptors(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_find_single_descriptor_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lax-backup.yaml");
        fs::write(&path, "").unwrap();
        assert_eq!(find_descriptors(&path).unwrap(), vec![path]);
    }

    #[test]
    fn test_load_descriptor_with_selectors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lax-backup.yaml");
        fs::write(&path, "postgresql-database:\n  - lax\n  - other\nfiles:\n  - /opt/lax/\n").unwrap();

        let narrowed = load_descriptor(&path, &sel(&["postgresql-database.lax"]), false).unwrap();
        assert_eq!(
            narrowed,
            Descriptor::from_iter([(TargetKind::PostgresqlDatabase, vec!["lax"])])
        );
    }
}
