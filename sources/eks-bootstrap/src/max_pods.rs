//! Lookup of the maximum pod count for an instance type.
//!
//! The table is a text file with one `<instance-type> <max-pods>` pair per line. Lines starting
//! with `#` are comments.

use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Failed to read max pods table at '{}': {}", path.display(), source))]
    ReadTable {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Default)]
pub(crate) struct MaxPodsTable {
    entries: HashMap<String, u32>,
}

impl MaxPodsTable {
    pub(crate) fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tokens: Vec<_> = line.split_whitespace().collect();
            match tokens.as_slice() {
                [instance_type, count] => match count.parse::<u32>() {
                    // The first entry for a type wins
                    Ok(count) => {
                        entries.entry(instance_type.to_string()).or_insert(count);
                    }
                    Err(e) => warn!("Skipping max pods line '{}': {}", line, e),
                },
                _ => warn!("Skipping malformed max pods line '{}'", line),
            }
        }
        Self { entries }
    }

    pub(crate) fn from_file<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path).context(ReadTableSnafu { path })?;
        Ok(Self::parse(&text))
    }

    pub(crate) fn lookup(&self, instance_type: &str) -> Option<u32> {
        self.entries.get(instance_type).copied()
    }
}

/// Finds the max pods value for `instance_type`. Nothing is read when `use_max_pods` is off. A
/// type without an entry just means the kubelet keeps its own default; a table that can't be read
/// is an error.
pub(crate) fn resolve_max_pods(
    use_max_pods: bool,
    table_path: &Path,
    instance_type: &str,
) -> Result<Option<u32>> {
    if !use_max_pods {
        debug!("Max pods disabled, not consulting '{}'", table_path.display());
        return Ok(None);
    }

    let table = MaxPodsTable::from_file(table_path)?;
    let max_pods = table.lookup(instance_type);
    match max_pods {
        Some(count) => info!("Max pods for {} is {}", instance_type, count),
        None => warn!(
            "No max pods entry for instance type {}; not setting max pods",
            instance_type
        ),
    }
    Ok(max_pods)
}
