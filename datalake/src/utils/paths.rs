use common::{Error, Result};
use object_store::path::Path;
use regex::Regex;

/// Directory value used for a null partition column, as hive does.
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";
pub const DATA_FILE_NAME: &str = "part-00000.parquet";
pub const SUCCESS_MARKER: &str = "_SUCCESS";
pub const STAGING_DIR: &str = "_temporary";
const PREVIOUS_DIR: &str = "_previous";

/// Builds object paths of the form `{table}/col=value/.../{file}`.
pub struct PathBuilder {
    table: String,
    partitions: Vec<(String, Option<String>)>,
}

impl PathBuilder {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            partitions: Vec::new(),
        }
    }

    pub fn with_partition(mut self, column: &str, value: Option<&str>) -> Self {
        self.partitions
            .push((column.to_string(), value.map(str::to_string)));
        self
    }

    pub fn with_partitions(mut self, partitions: &[(String, Option<String>)]) -> Self {
        self.partitions.extend_from_slice(partitions);
        self
    }

    /// Partition directory segments, e.g. `year=2018/month=11`.
    pub fn build_partition_path(&self) -> String {
        self.partition_segments().join("/")
    }

    pub fn build_table_path(&self) -> Path {
        Path::from_iter([self.table.as_str()])
    }

    /// Full object path. Each segment is percent-encoded on its own, so a
    /// `/` inside a partition value never introduces a directory level.
    pub fn build_file_path(&self) -> Path {
        let mut parts = vec![self.table.clone()];
        parts.extend(self.partition_segments());
        parts.push(DATA_FILE_NAME.to_string());
        Path::from_iter(parts)
    }

    pub fn build_marker_path(&self) -> Path {
        self.build_table_path().child(SUCCESS_MARKER)
    }

    fn partition_segments(&self) -> Vec<String> {
        self.partitions
            .iter()
            .map(|(column, value)| {
                format!(
                    "{}={}",
                    column,
                    value.as_deref().unwrap_or(DEFAULT_PARTITION)
                )
            })
            .collect()
    }
}

/// Path under which one run stages a table before publishing it.
pub fn staging_prefix(run_id: &str, table: &str) -> Path {
    Path::from_iter([STAGING_DIR, run_id, table])
}

/// Path under which one run parks the files a table held before it was
/// replaced, until the replacement is complete.
pub fn previous_prefix(run_id: &str, table: &str) -> Path {
    Path::from_iter([STAGING_DIR, run_id, PREVIOUS_DIR, table])
}

/// Re-roots `path` from `from` onto `to`, or `None` when `path` does not
/// live under `from`.
pub fn rebase(path: &Path, from: &Path, to: &Path) -> Option<Path> {
    let rest = path.prefix_match(from)?;
    Some(Path::from_iter(to.parts().chain(rest)))
}

/// A glob over object keys relative to an input root. `*` and `?` stay
/// within one path segment; `**` spans directories.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim_start_matches('/');
        if pattern.is_empty() {
            return Err(Error::InvalidInput("Empty glob pattern".to_string()));
        }

        let mut expr = String::from("^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    // `**/` also matches zero directories
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        expr.push_str("(?:.*/)?");
                    } else {
                        expr.push_str(".*");
                    }
                }
                '*' => expr.push_str("[^/]*"),
                '?' => expr.push_str("[^/]"),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            Error::InvalidInput(format!("Invalid glob pattern '{}': {}", pattern, e))
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Longest leading run of wildcard-free directories; the narrowest
    /// prefix that can be listed to find every match.
    pub fn list_prefix(&self) -> Path {
        let segments: Vec<&str> = self.pattern.split('/').collect();
        let literal = segments[..segments.len().saturating_sub(1)]
            .iter()
            .take_while(|segment| !segment.contains(['*', '?']))
            .copied();
        Path::from_iter(literal)
    }

    pub fn matches(&self, key: &Path) -> bool {
        self.regex.is_match(key.as_ref())
    }
}
