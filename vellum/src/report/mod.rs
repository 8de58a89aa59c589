// Report - a named, incrementally maintained grouped view. Each group is one
// JSON file; a parallel "groups" listing per path prefix enumerates the
// immediate sub-groups that currently have content. Derived reports listen on
// another report's groups and reduce them through a handler.

use crate::engine;
use crate::error::{Result, VellumError};
use crate::line::Line;
use crate::store::Store;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Groups a report falls back to when no classifier is declared anywhere.
pub const ROOT_GROUP: &str = "all";

/// Poll-wait schedule for version-gated reads, in milliseconds.
const BACKOFF_MS: [u64; 10] = [10, 100, 100, 100, 100, 100, 1000, 2000, 2000, 5000];

pub type LineClassifier = Arc<dyn Fn(&Line) -> Vec<String> + Send + Sync>;
pub type GroupClassifier = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;
pub type Sorter = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// Derived-report reducer: (source group value, current derived value,
/// source report name, source group name) → new derived value. Returning
/// null deletes the derived group.
pub type Handler = Arc<dyn Fn(&Value, &Value, &str, &str) -> Value + Send + Sync>;

#[derive(Clone)]
pub enum Source {
    Linetype(String),
    Report(String),
}

#[derive(Clone)]
enum Classify {
    Line(LineClassifier),
    Group(GroupClassifier),
}

/// One subscription of a report: a linetype whose changes re-classify lines
/// into groups, or another report whose changed groups feed the handler.
#[derive(Clone)]
pub struct Listen {
    pub source: Source,
    classify: Option<Classify>,
}

impl Listen {
    pub fn linetype(name: &str) -> Self {
        Listen {
            source: Source::Linetype(name.to_string()),
            classify: None,
        }
    }

    pub fn linetype_with(name: &str, classify: LineClassifier) -> Self {
        Listen {
            source: Source::Linetype(name.to_string()),
            classify: Some(Classify::Line(classify)),
        }
    }

    pub fn report(name: &str) -> Self {
        Listen {
            source: Source::Report(name.to_string()),
            classify: None,
        }
    }

    pub fn report_with(name: &str, classify: GroupClassifier) -> Self {
        Listen {
            source: Source::Report(name.to_string()),
            classify: Some(Classify::Group(classify)),
        }
    }

    pub fn classifies_lines(&self) -> bool {
        matches!(self.classify, Some(Classify::Line(_)))
    }

    pub fn classifies_groups(&self) -> bool {
        matches!(self.classify, Some(Classify::Group(_)))
    }

    /// Map a changed source group to the derived groups it feeds.
    pub fn target_groups(&self, group: &str) -> Vec<String> {
        match &self.classify {
            Some(Classify::Group(classify)) => classify(group),
            _ => vec![group.to_string()],
        }
    }
}

#[derive(Clone)]
pub struct Report {
    name: String,
    listens: Vec<Listen>,
    classify: Option<LineClassifier>,
    sorter: Option<Sorter>,
    handler: Option<Handler>,
    default: Value,
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Report")
            .field("name", &self.name)
            .field("listens", &self.listens.len())
            .field("derived", &self.is_derived())
            .finish()
    }
}

fn group_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.\-]+(?:/[A-Za-z0-9_.\-]+)*$").unwrap_or_else(|_| unreachable!())
    })
}

fn prefix_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z0-9_.\-]+/)*$").unwrap_or_else(|_| unreachable!())
    })
}

fn version_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{64}$").unwrap_or_else(|_| unreachable!()))
}

pub(crate) fn validate_group(name: &str) -> Result<()> {
    if group_pattern().is_match(name) {
        Ok(())
    } else {
        Err(VellumError::Schema(format!("invalid group name: {:?}", name)))
    }
}

impl Report {
    pub fn new(name: &str) -> Self {
        Report {
            name: name.to_string(),
            listens: Vec::new(),
            classify: None,
            sorter: None,
            handler: None,
            default: Value::Array(Vec::new()),
        }
    }

    pub fn listen(mut self, listen: Listen) -> Self {
        self.listens.push(listen);
        self
    }

    /// Report-level classifier, used by listens without their own.
    pub fn classify(mut self, classify: LineClassifier) -> Self {
        self.classify = Some(classify);
        self
    }

    pub fn sorter(mut self, sorter: Sorter) -> Self {
        self.sorter = Some(sorter);
        self
    }

    pub fn handle(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// The value an absent group reads as, and the value whose save deletes
    /// the group file. Defaults to an empty list.
    pub fn default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }

    pub fn listens(&self) -> &[Listen] {
        &self.listens
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// A report is derived iff it listens on reports rather than linetypes.
    pub fn is_derived(&self) -> bool {
        !self.listens.is_empty()
            && self
                .listens
                .iter()
                .all(|l| matches!(l.source, Source::Report(_)))
    }

    /// Group names for a line, preferring the listen's classifier, then the
    /// report's, then the implicit root group.
    pub fn classify_line(&self, listen: &Listen, line: &Line) -> Vec<String> {
        match (&listen.classify, &self.classify) {
            (Some(Classify::Line(classify)), _) => classify(line),
            (_, Some(classify)) => classify(line),
            _ => vec![ROOT_GROUP.to_string()],
        }
    }

    fn dir(&self, home: &Path) -> PathBuf {
        home.join("reports").join(&self.name)
    }

    pub fn group_file(&self, home: &Path, group: &str) -> PathBuf {
        self.dir(home).join(format!("{}.json", group))
    }

    pub fn version_file(&self, home: &Path) -> PathBuf {
        self.dir(home).join("version.dat")
    }

    pub fn get(
        &self,
        home: &Path,
        store: &mut Store,
        group: &str,
        min_version: Option<&str>,
    ) -> Result<Value> {
        validate_group(group)?;
        if let Some(min_version) = min_version {
            self.wait_for_version(home, store, min_version)?;
        }
        match store.get(&self.group_file(home, group))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(self.default.clone()),
        }
    }

    pub fn has(&self, home: &Path, store: &Store, group: &str) -> bool {
        store.has(&self.group_file(home, group))
    }

    /// Immediate sub-group names under a slash-terminated (or empty) prefix.
    pub fn groups(
        &self,
        home: &Path,
        store: &mut Store,
        prefix: &str,
        min_version: Option<&str>,
    ) -> Result<Vec<String>> {
        if !prefix_pattern().is_match(prefix) {
            return Err(VellumError::Schema(format!(
                "invalid group prefix: {:?}",
                prefix
            )));
        }
        if let Some(min_version) = min_version {
            self.wait_for_version(home, store, min_version)?;
        }
        let file = self.dir(home).join(format!("{}groups.json", prefix));
        match store.get(&file)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace-or-append `line` in `group` by (type, id) identity.
    pub fn upsert(&self, home: &Path, store: &mut Store, group: &str, line: &Value) -> Result<()> {
        let current = self.get(home, store, group, None)?;
        let mut entries = match current {
            Value::Array(entries) => entries,
            other => {
                return Err(VellumError::Schema(format!(
                    "cannot upsert into non-list group {}/{}: {}",
                    self.name, group, other
                )))
            }
        };

        let identity = (line.get("type").cloned(), line.get("id").cloned());
        match entries
            .iter()
            .position(|e| (e.get("type").cloned(), e.get("id").cloned()) == identity)
        {
            Some(position) => entries[position] = line.clone(),
            None => entries.push(line.clone()),
        }
        if let Some(sorter) = &self.sorter {
            entries.sort_by(|a, b| sorter(a, b));
        }

        self.save(home, store, group, &Value::Array(entries))
    }

    /// Drop the (linetype, id) entry from `group`, if present.
    pub fn delete(
        &self,
        home: &Path,
        store: &mut Store,
        group: &str,
        linetype: &str,
        id: &str,
    ) -> Result<()> {
        let current = self.get(home, store, group, None)?;
        let Value::Array(entries) = current else {
            return Ok(());
        };
        let filtered: Vec<Value> = entries
            .into_iter()
            .filter(|e| {
                e.get("type").and_then(Value::as_str) != Some(linetype)
                    || e.get("id").and_then(Value::as_str) != Some(id)
            })
            .collect();
        self.save(home, store, group, &Value::Array(filtered))
    }

    /// Persist a group value. Saving the default (or null) deletes the group;
    /// saving an unchanged value is a no-op so the groups index never churns.
    pub fn save(&self, home: &Path, store: &mut Store, group: &str, value: &Value) -> Result<()> {
        validate_group(group)?;
        let file = self.group_file(home, group);

        if value.is_null() || *value == self.default {
            if store.has(&file) {
                store.delete(&file)?;
                self.maintain_groups(home, store, group, false)?;
            }
            return Ok(());
        }

        let bytes = serde_json::to_vec(value)?;
        let existed = store.has(&file);
        if existed {
            if store.get(&file)?.as_deref() == Some(bytes.as_slice()) {
                return Ok(());
            }
        }
        store.put(&file, bytes)?;
        if !existed {
            self.maintain_groups(home, store, group, true)?;
        }
        Ok(())
    }

    /// Propagate a group's (dis)appearance up the prefix hierarchy: each
    /// level's listing gains or loses the leaf name, cascading creation of
    /// newly non-empty listings and removal of newly empty ones.
    pub fn maintain_groups(
        &self,
        home: &Path,
        store: &mut Store,
        group: &str,
        exists: bool,
    ) -> Result<()> {
        let (prefix, leaf) = match group.rsplit_once('/') {
            Some((parent, leaf)) => (format!("{}/", parent), leaf.to_string()),
            None => (String::new(), group.to_string()),
        };
        let file = self.dir(home).join(format!("{}groups.json", prefix));

        let had_file = store.has(&file);
        let mut listing: Vec<String> = match store.get(&file)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };

        let changed = if exists {
            match listing.binary_search(&leaf) {
                Err(position) => {
                    listing.insert(position, leaf);
                    true
                }
                Ok(_) => false,
            }
        } else {
            match listing.binary_search(&leaf) {
                Ok(position) => {
                    listing.remove(position);
                    true
                }
                Err(_) => false,
            }
        };
        if !changed {
            return Ok(());
        }

        if listing.is_empty() {
            store.delete(&file)?;
            if !prefix.is_empty() {
                self.maintain_groups(home, store, prefix.trim_end_matches('/'), false)?;
            }
        } else {
            store.put(&file, serde_json::to_vec(&listing)?)?;
            if !prefix.is_empty() && !had_file {
                self.maintain_groups(home, store, prefix.trim_end_matches('/'), true)?;
            }
        }
        Ok(())
    }

    /// Block until this report (or the global refresh marker) has seen at
    /// least `min_version`, polling with increasing backoff. Gives
    /// read-your-writes consistency without taking the writer lock.
    pub fn wait_for_version(
        &self,
        home: &Path,
        store: &mut Store,
        min_version: &str,
    ) -> Result<()> {
        if !version_pattern().is_match(min_version) {
            return Err(VellumError::Schema(format!(
                "not a version hash: {:?}",
                min_version
            )));
        }
        let target = engine::version_number(home, store, min_version)?;

        let own_file = self.version_file(home);
        let global_file = home.join("reports").join("version.dat");
        let mut stalled_at = engine::genesis();

        for attempt in 0..=BACKOFF_MS.len() {
            store.forget(&own_file);
            store.forget(&global_file);

            let mut current = 0;
            for file in [&own_file, &global_file] {
                let hash = match store.get_string(file)? {
                    Some(raw) => raw.trim().to_string(),
                    None => continue,
                };
                let number = match engine::version_number(home, store, &hash) {
                    Ok(number) => number,
                    Err(VellumError::NotFound { .. }) => 0,
                    Err(e) => return Err(e),
                };
                if number >= current {
                    current = number;
                    stalled_at = hash;
                }
            }
            if current >= target {
                return Ok(());
            }

            if attempt < BACKOFF_MS.len() {
                std::thread::sleep(std::time::Duration::from_millis(BACKOFF_MS[attempt]));
            }
        }

        Err(VellumError::VersionTimeout {
            version: min_version.to_string(),
            stalled_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn report() -> Report {
        Report::new("by_letter")
    }

    fn groups_of(report: &Report, home: &Path, store: &mut Store, prefix: &str) -> Vec<String> {
        report.groups(home, store, prefix, None).unwrap()
    }

    #[test]
    fn test_missing_group_reads_default() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let report = report();

        assert_eq!(
            report.get(tmp.path(), &mut store, "A", None).unwrap(),
            json!([])
        );
    }

    #[test]
    fn test_invalid_group_name_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let report = report();

        let err = report
            .get(tmp.path(), &mut store, "../escape", None)
            .unwrap_err();
        assert!(matches!(err, VellumError::Schema(_)));
    }

    #[test]
    fn test_upsert_replaces_by_identity() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path();
        let mut store = Store::new();
        let report = report();

        let ann = json!({ "type": "user", "id": "u1", "name": "Ann" });
        report.upsert(home, &mut store, "A", &ann).unwrap();
        report.upsert(home, &mut store, "A", &ann).unwrap();

        let renamed = json!({ "type": "user", "id": "u1", "name": "Anne" });
        report.upsert(home, &mut store, "A", &renamed).unwrap();

        assert_eq!(
            report.get(home, &mut store, "A", None).unwrap(),
            json!([{ "type": "user", "id": "u1", "name": "Anne" }])
        );
    }

    #[test]
    fn test_sorter_orders_entries() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path();
        let mut store = Store::new();
        let report = report().sorter(Arc::new(|a, b| {
            let key = |v: &Value| v.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            key(a).cmp(&key(b))
        }));

        report
            .upsert(home, &mut store, "A", &json!({ "type": "user", "id": "u2", "name": "Ben" }))
            .unwrap();
        report
            .upsert(home, &mut store, "A", &json!({ "type": "user", "id": "u1", "name": "Ann" }))
            .unwrap();

        let group = report.get(home, &mut store, "A", None).unwrap();
        let names: Vec<&str> = group
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Ann", "Ben"]);
    }

    #[test]
    fn test_groups_index_tracks_leaf_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path();
        let mut store = Store::new();
        let report = report();

        let ann = json!({ "type": "user", "id": "u1" });
        report.upsert(home, &mut store, "A", &ann).unwrap();
        report
            .upsert(home, &mut store, "B", &json!({ "type": "user", "id": "u2" }))
            .unwrap();
        assert_eq!(groups_of(&report, home, &mut store, ""), vec!["A", "B"]);

        report.delete(home, &mut store, "A", "user", "u1").unwrap();
        assert_eq!(groups_of(&report, home, &mut store, ""), vec!["B"]);
        assert!(!report.has(home, &store, "A"));
    }

    #[test]
    fn test_nested_groups_cascade() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path();
        let mut store = Store::new();
        let report = report();

        let entry = json!({ "type": "user", "id": "u1" });
        report.upsert(home, &mut store, "2026/08/27", &entry).unwrap();

        assert_eq!(groups_of(&report, home, &mut store, ""), vec!["2026"]);
        assert_eq!(groups_of(&report, home, &mut store, "2026/"), vec!["08"]);
        assert_eq!(groups_of(&report, home, &mut store, "2026/08/"), vec!["27"]);

        report
            .delete(home, &mut store, "2026/08/27", "user", "u1")
            .unwrap();
        assert_eq!(groups_of(&report, home, &mut store, ""), Vec::<String>::new());
        assert!(!store.has(&home.join("reports/by_letter/2026/groups.json")));
    }

    #[test]
    fn test_noop_save_does_not_stage_writes() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path();
        let mut store = Store::new();
        let report = report();

        report
            .upsert(home, &mut store, "A", &json!({ "type": "user", "id": "u1" }))
            .unwrap();
        store.persist().unwrap();
        let baseline = store.dirty_count();

        report
            .save(home, &mut store, "A", &json!([{ "type": "user", "id": "u1" }]))
            .unwrap();
        assert_eq!(store.dirty_count(), baseline);
    }

    #[test]
    fn test_derived_flag() {
        assert!(!report().listen(Listen::linetype("user")).is_derived());
        assert!(report()
            .listen(Listen::report("source"))
            .handle(Arc::new(|_, _, _, _| Value::Null))
            .is_derived());
        assert!(!report().is_derived());
    }

    #[test]
    fn test_wait_rejects_malformed_version() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let err = report()
            .wait_for_version(tmp.path(), &mut store, "not-a-hash")
            .unwrap_err();
        assert!(matches!(err, VellumError::Schema(_)));
    }
}
