// Engine - the database handle tying everything together: the recursive
// import pipeline feeds affecteds into the staged store, the commit protocol
// extends the version hash chain under an exclusive lock, and the refresh
// pass replays the meta log to keep report views current.

use crate::error::{Result, VellumError};
use crate::line::Line;
use crate::link::{Direction, Link};
use crate::linetype::{self, fetch, Affected, Commits};
use crate::registry::Registry;
use crate::report::{validate_group, Source};
use crate::sequence::take_a_number;
use crate::store::Store;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Iteration cap for the derived-report fixed point; the report graph is
/// expected acyclic, so hitting this means a cycle.
const DERIVED_ITERATION_CAP: usize = 100;

/// The well-known hash the version chain starts from.
pub fn genesis() -> String {
    hex::encode(Sha256::digest(b"vellum"))
}

/// Resolve a version hash to its sequence number through the side index.
pub(crate) fn version_number(home: &Path, store: &mut Store, version: &str) -> Result<u64> {
    if version == genesis() {
        return Ok(0);
    }
    match store.get_string(&home.join("versions").join(version))? {
        Some(raw) => raw.trim().parse().map_err(|_| {
            VellumError::Schema(format!("unparseable version index entry for {}", version))
        }),
        None => Err(VellumError::NotFound {
            table: "versions".to_string(),
            id: version.to_string(),
        }),
    }
}

// ── Meta markers ────────────────────────────────────────────────────────────

enum Marker {
    Entity {
        sign: char,
        table: String,
        id: String,
    },
    Relation {
        relation: String,
        left: String,
        right: String,
    },
}

fn parse_marker(token: &str) -> Result<Marker> {
    let unknown = || VellumError::UnknownAffectedAction(token.to_string());
    let sign = token.chars().next().ok_or_else(unknown)?;
    if !sign.is_ascii() {
        return Err(unknown());
    }
    let rest = &token[1..];

    match sign {
        '+' | '~' | '-' => {
            let (table, id) = rest.split_once(':').ok_or_else(unknown)?;
            Ok(Marker::Entity {
                sign,
                table: table.to_string(),
                id: id.to_string(),
            })
        }
        '>' | '<' => {
            let (relation, pair) = rest.split_once(':').ok_or_else(unknown)?;
            let (left, right) = pair.split_once(',').ok_or_else(unknown)?;
            Ok(Marker::Relation {
                relation: relation.to_string(),
                left: left.to_string(),
                right: right.to_string(),
            })
        }
        _ => Err(unknown()),
    }
}

fn marker_ids(marker: &Marker) -> Vec<&str> {
    match marker {
        Marker::Entity { id, .. } => vec![id],
        Marker::Relation { left, right, .. } => vec![left, right],
    }
}

/// Side-record of which groups a (report, linetype, id) currently sits in.
#[derive(Serialize, Deserialize, Default)]
struct Membership {
    groups: Vec<String>,
}

struct LockHandle {
    file: File,
    pin: String,
}

/// A handle on one database home directory. Holds the staged store through
/// which all reads and writes flow, and the schema registry shared across
/// handles.
pub struct Database {
    home: PathBuf,
    registry: Arc<Registry>,
    store: Store,
    lock: Option<LockHandle>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("home", &self.home)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

impl Database {
    pub fn open(home: impl Into<PathBuf>, registry: Arc<Registry>) -> Result<Self> {
        let home = home.into();
        std::fs::create_dir_all(&home)?;
        Ok(Database {
            home,
            registry,
            store: Store::new(),
            lock: None,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ── Versions ────────────────────────────────────────────────────────────

    /// The current head hash, or the genesis constant for a fresh database.
    pub fn version(&mut self) -> Result<String> {
        match self.store.get_string(&self.home.join("version.dat"))? {
            Some(raw) => Ok(raw.trim().to_string()),
            None => Ok(genesis()),
        }
    }

    pub fn version_number_of(&mut self, version: &str) -> Result<u64> {
        version_number(&self.home, &mut self.store, version)
    }

    // ── Locking ─────────────────────────────────────────────────────────────

    /// Take the exclusive cross-process writer lock, blocking until it is
    /// free. Returns the capability PIN required to unlock.
    pub fn lock(&mut self) -> Result<String> {
        if self.lock.is_some() {
            return Err(VellumError::LockAcquisitionFailed(
                "lock already held by this handle".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.home.join("touch.dat"))?;
        file.lock_exclusive()
            .map_err(|e| VellumError::LockAcquisitionFailed(e.to_string()))?;

        let pin = hex::encode(rand::random::<[u8; 16]>());
        debug!("writer lock acquired on {}", self.home.display());
        self.lock = Some(LockHandle {
            file,
            pin: pin.clone(),
        });
        Ok(pin)
    }

    pub fn unlock(&mut self, pin: &str) -> Result<()> {
        match &self.lock {
            Some(handle) if handle.pin == pin => self.release_lock(),
            Some(_) => Err(VellumError::LockOwnershipMismatch),
            None => Ok(()),
        }
    }

    fn release_lock(&mut self) -> Result<()> {
        if let Some(handle) = self.lock.take() {
            handle.file.unlock()?;
            debug!("writer lock released on {}", self.home.display());
        }
        Ok(())
    }

    // ── Import & commit ─────────────────────────────────────────────────────

    /// Import and commit at the current wall-clock time.
    pub fn save(&mut self, lines: Vec<Line>, base_version: Option<&str>) -> Result<Vec<Line>> {
        self.import(Utc::now(), lines, base_version, false, false)
    }

    /// Dry run: resolve the full pipeline, return the post-resolve lines,
    /// and discard the staged overlay so no file is touched.
    pub fn preview(&mut self, lines: Vec<Line>, base_version: Option<&str>) -> Result<Vec<Line>> {
        self.import(Utc::now(), lines, base_version, true, false)
    }

    /// Route a deletion through the import pipeline.
    pub fn delete(
        &mut self,
        linetype: &str,
        id: &str,
        base_version: Option<&str>,
    ) -> Result<Vec<Line>> {
        let mut line = Line::new();
        line.set_id(id);
        line.set("type", Value::String(linetype.to_string()));
        line.set("_is", Value::Bool(false));
        self.save(vec![line], base_version)
    }

    /// The full import pipeline: resolve the batch against a frozen
    /// pre-image, apply affecteds, and commit (or discard, for a dry run).
    /// Differential mode skips partial-update copy-forward, unfusing only
    /// the fields actually supplied.
    pub fn import(
        &mut self,
        timestamp: DateTime<Utc>,
        mut lines: Vec<Line>,
        base_version: Option<&str>,
        dry_run: bool,
        differential: bool,
    ) -> Result<Vec<Line>> {
        let registry = Arc::clone(&self.registry);
        let ts = timestamp.format(TIMESTAMP_FORMAT).to_string();
        match self.import_inner(&registry, &ts, &mut lines, base_version, dry_run, differential) {
            Ok(dredged) => Ok(dredged),
            Err(e) => {
                // No partial effects: a failed pass leaves disk untouched.
                self.store.reset();
                Err(e)
            }
        }
    }

    fn import_inner(
        &mut self,
        registry: &Registry,
        ts: &str,
        lines: &mut [Line],
        base_version: Option<&str>,
        dry_run: bool,
        differential: bool,
    ) -> Result<Vec<Line>> {
        let mut pre = self.store.frozen_snapshot();
        let mut affecteds = Vec::new();
        let mut commits = Commits::new();
        linetype::import_batch(
            registry,
            &self.home,
            &mut self.store,
            &mut pre,
            ts,
            lines,
            &mut affecteds,
            &mut commits,
            differential,
        )?;

        let mut meta = Vec::new();
        self.apply_affecteds(affecteds, &mut meta)?;

        let dredged = self.dredge(registry, lines)?;
        if dry_run {
            self.store.reset();
            return Ok(dredged);
        }

        self.commit(ts, commits, meta, base_version)?;
        Ok(dredged)
    }

    /// Apply queued side-effects in emission order, accumulating the meta
    /// markers describing what actually changed. Connect/disconnect are
    /// idempotent: an edge already in the target state emits no marker.
    fn apply_affecteds(&mut self, affecteds: Vec<Affected>, meta: &mut Vec<String>) -> Result<()> {
        let home = self.home.clone();
        for affected in affecteds {
            match affected {
                Affected::Save {
                    table,
                    id,
                    mut record,
                    was,
                } => {
                    let dirty = record.is_dirty();
                    record.save(&home, &mut self.store)?;
                    if dirty {
                        meta.push(format!("{}{}:{}", if was { '~' } else { '+' }, table, id));
                    }
                }
                Affected::Delete { table, id, record } => {
                    record.delete(&home, &mut self.store)?;
                    meta.push(format!("-{}:{}", table, id));
                }
                Affected::Connect {
                    relation,
                    left,
                    right,
                } => {
                    let mut forth = Link::new(&relation, &left, Direction::Forth);
                    if !forth.has(&home, &mut self.store, &right)? {
                        forth.add(&home, &mut self.store, &right)?;
                        forth.save(&home, &mut self.store)?;
                        let mut back = Link::new(&relation, &right, Direction::Back);
                        back.add(&home, &mut self.store, &left)?;
                        back.save(&home, &mut self.store)?;
                        meta.push(format!(">{}:{},{}", relation, left, right));
                    }
                }
                Affected::Disconnect {
                    relation,
                    left,
                    right,
                } => {
                    let mut forth = Link::new(&relation, &left, Direction::Forth);
                    if forth.has(&home, &mut self.store, &right)? {
                        forth.remove(&home, &mut self.store, &right)?;
                        forth.save(&home, &mut self.store)?;
                        let mut back = Link::new(&relation, &right, Direction::Back);
                        back.remove(&home, &mut self.store, &left)?;
                        back.save(&home, &mut self.store)?;
                        meta.push(format!("<{}:{},{}", relation, left, right));
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-fetch each submitted line from the staged overlay so callers see
    /// allocated ids, completed defaults and computed fields.
    fn dredge(&mut self, registry: &Registry, lines: &[Line]) -> Result<Vec<Line>> {
        let mut dredged = Vec::with_capacity(lines.len());
        for line in lines {
            let name = line
                .linetype()
                .ok_or_else(|| VellumError::UnrecognisedLinetype("(missing)".to_string()))?;
            let id = line
                .id()
                .ok_or_else(|| VellumError::MissingId(name.to_string()))?;
            if line.is_alive() {
                dredged.push(fetch(registry, &self.home, &mut self.store, name, id)?);
            } else {
                let mut gone = Line::new();
                gone.set_id(id);
                gone.set("type", Value::String(name.to_string()));
                gone.set("_is", Value::Bool(false));
                dredged.push(gone);
            }
        }
        Ok(dredged)
    }

    fn commit(
        &mut self,
        ts: &str,
        commits: Commits,
        meta: Vec<String>,
        base_version: Option<&str>,
    ) -> Result<()> {
        let payloads = linetype::nontrivial_payloads(commits);
        if payloads.is_empty() {
            debug!("no effective changes; discarding staged overlay");
            self.store.reset();
            return Ok(());
        }

        // Pure additions never conflict; anything touching existing state
        // needs a base version to check against.
        let mut created: HashSet<String> = HashSet::new();
        let mut modified: BTreeSet<String> = BTreeSet::new();
        for token in &meta {
            match parse_marker(token)? {
                Marker::Entity { sign: '+', id, .. } => {
                    created.insert(id);
                }
                Marker::Entity { id, .. } => {
                    modified.insert(id);
                }
                Marker::Relation { left, right, .. } => {
                    modified.insert(left);
                    modified.insert(right);
                }
            }
        }
        let modified: BTreeSet<String> = modified
            .into_iter()
            .filter(|id| !created.contains(id))
            .collect();
        if !modified.is_empty() && base_version.is_none() {
            return Err(VellumError::ConcurrentModification(
                "no base version supplied for an update".to_string(),
            ));
        }

        let acquired = self.lock.is_none();
        if acquired {
            self.lock()?;
        }
        let result = self.commit_locked(ts, payloads, meta, base_version, &modified);
        if acquired {
            let released = self.release_lock();
            result?;
            released
        } else {
            result
        }
    }

    fn commit_locked(
        &mut self,
        ts: &str,
        payloads: Vec<Value>,
        meta: Vec<String>,
        base_version: Option<&str>,
        modified: &BTreeSet<String>,
    ) -> Result<()> {
        let version_file = self.home.join("version.dat");
        self.store.forget(&version_file);
        let head = self.version()?;
        let head_number = self.version_number_of(&head)?;

        if let Some(base) = base_version {
            if base != head && !modified.is_empty() {
                let base_number = self.version_number_of(base)?;
                if base_number > head_number {
                    return Err(VellumError::ConcurrentModification(format!(
                        "base version {} is ahead of the head",
                        base
                    )));
                }
                // Replay the meta log between base and head; overlap with
                // this commit's modified set means somebody got there first.
                let meta_file = self.home.join("master.dat.meta");
                self.store.forget(&meta_file);
                let log = self.store.get_string(&meta_file)?.unwrap_or_default();
                for line in log
                    .lines()
                    .skip(base_number as usize)
                    .take((head_number - base_number) as usize)
                {
                    for token in line.split_whitespace().skip(1) {
                        let marker = parse_marker(token)?;
                        for id in marker_ids(&marker) {
                            if modified.contains(id) {
                                return Err(VellumError::ConcurrentModification(format!(
                                    "{} has been modified since version {}",
                                    id, base
                                )));
                            }
                        }
                    }
                }
            }
        }

        let export = format!("{} {}", ts, serde_json::to_string(&Value::Array(payloads))?);
        let mut hasher = Sha256::new();
        hasher.update(head.as_bytes());
        hasher.update(export.as_bytes());
        let new_head = hex::encode(hasher.finalize());
        let new_number = head_number + 1;

        // Record and link files go out first (default priority), then the
        // logs, then the index, and the head pointer very last - an external
        // reader never sees a version it cannot resolve.
        self.store.append_at(
            &self.home.join("master.dat"),
            format!("{} {}\n", new_head, export).as_bytes(),
            110,
        )?;
        self.store.append_at(
            &self.home.join("master.dat.meta"),
            format!("{} {}\n", new_head, meta.join(" ")).as_bytes(),
            120,
        )?;
        self.store.put_at(
            &self.home.join("versions").join(&new_head),
            new_number.to_string(),
            130,
        )?;
        self.store.put_at(&version_file, new_head.clone(), 140)?;
        self.store.persist()?;

        debug!("committed version {} ({})", new_number, new_head);
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub fn get(&mut self, linetype: &str, id: &str) -> Result<Line> {
        let registry = Arc::clone(&self.registry);
        fetch(&registry, &self.home, &mut self.store, linetype, id)
    }

    /// Allocate and persist the next id from the sequence.
    pub fn takeanumber(&mut self) -> Result<String> {
        let registry = Arc::clone(&self.registry);
        let (_, id) = take_a_number(registry.sequence(), &self.home, &mut self.store)?;
        self.store.persist()?;
        Ok(id)
    }

    pub fn group(
        &mut self,
        report: &str,
        group: &str,
        min_version: Option<&str>,
    ) -> Result<Value> {
        let registry = Arc::clone(&self.registry);
        let report = registry.report(report)?;
        report.get(&self.home, &mut self.store, group, min_version)
    }

    pub fn groups(
        &mut self,
        report: &str,
        prefix: &str,
        min_version: Option<&str>,
    ) -> Result<Vec<String>> {
        let registry = Arc::clone(&self.registry);
        let report = registry.report(report)?;
        report.groups(&self.home, &mut self.store, prefix, min_version)
    }

    // ── Refresh ─────────────────────────────────────────────────────────────

    /// Bring report views up to the current head by replaying the meta log
    /// since the last refresh, flood-filling related entities, re-grouping
    /// every affected line, then settling derived reports to a fixed point.
    pub fn refresh(&mut self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let acquired = self.lock.is_none();
        if acquired {
            self.lock()?;
        }
        let result = self.refresh_locked(&registry);
        if acquired {
            let released = self.release_lock();
            result?;
            released
        } else {
            result
        }
    }

    fn refresh_locked(&mut self, registry: &Registry) -> Result<()> {
        let version_file = self.home.join("version.dat");
        let global_file = self.home.join("reports").join("version.dat");
        self.store.forget(&version_file);
        self.store.forget(&global_file);

        let bunny = self.version()?;
        let greyhound = match self.store.get_string(&global_file)? {
            Some(raw) => raw.trim().to_string(),
            None => genesis(),
        };
        if greyhound == bunny {
            return Ok(());
        }
        let bunny_number = self.version_number_of(&bunny)?;
        let greyhound_number = self.version_number_of(&greyhound)?;
        if greyhound_number > bunny_number {
            warn!(
                "reports at version {} are ahead of the head {}; skipping refresh",
                greyhound_number, bunny_number
            );
            return Ok(());
        }

        // Raw changes from the meta log range. Connect/disconnect markers
        // seed both endpoints for re-evaluation without create/delete
        // semantics.
        let meta_file = self.home.join("master.dat.meta");
        self.store.forget(&meta_file);
        let log = self.store.get_string(&meta_file)?.unwrap_or_default();
        let mut changes: BTreeMap<(String, String), char> = BTreeMap::new();
        for line in log
            .lines()
            .skip(greyhound_number as usize)
            .take((bunny_number - greyhound_number) as usize)
        {
            for token in line.split_whitespace().skip(1) {
                match parse_marker(token)? {
                    Marker::Entity { sign, table, id } => {
                        for name in registry.linetypes_for_table(&table) {
                            changes.insert((name.to_string(), id.clone()), sign);
                        }
                    }
                    Marker::Relation {
                        relation,
                        left,
                        right,
                    } => {
                        let Some((forth, back)) = registry.relation_sides(&relation).cloned()
                        else {
                            warn!("meta marker references unknown relation {}", relation);
                            continue;
                        };
                        changes.entry((forth, left)).or_insert('*');
                        changes.entry((back, right)).or_insert('*');
                    }
                }
            }
        }

        // Flood-fill: a change can re-group anything transitively related,
        // in either direction.
        let mut queue: Vec<(String, String)> = changes.keys().cloned().collect();
        let mut seen: HashSet<(String, String)> = queue.iter().cloned().collect();
        while let Some((name, id)) = queue.pop() {
            let lt = registry.linetype(&name)?;
            let mut relatives: Vec<(String, String)> = Vec::new();

            for incoming in registry.incoming(&name) {
                let direction = if incoming.reverse {
                    Direction::Forth
                } else {
                    Direction::Back
                };
                let mut link = Link::new(&incoming.relation, &id, direction);
                for parent in link.relatives(&self.home, &mut self.store)? {
                    relatives.push((incoming.parent.clone(), parent));
                }
            }
            let specs = lt
                .children_specs()
                .iter()
                .map(|c| (c.linetype.clone(), c.relation.clone(), c.reverse))
                .chain(
                    lt.inline_specs()
                        .iter()
                        .map(|i| (i.linetype.clone(), i.relation.clone(), i.reverse)),
                );
            for (child_type, relation, reverse) in specs {
                let direction = if reverse {
                    Direction::Back
                } else {
                    Direction::Forth
                };
                let mut link = Link::new(&relation, &id, direction);
                for child in link.relatives(&self.home, &mut self.store)? {
                    relatives.push((child_type.clone(), child));
                }
            }

            for relative in relatives {
                if seen.insert(relative.clone()) {
                    changes.entry(relative.clone()).or_insert('*');
                    queue.push(relative);
                }
            }
        }

        // Re-group every affected line in every listening report, diffing
        // against the cached membership side-record.
        let mut touched_groups: BTreeSet<(String, String)> = BTreeSet::new();
        let mut touched_reports: BTreeSet<String> = BTreeSet::new();
        for (report_name, report) in registry.reports() {
            if report.is_derived() {
                continue;
            }
            for listen in report.listens() {
                let Source::Linetype(listen_type) = &listen.source else {
                    continue;
                };
                for ((change_type, id), sign) in &changes {
                    if change_type != listen_type {
                        continue;
                    }

                    let line = if *sign == '-' {
                        None
                    } else {
                        match fetch(registry, &self.home, &mut self.store, change_type, id) {
                            Ok(line) => Some(line),
                            Err(VellumError::NotFound { .. }) => None,
                            Err(e) => return Err(e),
                        }
                    };
                    let current: Vec<String> = match &line {
                        Some(line) => {
                            let mut groups = report.classify_line(listen, line);
                            for group in &groups {
                                validate_group(group)?;
                            }
                            groups.sort();
                            groups.dedup();
                            groups
                        }
                        None => Vec::new(),
                    };

                    let cache_file = self
                        .home
                        .join("reports")
                        .join(".refreshd")
                        .join("lines")
                        .join(report_name)
                        .join(change_type)
                        .join(format!("{}.json", id));
                    let past: Vec<String> = match self.store.get(&cache_file)? {
                        Some(bytes) => serde_json::from_slice::<Membership>(&bytes)?.groups,
                        None => Vec::new(),
                    };

                    for group in past.iter().filter(|g| !current.contains(g)) {
                        report.delete(&self.home, &mut self.store, group, change_type, id)?;
                        touched_groups.insert((report_name.clone(), group.clone()));
                    }
                    if let Some(line) = &line {
                        let value = line.as_value();
                        for group in &current {
                            report.upsert(&self.home, &mut self.store, group, &value)?;
                            touched_groups.insert((report_name.clone(), group.clone()));
                        }
                    }

                    if current.is_empty() {
                        if self.store.has(&cache_file) {
                            self.store.delete(&cache_file)?;
                        }
                    } else if past != current {
                        self.store
                            .put(&cache_file, serde_json::to_vec(&Membership { groups: current })?)?;
                    }
                    touched_reports.insert(report_name.clone());
                }
            }
        }

        self.refresh_derived(registry, touched_groups, &mut touched_reports)?;

        for name in &touched_reports {
            let file = self.home.join("reports").join(name).join("version.dat");
            self.store.put_at(&file, bunny.clone(), 140)?;
        }
        self.store.put_at(&global_file, bunny.clone(), 140)?;
        self.store.persist()?;
        debug!("reports refreshed to version {}", bunny_number);
        Ok(())
    }

    /// Settle derived reports: each changed (report, group) feeds every
    /// derived report listening on it, whose output groups feed the next
    /// iteration, until no new changes are produced.
    fn refresh_derived(
        &mut self,
        registry: &Registry,
        mut changed: BTreeSet<(String, String)>,
        touched_reports: &mut BTreeSet<String>,
    ) -> Result<()> {
        for _ in 0..DERIVED_ITERATION_CAP {
            if changed.is_empty() {
                return Ok(());
            }
            let mut next: BTreeSet<(String, String)> = BTreeSet::new();

            for (report_name, report) in registry.reports() {
                if !report.is_derived() {
                    continue;
                }
                let Some(handler) = report.handler() else {
                    return Err(VellumError::Schema(format!(
                        "derived report {} has no handler",
                        report_name
                    )));
                };
                for listen in report.listens() {
                    let Source::Report(source_name) = &listen.source else {
                        continue;
                    };
                    let source = registry.report(source_name)?;
                    for (changed_report, changed_group) in &changed {
                        if changed_report != source_name {
                            continue;
                        }
                        let source_value =
                            source.get(&self.home, &mut self.store, changed_group, None)?;
                        for target in listen.target_groups(changed_group) {
                            validate_group(&target)?;
                            let current =
                                report.get(&self.home, &mut self.store, &target, None)?;
                            let new = handler(&source_value, &current, source_name, changed_group);
                            if new == current {
                                continue;
                            }
                            report.save(&self.home, &mut self.store, &target, &new)?;
                            next.insert((report_name.clone(), target));
                            touched_reports.insert(report_name.clone());
                        }
                    }
                }
            }

            changed = next;
        }

        if changed.is_empty() {
            Ok(())
        } else {
            Err(VellumError::Schema(
                "derived report graph did not settle; is it cyclic?".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linetype::{ChildSpec, InlineSpec, Linetype};
    use crate::report::{Listen, Report};
    use crate::testutil::{self, line};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn db_in(tmp: &TempDir) -> Database {
        Database::open(tmp.path().join("db"), testutil::registry()).unwrap()
    }

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + offset, 0).unwrap()
    }

    fn save_at(
        db: &mut Database,
        offset: i64,
        lines: Vec<Line>,
        base: Option<&str>,
    ) -> Result<Vec<Line>> {
        db.import(ts(offset), lines, base, false, false)
    }

    #[test]
    fn test_create_line_allocates_id_and_advances_version() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        assert_eq!(db.version().unwrap(), genesis());

        let lines = db
            .save(vec![line(json!({ "type": "user", "name": "Ann" }))], None)
            .unwrap();
        let ann = &lines[0];
        assert!(!ann.id().unwrap().is_empty());
        assert_eq!(ann.get("name"), Some(&json!("Ann")));

        let head = db.version().unwrap();
        assert_ne!(head, genesis());
        assert_eq!(head.len(), 64);
        assert!(head.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(db.version_number_of(&head).unwrap(), 1);
    }

    #[test]
    fn test_version_chain_is_deterministic() {
        let run = |tmp: &TempDir| -> Vec<String> {
            let mut db = db_in(tmp);
            let mut heads = Vec::new();
            let lines = save_at(
                &mut db,
                0,
                vec![line(json!({ "type": "user", "name": "Ann" }))],
                None,
            )
            .unwrap();
            heads.push(db.version().unwrap());
            let id = lines[0].id().unwrap().to_string();
            let base = heads[0].clone();
            save_at(
                &mut db,
                60,
                vec![line(json!({ "type": "user", "id": id, "name": "Annie" }))],
                Some(&base),
            )
            .unwrap();
            heads.push(db.version().unwrap());
            heads
        };

        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        assert_eq!(run(&first), run(&second));
    }

    #[test]
    fn test_noop_commit_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(vec![line(json!({ "type": "user", "name": "Ann" }))], None)
            .unwrap();
        let id = lines[0].id().unwrap().to_string();
        let head = db.version().unwrap();
        let master = std::fs::read_to_string(db.home().join("master.dat")).unwrap();

        db.save(
            vec![line(json!({ "type": "user", "id": id, "name": "Ann" }))],
            Some(&head),
        )
        .unwrap();

        assert_eq!(db.version().unwrap(), head);
        assert_eq!(
            std::fs::read_to_string(db.home().join("master.dat")).unwrap(),
            master
        );
    }

    #[test]
    fn test_partial_update_preserves_omitted_fields() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(
                vec![line(
                    json!({ "type": "user", "name": "Ann", "email": "ann@example.com" }),
                )],
                None,
            )
            .unwrap();
        let id = lines[0].id().unwrap().to_string();
        let head = db.version().unwrap();

        db.save(
            vec![line(json!({ "type": "user", "id": id, "name": "Annie" }))],
            Some(&head),
        )
        .unwrap();

        let ann = db.get("user", &id).unwrap();
        assert_eq!(ann.get("name"), Some(&json!("Annie")));
        assert_eq!(ann.get("email"), Some(&json!("ann@example.com")));
    }

    #[test]
    fn test_update_without_base_version_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(vec![line(json!({ "type": "user", "name": "Ann" }))], None)
            .unwrap();
        let id = lines[0].id().unwrap().to_string();

        let err = db
            .save(
                vec![line(json!({ "type": "user", "id": id, "name": "Annie" }))],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, VellumError::ConcurrentModification(_)));
    }

    #[test]
    fn test_conflicting_update_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(vec![line(json!({ "type": "user", "name": "Ann" }))], None)
            .unwrap();
        let id = lines[0].id().unwrap().to_string();
        let base = db.version().unwrap();

        db.save(
            vec![line(json!({ "type": "user", "id": id, "name": "Anne" }))],
            Some(&base),
        )
        .unwrap();

        // Second writer, same entity, same stale base.
        let err = db
            .save(
                vec![line(json!({ "type": "user", "id": id, "name": "Annie" }))],
                Some(&base),
            )
            .unwrap_err();
        assert!(matches!(err, VellumError::ConcurrentModification(_)));
        // Nothing from the failed pass leaked to disk.
        assert_eq!(db.get("user", &id).unwrap().get("name"), Some(&json!("Anne")));
    }

    #[test]
    fn test_disjoint_updates_from_same_base_succeed() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(
                vec![
                    line(json!({ "type": "user", "name": "Ann" })),
                    line(json!({ "type": "user", "name": "Bob" })),
                ],
                None,
            )
            .unwrap();
        let ann = lines[0].id().unwrap().to_string();
        let bob = lines[1].id().unwrap().to_string();
        let base = db.version().unwrap();

        db.save(
            vec![line(json!({ "type": "user", "id": ann, "name": "Anne" }))],
            Some(&base),
        )
        .unwrap();
        db.save(
            vec![line(json!({ "type": "user", "id": bob, "name": "Rob" }))],
            Some(&base),
        )
        .unwrap();

        let head = db.version().unwrap();
        assert_eq!(db.version_number_of(&head).unwrap(), 3);
    }

    #[test]
    fn test_nested_children_linked_both_ways() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(
                vec![line(json!({
                    "type": "user",
                    "name": "Ann",
                    "posts": [{ "title": "hello" }, { "title": "again" }],
                }))],
                None,
            )
            .unwrap();

        let ann = &lines[0];
        let posts = ann.get("posts").unwrap().as_array().unwrap();
        assert_eq!(posts.len(), 2);
        let post_id = posts[0]["id"].as_str().unwrap();

        let post = db.get("post", post_id).unwrap();
        assert_eq!(post.get("user"), Some(&json!(ann.id().unwrap())));
    }

    #[test]
    fn test_adopt_and_disown() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(
                vec![
                    line(json!({ "type": "user", "name": "Ann" })),
                    line(json!({ "type": "post", "title": "stray" })),
                ],
                None,
            )
            .unwrap();
        let user_id = lines[0].id().unwrap().to_string();
        let post_id = lines[1].id().unwrap().to_string();
        let base = db.version().unwrap();

        db.save(
            vec![line(json!({
                "type": "user", "id": user_id,
                "_adopt": { "posts": [post_id] },
            }))],
            Some(&base),
        )
        .unwrap();
        assert_eq!(
            db.get("post", &post_id).unwrap().get("user"),
            Some(&json!(user_id))
        );

        let base = db.version().unwrap();
        db.save(
            vec![line(json!({
                "type": "user", "id": user_id,
                "_disown": { "posts": [post_id] },
            }))],
            Some(&base),
        )
        .unwrap();
        assert_eq!(db.get("post", &post_id).unwrap().get("user"), None);
    }

    #[test]
    fn test_delete_disconnects_but_keeps_children() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);
        let lines = db
            .save(
                vec![line(json!({
                    "type": "user", "name": "Ann",
                    "posts": [{ "title": "kept" }],
                }))],
                None,
            )
            .unwrap();
        let user_id = lines[0].id().unwrap().to_string();
        let post_id = lines[0].get("posts").unwrap()[0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let base = db.version().unwrap();

        db.delete("user", &user_id, Some(&base)).unwrap();

        let err = db.get("user", &user_id).unwrap_err();
        assert!(matches!(err, VellumError::NotFound { .. }));
        let post = db.get("post", &post_id).unwrap();
        assert_eq!(post.get("title"), Some(&json!("kept")));
        assert_eq!(post.get("user"), None);
    }

    #[test]
    fn test_cascade_delete_removes_children() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(
            testutil::base_builder(
                testutil::user_linetype()
                    .child(ChildSpec::new("posts", "post", "user_post").alias("user").cascade()),
            )
            .build()
            .unwrap(),
        );
        let mut db = Database::open(tmp.path().join("db"), registry).unwrap();

        let lines = db
            .save(
                vec![line(json!({
                    "type": "user", "name": "Ann",
                    "posts": [{ "title": "doomed" }],
                }))],
                None,
            )
            .unwrap();
        let user_id = lines[0].id().unwrap().to_string();
        let post_id = lines[0].get("posts").unwrap()[0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let base = db.version().unwrap();

        db.delete("user", &user_id, Some(&base)).unwrap();
        assert!(matches!(
            db.get("post", &post_id).unwrap_err(),
            VellumError::NotFound { .. }
        ));
    }

    #[test]
    fn test_inline_child_folds_into_parent() {
        let tmp = TempDir::new().unwrap();
        let profile = testutil::scalar(Linetype::new("profile"), "bio");
        let user = testutil::user_linetype()
            .inline(InlineSpec::new("profile", "profile", "user_profile"))
            .field(
                "bio",
                Arc::new(|records| Ok(records.field("/profile", "bio"))),
            );
        let registry = Arc::new(
            crate::registry::RegistryBuilder::new(testutil::sequence())
                .linetype(user)
                .linetype(testutil::post_linetype())
                .linetype(profile)
                .build()
                .unwrap(),
        );
        let mut db = Database::open(tmp.path().join("db"), registry).unwrap();

        let lines = db
            .save(
                vec![line(json!({
                    "type": "user", "name": "Ann",
                    "profile": { "bio": "hello" },
                }))],
                None,
            )
            .unwrap();
        let ann = &lines[0];
        assert_eq!(ann.get("bio"), Some(&json!("hello")));
        let user_id = ann.id().unwrap().to_string();

        // The inline record is its own entity behind the relation.
        let mut probe = Store::new();
        let mut link = Link::new("user_profile", &user_id, Direction::Forth);
        let profile_id = link.first_child(db.home(), &mut probe).unwrap().unwrap();
        assert_eq!(
            db.get("profile", &profile_id).unwrap().get("bio"),
            Some(&json!("hello"))
        );

        // Deleting the parent takes the non-orphanable inline child with it.
        let base = db.version().unwrap();
        db.delete("user", &user_id, Some(&base)).unwrap();
        assert!(matches!(
            db.get("profile", &profile_id).unwrap_err(),
            VellumError::NotFound { .. }
        ));
    }

    #[test]
    fn test_preview_touches_no_files() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);

        let lines = db
            .preview(vec![line(json!({ "type": "user", "name": "Ann" }))], None)
            .unwrap();
        assert!(lines[0].id().is_some());
        assert_eq!(lines[0].get("name"), Some(&json!("Ann")));

        assert_eq!(db.version().unwrap(), genesis());
        assert!(!db.home().join("records").exists());
        assert!(!db.home().join("pointer.dat").exists());
    }

    #[test]
    fn test_takeanumber_allocates_distinct_ids() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);

        let first = db.takeanumber().unwrap();
        let second = db.takeanumber().unwrap();
        assert_ne!(first, second);
        assert_eq!(
            std::fs::read_to_string(db.home().join("pointer.dat")).unwrap(),
            "3"
        );
    }

    #[test]
    fn test_unlock_requires_matching_pin() {
        let tmp = TempDir::new().unwrap();
        let mut db = db_in(&tmp);

        let pin = db.lock().unwrap();
        let err = db.unlock("0000").unwrap_err();
        assert!(matches!(err, VellumError::LockOwnershipMismatch));
        db.unlock(&pin).unwrap();
    }

    fn letter_registry() -> Arc<Registry> {
        let by_letter = Report::new("users_by_letter")
            .listen(Listen::linetype("user"))
            .classify(Arc::new(|line: &Line| {
                match line.get("name").and_then(Value::as_str).and_then(|n| n.chars().next()) {
                    Some(first) => vec![first.to_uppercase().to_string()],
                    None => vec![],
                }
            }));
        let counts = Report::new("letter_counts")
            .listen(Listen::report("users_by_letter"))
            .default(Value::Null)
            .handle(Arc::new(|source: &Value, _, _, _| {
                match source.as_array().map(Vec::len).unwrap_or(0) {
                    0 => Value::Null,
                    n => json!(n),
                }
            }));
        Arc::new(
            testutil::builder()
                .report(by_letter)
                .report(counts)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_first_letter_report_scenario() {
        let tmp = TempDir::new().unwrap();
        let mut db = Database::open(tmp.path().join("db"), letter_registry()).unwrap();

        let lines = db
            .save(
                vec![
                    line(json!({ "type": "user", "name": "Ann" })),
                    line(json!({ "type": "user", "name": "Bob" })),
                ],
                None,
            )
            .unwrap();
        db.refresh().unwrap();

        let head = db.version().unwrap();
        assert_eq!(
            db.groups("users_by_letter", "", Some(&head)).unwrap(),
            vec!["A", "B"]
        );
        let group = db.group("users_by_letter", "A", None).unwrap();
        assert_eq!(group[0]["name"], json!("Ann"));

        let ann = lines[0].id().unwrap().to_string();
        db.delete("user", &ann, Some(&head)).unwrap();
        db.refresh().unwrap();
        assert_eq!(db.groups("users_by_letter", "", None).unwrap(), vec!["B"]);
    }

    #[test]
    fn test_refresh_at_head_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut db = Database::open(tmp.path().join("db"), letter_registry()).unwrap();
        db.save(vec![line(json!({ "type": "user", "name": "Ann" }))], None)
            .unwrap();

        db.refresh().unwrap();
        let groups_before = db.groups("users_by_letter", "", None).unwrap();
        let marker = std::fs::read_to_string(db.home().join("reports/version.dat")).unwrap();

        db.refresh().unwrap();
        assert_eq!(db.groups("users_by_letter", "", None).unwrap(), groups_before);
        assert_eq!(
            std::fs::read_to_string(db.home().join("reports/version.dat")).unwrap(),
            marker
        );
    }

    #[test]
    fn test_derived_report_follows_source() {
        let tmp = TempDir::new().unwrap();
        let mut db = Database::open(tmp.path().join("db"), letter_registry()).unwrap();

        let lines = db
            .save(
                vec![
                    line(json!({ "type": "user", "name": "Ann" })),
                    line(json!({ "type": "user", "name": "Alfie" })),
                    line(json!({ "type": "user", "name": "Bob" })),
                ],
                None,
            )
            .unwrap();
        db.refresh().unwrap();

        assert_eq!(db.group("letter_counts", "A", None).unwrap(), json!(2));
        assert_eq!(db.group("letter_counts", "B", None).unwrap(), json!(1));

        let ann = lines[0].id().unwrap().to_string();
        let base = db.version().unwrap();
        db.delete("user", &ann, Some(&base)).unwrap();
        db.refresh().unwrap();

        assert_eq!(db.group("letter_counts", "A", None).unwrap(), json!(1));
        assert_eq!(
            db.groups("letter_counts", "", None).unwrap(),
            vec!["A", "B"]
        );
    }

    #[test]
    fn test_refresh_reclassifies_on_rename() {
        let tmp = TempDir::new().unwrap();
        let mut db = Database::open(tmp.path().join("db"), letter_registry()).unwrap();

        let lines = db
            .save(vec![line(json!({ "type": "user", "name": "Ann" }))], None)
            .unwrap();
        db.refresh().unwrap();
        assert_eq!(db.groups("users_by_letter", "", None).unwrap(), vec!["A"]);

        let id = lines[0].id().unwrap().to_string();
        let base = db.version().unwrap();
        db.save(
            vec![line(json!({ "type": "user", "id": id, "name": "Zoe" }))],
            Some(&base),
        )
        .unwrap();
        db.refresh().unwrap();

        assert_eq!(db.groups("users_by_letter", "", None).unwrap(), vec!["Z"]);
        assert_eq!(db.group("letter_counts", "Z", None).unwrap(), json!(1));
        assert_eq!(db.group("letter_counts", "A", None).unwrap(), Value::Null);
    }
}
