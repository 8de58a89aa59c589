// Linetype - the schema layer. A linetype describes how a logical line is
// assembled from records and links (field getters, parent aliases, child
// collections) and how a submitted line is decomposed back into record
// field mutations and relationship deltas (the import pipeline).

use crate::error::{Result, VellumError};
use crate::line::{is_scalar, Line};
use crate::link::{Direction, Link};
use crate::record::{Record, RecordFormat};
use crate::registry::Registry;
use crate::sequence::take_a_number;
use crate::store::Store;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Relation graphs are expected acyclic; this bound turns an accidental
/// cycle into an error instead of a stack overflow.
const MAX_DEPTH: usize = 32;

// ── Record set ──────────────────────────────────────────────────────────────

/// The records backing one line during assembly, keyed by path: `/` for the
/// primary record, `/{property}` for an inline-nested child record.
#[derive(Debug, Default)]
pub struct RecordSet(BTreeMap<String, Map<String, Value>>);

impl RecordSet {
    pub fn insert(&mut self, path: &str, record: Map<String, Value>) {
        self.0.insert(path.to_string(), record);
    }

    pub fn get(&self, path: &str) -> Option<&Map<String, Value>> {
        self.0.get(path)
    }

    pub fn field(&self, path: &str, name: &str) -> Value {
        self.0
            .get(path)
            .and_then(|record| record.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn root_field(&self, name: &str) -> Value {
        self.field("/", name)
    }
}

// ── Schema closures ─────────────────────────────────────────────────────────

/// Computes a line field from the assembled record set.
pub type FieldGetter = Arc<dyn Fn(&RecordSet) -> Result<Value> + Send + Sync>;

/// The inverse of a getter: derives the stored value for one record field
/// from the submitted line (and its pre-image, when one exists).
pub type FieldSetter = Arc<dyn Fn(&Line, Option<&Line>) -> Result<Value> + Send + Sync>;

/// Returns an error message when the line is invalid.
pub type Validator = Arc<dyn Fn(&Line) -> Option<String> + Send + Sync>;

/// Fills in defaults for omitted fields, in place.
pub type Completion = Arc<dyn Fn(&mut Line) + Send + Sync>;

/// Computes a field from the line itself rather than the record set.
pub type BorrowGetter = Arc<dyn Fn(&Line) -> Result<Value> + Send + Sync>;

// ── Relation specs ──────────────────────────────────────────────────────────

/// A child collection: lines of `linetype` connected through `relation`,
/// surfaced on the parent under `property`.
#[derive(Clone)]
pub struct ChildSpec {
    pub property: String,
    pub linetype: String,
    pub relation: String,
    /// When set, the parent is on the back side of the relation.
    pub reverse: bool,
    /// The field on the child line holding the parent's id.
    pub alias: Option<String>,
    /// Delete children along with the parent instead of just disconnecting.
    pub cascade_delete: bool,
}

impl ChildSpec {
    pub fn new(property: &str, linetype: &str, relation: &str) -> Self {
        ChildSpec {
            property: property.to_string(),
            linetype: linetype.to_string(),
            relation: relation.to_string(),
            reverse: false,
            alias: None,
            cascade_delete: false,
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn cascade(mut self) -> Self {
        self.cascade_delete = true;
        self
    }
}

/// An inline-nested sub-record: a single related line whose record is folded
/// into the parent's record set at assembly time and split back out on import.
#[derive(Clone)]
pub struct InlineSpec {
    pub property: String,
    pub linetype: String,
    pub relation: String,
    pub reverse: bool,
    /// Orphanable inline children survive their parent's deletion.
    pub orphanable: bool,
}

impl InlineSpec {
    pub fn new(property: &str, linetype: &str, relation: &str) -> Self {
        InlineSpec {
            property: property.to_string(),
            linetype: linetype.to_string(),
            relation: relation.to_string(),
            reverse: false,
            orphanable: false,
        }
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn orphanable(mut self) -> Self {
        self.orphanable = true;
        self
    }
}

/// Forth/back endpoint ordering for a parent-child connection.
fn endpoints(reverse: bool, parent: &str, child: &str) -> (String, String) {
    if reverse {
        (child.to_string(), parent.to_string())
    } else {
        (parent.to_string(), child.to_string())
    }
}

fn parent_side(reverse: bool) -> Direction {
    if reverse {
        Direction::Back
    } else {
        Direction::Forth
    }
}

fn child_side(reverse: bool) -> Direction {
    parent_side(reverse).reverse()
}

// ── Linetype descriptor ─────────────────────────────────────────────────────

/// Schema and behavior for one kind of line. Built once, registered, and
/// shared read-only.
#[derive(Clone)]
pub struct Linetype {
    name: String,
    table: String,
    fields: Vec<(String, FieldGetter)>,
    unfuse: Vec<(String, FieldSetter)>,
    validations: Vec<Validator>,
    completions: Vec<Completion>,
    borrows: Vec<(String, BorrowGetter)>,
    children: Vec<ChildSpec>,
    inlines: Vec<InlineSpec>,
}

impl std::fmt::Debug for Linetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linetype")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("children", &self.children.iter().map(|c| &c.property).collect::<Vec<_>>())
            .finish()
    }
}

impl Linetype {
    /// The table defaults to the linetype name.
    pub fn new(name: &str) -> Self {
        Linetype {
            name: name.to_string(),
            table: name.to_string(),
            fields: Vec::new(),
            unfuse: Vec::new(),
            validations: Vec::new(),
            completions: Vec::new(),
            borrows: Vec::new(),
            children: Vec::new(),
            inlines: Vec::new(),
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn field(mut self, name: &str, getter: FieldGetter) -> Self {
        self.fields.push((name.to_string(), getter));
        self
    }

    pub fn unfuse(mut self, name: &str, setter: FieldSetter) -> Self {
        self.unfuse.push((name.to_string(), setter));
        self
    }

    pub fn validate(mut self, validator: Validator) -> Self {
        self.validations.push(validator);
        self
    }

    pub fn complete(mut self, completion: Completion) -> Self {
        self.completions.push(completion);
        self
    }

    pub fn borrow(mut self, name: &str, getter: BorrowGetter) -> Self {
        self.borrows.push((name.to_string(), getter));
        self
    }

    pub fn child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    pub fn inline(mut self, spec: InlineSpec) -> Self {
        self.inlines.push(spec);
        self
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }

    pub fn table_str(&self) -> &str {
        &self.table
    }

    pub fn children_specs(&self) -> &[ChildSpec] {
        &self.children
    }

    pub fn inline_specs(&self) -> &[InlineSpec] {
        &self.inlines
    }

    fn known_fields(&self, registry: &Registry) -> HashSet<String> {
        let mut known: HashSet<String> = self.fields.iter().map(|(n, _)| n.clone()).collect();
        known.extend(self.unfuse.iter().map(|(n, _)| n.clone()));
        known.extend(self.borrows.iter().map(|(n, _)| n.clone()));
        for incoming in registry.incoming(&self.name) {
            if let Some(alias) = &incoming.alias {
                known.insert(alias.clone());
            }
        }
        known
    }
}

// ── Assembly ────────────────────────────────────────────────────────────────

/// Assemble the full line for (linetype, id), child collections included.
pub fn fetch(
    registry: &Registry,
    home: &Path,
    store: &mut Store,
    name: &str,
    id: &str,
) -> Result<Line> {
    assemble(registry, home, store, name, id, true, 0)
}

pub(crate) fn assemble(
    registry: &Registry,
    home: &Path,
    store: &mut Store,
    name: &str,
    id: &str,
    with_children: bool,
    depth: usize,
) -> Result<Line> {
    if depth > MAX_DEPTH {
        return Err(VellumError::Schema(format!(
            "relation graph too deep assembling {}/{}",
            name, id
        )));
    }

    let linetype = registry.linetype(name)?;
    let info = registry.table_info(linetype.table_str());

    let mut records = RecordSet::default();
    let mut primary = Record::new(linetype.table_str(), Some(id), &info);
    records.insert("/", primary.to_map(home, store)?);

    for spec in linetype.inline_specs() {
        let mut link = Link::new(&spec.relation, id, parent_side(spec.reverse));
        if let Some(child_id) = link.first_child(home, store)? {
            let child_type = registry.linetype(&spec.linetype)?;
            let child_info = registry.table_info(child_type.table_str());
            let mut record = Record::new(child_type.table_str(), Some(&child_id), &child_info);
            records.insert(&format!("/{}", spec.property), record.to_map(home, store)?);
        }
    }

    let mut line = Line::new();
    line.set_id(id);
    line.set("type", Value::String(name.to_string()));

    for (field, getter) in &linetype.fields {
        let value = getter(&records)?;
        if !value.is_null() {
            line.set(field, value);
        }
    }

    for incoming in registry.incoming(name) {
        let Some(alias) = &incoming.alias else { continue };
        let mut link = Link::new(&incoming.relation, id, child_side(incoming.reverse));
        if let Some(parent) = link.first_child(home, store)? {
            line.set(alias, Value::String(parent));
        }
    }

    for (field, getter) in &linetype.borrows {
        let value = getter(&line)?;
        if !value.is_null() {
            line.set(field, value);
        }
    }

    if with_children {
        for spec in linetype.children_specs() {
            let mut link = Link::new(&spec.relation, id, parent_side(spec.reverse));
            let mut children = Vec::new();
            for child_id in link.relatives(home, store)? {
                let child =
                    assemble(registry, home, store, &spec.linetype, &child_id, true, depth + 1)?;
                children.push(child.into_value());
            }
            line.set(&spec.property, Value::Array(children));
        }
    }

    Ok(line)
}

// ── Affecteds and commit payloads ───────────────────────────────────────────

/// A queued side-effect produced during import, applied after every line in
/// the batch has been resolved.
#[derive(Debug)]
pub enum Affected {
    Save {
        table: String,
        id: String,
        record: Record,
        was: bool,
    },
    Delete {
        table: String,
        id: String,
        record: Record,
    },
    Connect {
        relation: String,
        left: String,
        right: String,
    },
    Disconnect {
        relation: String,
        left: String,
        right: String,
    },
}

/// Per-entity commit payloads, in first-touch order.
#[derive(Debug, Default)]
pub struct Commits {
    entries: Vec<(String, Line)>,
}

impl Commits {
    pub fn new() -> Self {
        Commits::default()
    }

    pub fn entry_mut(&mut self, id: &str) -> &mut Line {
        if let Some(position) = self.entries.iter().position(|(eid, _)| eid == id) {
            return &mut self.entries[position].1;
        }
        let mut line = Line::new();
        line.set_id(id);
        self.entries.push((id.to_string(), line));
        // Just pushed, so the list cannot be empty.
        let last = self.entries.len() - 1;
        &mut self.entries[last].1
    }

    pub fn payloads(self) -> Vec<Line> {
        self.entries.into_iter().map(|(_, line)| line).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn nontrivial_payloads(commits: Commits) -> Vec<Value> {
    commits
        .payloads()
        .into_iter()
        .filter(|payload| !payload.is_identity_only())
        .map(Line::into_value)
        .collect()
}

// ── Import pipeline ─────────────────────────────────────────────────────────

enum InlinePatch {
    Set(Line),
    Clear,
}

struct ImportPass<'a> {
    registry: &'a Registry,
    home: &'a Path,
    timestamp: &'a str,
    live: &'a mut Store,
    pre: &'a mut Store,
    affecteds: &'a mut Vec<Affected>,
    differential: bool,
}

/// Resolve a batch of submitted lines into affecteds and commit payloads.
/// Two passes: first every line is imported (ids assigned, records staged),
/// then nested child collections are recursed into, so child connections
/// always reference resolved parent identities.
#[allow(clippy::too_many_arguments)]
pub fn import_batch(
    registry: &Registry,
    home: &Path,
    live: &mut Store,
    pre: &mut Store,
    timestamp: &str,
    lines: &mut [Line],
    affecteds: &mut Vec<Affected>,
    commits: &mut Commits,
    differential: bool,
) -> Result<()> {
    let mut pass = ImportPass {
        registry,
        home,
        timestamp,
        live,
        pre,
        affecteds,
        differential,
    };
    pass.import_batch(lines, commits, None, 0)
}

impl ImportPass<'_> {
    fn import_batch(
        &mut self,
        lines: &mut [Line],
        commits: &mut Commits,
        ignore_relation: Option<&str>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(VellumError::Schema(
                "import recursion too deep; is the relation graph cyclic?".to_string(),
            ));
        }

        for line in lines.iter() {
            let name = line
                .linetype()
                .ok_or_else(|| VellumError::UnrecognisedLinetype("(missing)".to_string()))?;
            self.registry.linetype(name)?;
        }

        for line in lines.iter_mut() {
            self.import_line(line, commits, ignore_relation, depth)?;
        }

        for line in lines.iter() {
            self.recurse_to_children(line, commits, ignore_relation, depth)?;
        }

        Ok(())
    }

    fn import_line(
        &mut self,
        line: &mut Line,
        commits: &mut Commits,
        ignore_relation: Option<&str>,
        depth: usize,
    ) -> Result<()> {
        let name = match line.linetype() {
            Some(name) => name.to_string(),
            None => return Err(VellumError::UnrecognisedLinetype("(missing)".to_string())),
        };
        let linetype = self.registry.linetype(&name)?;

        if !line.is_alive() {
            return self.delete_line(&linetype, line, commits, ignore_relation, depth);
        }

        let info = self.registry.table_info(linetype.table_str());

        // Resolve identity and pre-image. A line created earlier in this
        // same pass has no pre-image on disk; its current staged state
        // stands in.
        let (id, oldline, mut record) = match line.id().map(str::to_string) {
            Some(id) => {
                let oldline = match assemble(
                    self.registry,
                    self.home,
                    self.pre,
                    &name,
                    &id,
                    false,
                    depth,
                ) {
                    Ok(old) => old,
                    Err(VellumError::NotFound { .. }) => assemble(
                        self.registry,
                        self.home,
                        self.live,
                        &name,
                        &id,
                        false,
                        depth,
                    )?,
                    Err(e) => return Err(e),
                };
                let record = Record::new(linetype.table_str(), Some(&id), &info);
                (id, Some(oldline), record)
            }
            None => {
                let (_, id) = take_a_number(self.registry.sequence(), self.home, self.live)?;
                line.set_id(&id);
                let record = Record::fresh(linetype.table_str(), Some(&id), &info);
                (id, None, record)
            }
        };

        // Partial-update semantics: omitted scalar fields are preserved
        // from the pre-image, not cleared.
        if !self.differential {
            if let Some(old) = &oldline {
                for (key, value) in old.0.iter() {
                    if matches!(key.as_str(), "id" | "type" | "_is") || !is_scalar(value) {
                        continue;
                    }
                    if !line.contains(key) {
                        line.set(key, value.clone());
                    }
                }
            }
        }

        for completion in &linetype.completions {
            completion(line);
        }

        let errors: Vec<String> = linetype
            .validations
            .iter()
            .filter_map(|validator| validator(line))
            .collect();
        if !errors.is_empty() {
            return Err(VellumError::LineValidation(format!(
                "Invalid {}: {}",
                name,
                errors.join("; ")
            )));
        }

        // Split inline children out before unfusing; they are their own
        // lines, not fields of this record.
        let mut inline_patches: Vec<(usize, InlinePatch)> = Vec::new();
        for (index, spec) in linetype.inline_specs().iter().enumerate() {
            if let Some(value) = line.remove(&spec.property) {
                let patch = match value {
                    Value::Object(map) => InlinePatch::Set(Line(map)),
                    Value::Null => InlinePatch::Clear,
                    _ => {
                        return Err(VellumError::Schema(format!(
                            "unexpected value for {}->{}",
                            name, spec.property
                        )))
                    }
                };
                inline_patches.push((index, patch));
            }
        }

        let was = oldline.is_some();
        for (field, setter) in &linetype.unfuse {
            if self.differential && !line.contains(field) {
                continue;
            }
            let value = setter(line, oldline.as_ref())?;
            record.set(self.home, self.live, field, value)?;
        }

        if info.format == RecordFormat::Json {
            if !was {
                record.set(
                    self.home,
                    self.live,
                    "created",
                    Value::String(self.timestamp.to_string()),
                )?;
            }
            if !was || record.is_dirty() {
                record.set(
                    self.home,
                    self.live,
                    "modified",
                    Value::String(self.timestamp.to_string()),
                )?;
            }
        }

        self.affecteds.push(Affected::Save {
            table: linetype.table_str().to_string(),
            id: id.clone(),
            record,
            was,
        });

        // Parent alias changes become connect/disconnect deltas.
        for incoming in self.registry.incoming(&name) {
            let Some(alias) = &incoming.alias else { continue };
            if Some(incoming.relation.as_str()) == ignore_relation {
                continue;
            }

            let new = line.get(alias).cloned().unwrap_or(Value::Null);
            let old = oldline
                .as_ref()
                .and_then(|o| o.get(alias))
                .cloned()
                .unwrap_or(Value::Null);
            if new == old {
                continue;
            }

            if let Value::String(old_parent) = &old {
                let (left, right) = endpoints(incoming.reverse, old_parent, &id);
                self.affecteds.push(Affected::Disconnect {
                    relation: incoming.relation.clone(),
                    left,
                    right,
                });
            }
            match &new {
                Value::String(new_parent) => {
                    let (left, right) = endpoints(incoming.reverse, new_parent, &id);
                    self.affecteds.push(Affected::Connect {
                        relation: incoming.relation.clone(),
                        left,
                        right,
                    });
                }
                Value::Null => {}
                other => {
                    return Err(VellumError::Schema(format!(
                        "parent alias {}.{} must be an id string, got {}",
                        name, alias, other
                    )))
                }
            }
        }

        for (index, patch) in inline_patches {
            let spec = linetype.inline_specs()[index].clone();
            if Some(spec.relation.as_str()) == ignore_relation {
                continue;
            }
            self.import_inline(&name, &id, &spec, patch, commits, depth)?;
        }

        // Commit payload: identity, markers, and changed known scalars.
        let known = linetype.known_fields(self.registry);
        let mut deltas: Vec<(String, Value)> = Vec::new();
        for (key, value) in line.0.iter() {
            match key.as_str() {
                "id" | "type" => {}
                "_is" | "_adopt" | "_disown" => deltas.push((key.clone(), value.clone())),
                _ => {
                    if is_scalar(value)
                        && known.contains(key)
                        && oldline.as_ref().and_then(|o| o.get(key)) != Some(value)
                    {
                        deltas.push((key.clone(), value.clone()));
                    }
                }
            }
        }
        let entry = commits.entry_mut(&id);
        entry.set("type", Value::String(name));
        for (key, value) in deltas {
            entry.set(&key, value);
        }

        Ok(())
    }

    fn import_inline(
        &mut self,
        parent_type: &str,
        parent_id: &str,
        spec: &InlineSpec,
        patch: InlinePatch,
        commits: &mut Commits,
        depth: usize,
    ) -> Result<()> {
        let mut link = Link::new(&spec.relation, parent_id, parent_side(spec.reverse));
        let existing = link.first_child(self.home, self.live)?;

        match patch {
            InlinePatch::Set(mut child) => {
                match child.linetype() {
                    None => child.set("type", Value::String(spec.linetype.clone())),
                    Some(t) if t != spec.linetype => {
                        return Err(VellumError::Schema(format!(
                            "unexpected inline type {} for {}->{}",
                            t, parent_type, spec.property
                        )))
                    }
                    _ => {}
                }
                if child.id().is_none() {
                    if let Some(existing_id) = &existing {
                        child.set_id(existing_id);
                    }
                }

                let mut child_commits = Commits::new();
                let mut batch = [child];
                self.import_batch(
                    &mut batch,
                    &mut child_commits,
                    Some(&spec.relation),
                    depth + 1,
                )?;
                let child_id = batch[0]
                    .id()
                    .ok_or_else(|| VellumError::MissingId(spec.linetype.clone()))?
                    .to_string();

                if existing.as_deref() != Some(child_id.as_str()) {
                    if let Some(old) = &existing {
                        let (left, right) = endpoints(spec.reverse, parent_id, old);
                        self.affecteds.push(Affected::Disconnect {
                            relation: spec.relation.clone(),
                            left,
                            right,
                        });
                        if !spec.orphanable {
                            self.delete_by_id(
                                &spec.linetype,
                                old,
                                commits,
                                Some(&spec.relation),
                                depth + 1,
                            )?;
                        }
                    }
                    let (left, right) = endpoints(spec.reverse, parent_id, &child_id);
                    self.affecteds.push(Affected::Connect {
                        relation: spec.relation.clone(),
                        left,
                        right,
                    });
                }

                let payloads = nontrivial_payloads(child_commits);
                if !payloads.is_empty() {
                    commits
                        .entry_mut(parent_id)
                        .set(&spec.property, Value::Array(payloads));
                }
            }
            InlinePatch::Clear => {
                if let Some(old) = existing {
                    let (left, right) = endpoints(spec.reverse, parent_id, &old);
                    self.affecteds.push(Affected::Disconnect {
                        relation: spec.relation.clone(),
                        left,
                        right,
                    });
                    if !spec.orphanable {
                        self.delete_by_id(
                            &spec.linetype,
                            &old,
                            commits,
                            Some(&spec.relation),
                            depth + 1,
                        )?;
                    }
                }
            }
        }

        Ok(())
    }

    fn delete_line(
        &mut self,
        linetype: &Arc<Linetype>,
        line: &Line,
        commits: &mut Commits,
        ignore_relation: Option<&str>,
        depth: usize,
    ) -> Result<()> {
        let id = line
            .id()
            .ok_or_else(|| VellumError::MissingId(linetype.name_str().to_string()))?
            .to_string();
        let info = self.registry.table_info(linetype.table_str());
        let record = Record::new(linetype.table_str(), Some(&id), &info);
        record.assert_exists(self.home, self.live)?;

        // Detach from every parent.
        for incoming in self.registry.incoming(linetype.name_str()) {
            if Some(incoming.relation.as_str()) == ignore_relation {
                continue;
            }
            let mut link = Link::new(&incoming.relation, &id, child_side(incoming.reverse));
            for parent in link.relatives(self.home, self.live)? {
                let (left, right) = endpoints(incoming.reverse, &parent, &id);
                self.affecteds.push(Affected::Disconnect {
                    relation: incoming.relation.clone(),
                    left,
                    right,
                });
            }
        }

        // Detach (and, for cascades, delete) children.
        for spec in linetype.children_specs().to_vec() {
            if Some(spec.relation.as_str()) == ignore_relation {
                continue;
            }
            let mut link = Link::new(&spec.relation, &id, parent_side(spec.reverse));
            for child in link.relatives(self.home, self.live)? {
                let (left, right) = endpoints(spec.reverse, &id, &child);
                self.affecteds.push(Affected::Disconnect {
                    relation: spec.relation.clone(),
                    left,
                    right,
                });
                if spec.cascade_delete {
                    self.delete_by_id(
                        &spec.linetype,
                        &child,
                        commits,
                        Some(&spec.relation),
                        depth + 1,
                    )?;
                }
            }
        }

        // Inline children go with the parent unless marked orphanable.
        for spec in linetype.inline_specs().to_vec() {
            if Some(spec.relation.as_str()) == ignore_relation {
                continue;
            }
            let mut link = Link::new(&spec.relation, &id, parent_side(spec.reverse));
            if let Some(child) = link.first_child(self.home, self.live)? {
                let (left, right) = endpoints(spec.reverse, &id, &child);
                self.affecteds.push(Affected::Disconnect {
                    relation: spec.relation.clone(),
                    left,
                    right,
                });
                if !spec.orphanable {
                    self.delete_by_id(
                        &spec.linetype,
                        &child,
                        commits,
                        Some(&spec.relation),
                        depth + 1,
                    )?;
                }
            }
        }

        self.affecteds.push(Affected::Delete {
            table: linetype.table_str().to_string(),
            id: id.clone(),
            record,
        });

        let entry = commits.entry_mut(&id);
        entry.set("type", Value::String(linetype.name_str().to_string()));
        entry.set("_is", Value::Bool(false));
        Ok(())
    }

    fn delete_by_id(
        &mut self,
        linetype: &str,
        id: &str,
        commits: &mut Commits,
        ignore_relation: Option<&str>,
        depth: usize,
    ) -> Result<()> {
        let mut line = Line::new();
        line.set_id(id);
        line.set("type", Value::String(linetype.to_string()));
        line.set("_is", Value::Bool(false));
        let mut batch = [line];
        self.import_batch(&mut batch, commits, ignore_relation, depth)
    }

    fn recurse_to_children(
        &mut self,
        line: &Line,
        commits: &mut Commits,
        ignore_relation: Option<&str>,
        depth: usize,
    ) -> Result<()> {
        if !line.is_alive() {
            return Ok(());
        }

        let name = match line.linetype() {
            Some(name) => name.to_string(),
            None => return Err(VellumError::UnrecognisedLinetype("(missing)".to_string())),
        };
        let linetype = self.registry.linetype(&name)?;
        let id = line
            .id()
            .ok_or_else(|| VellumError::MissingId(name.clone()))?
            .to_string();

        for spec in linetype.children_specs() {
            if Some(spec.relation.as_str()) == ignore_relation {
                continue;
            }
            if line.get(&spec.property).is_none() {
                continue;
            }
            let Some(mut children) = line.child_lines(&spec.property) else {
                return Err(VellumError::Schema(format!(
                    "unexpected value for {}->{}",
                    name, spec.property
                )));
            };
            let Some(alias) = &spec.alias else {
                return Err(VellumError::Schema(format!(
                    "nested children for {}->{} need a parent alias",
                    name, spec.property
                )));
            };

            for child in &mut children {
                match child.linetype() {
                    None => child.set("type", Value::String(spec.linetype.clone())),
                    Some(t) if t != spec.linetype => {
                        return Err(VellumError::Schema(format!(
                            "unexpected child type {} for {}->{}",
                            t, name, spec.property
                        )))
                    }
                    _ => {}
                }
                // Writing the alias lets the child's own alias diff emit
                // the connect, deduplicated against its pre-image.
                child.set(alias, Value::String(id.clone()));
            }

            let mut child_commits = Commits::new();
            self.import_batch(&mut children, &mut child_commits, None, depth + 1)?;
            let payloads = nontrivial_payloads(child_commits);
            if !payloads.is_empty() {
                commits
                    .entry_mut(&id)
                    .set(&spec.property, Value::Array(payloads));
            }
        }

        for (marker, connect) in [("_adopt", true), ("_disown", false)] {
            let Some(value) = line.get(marker) else { continue };
            let Value::Object(map) = value else {
                return Err(VellumError::Schema(format!(
                    "{} on {} must map child properties to id arrays",
                    marker, name
                )));
            };
            for (property, ids_value) in map {
                let spec = linetype
                    .children_specs()
                    .iter()
                    .find(|s| s.property == *property)
                    .ok_or_else(|| {
                        VellumError::Schema(format!("unknown child property {}->{}", name, property))
                    })?;
                let Value::Array(child_ids) = ids_value else {
                    return Err(VellumError::Schema(format!(
                        "{}.{} must be an array of ids",
                        marker, property
                    )));
                };
                let child_type = self.registry.linetype(&spec.linetype)?;
                let child_info = self.registry.table_info(child_type.table_str());
                for child_id in child_ids {
                    let Value::String(child_id) = child_id else {
                        return Err(VellumError::Schema(format!(
                            "{}.{} must be an array of id strings",
                            marker, property
                        )));
                    };
                    let child_record =
                        Record::new(child_type.table_str(), Some(child_id), &child_info);
                    child_record.assert_exists(self.home, self.live)?;
                    let (left, right) = endpoints(spec.reverse, &id, child_id);
                    self.affecteds.push(if connect {
                        Affected::Connect {
                            relation: spec.relation.clone(),
                            left,
                            right,
                        }
                    } else {
                        Affected::Disconnect {
                            relation: spec.relation.clone(),
                            left,
                            right,
                        }
                    });
                }
            }
        }

        Ok(())
    }
}
