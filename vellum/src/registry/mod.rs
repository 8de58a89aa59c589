// Registry - the resolved schema: linetypes, reports, table storage info and
// the id sequence, validated once at construction and shared read-only.
// Owned by the engine instance rather than living in process-wide statics,
// so separate databases never share schema state.

use crate::error::{Result, VellumError};
use crate::linetype::Linetype;
use crate::record::TableInfo;
use crate::report::{Report, Source};
use crate::sequence::Sequence;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One relation arriving at a child linetype, precomputed from the parents'
/// child and inline declarations.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub relation: String,
    pub reverse: bool,
    pub parent: String,
    pub alias: Option<String>,
}

pub struct RegistryBuilder {
    linetypes: Vec<Linetype>,
    reports: Vec<Report>,
    tables: Vec<(String, TableInfo)>,
    sequence: Sequence,
}

impl RegistryBuilder {
    pub fn new(sequence: Sequence) -> Self {
        RegistryBuilder {
            linetypes: Vec::new(),
            reports: Vec::new(),
            tables: Vec::new(),
            sequence,
        }
    }

    pub fn linetype(mut self, linetype: Linetype) -> Self {
        self.linetypes.push(linetype);
        self
    }

    pub fn report(mut self, report: Report) -> Self {
        self.reports.push(report);
        self
    }

    pub fn table(mut self, name: &str, info: TableInfo) -> Self {
        self.tables.push((name.to_string(), info));
        self
    }

    pub fn build(self) -> Result<Registry> {
        let mut linetypes = BTreeMap::new();
        for linetype in self.linetypes {
            let name = linetype.name_str().to_string();
            if linetypes.insert(name.clone(), Arc::new(linetype)).is_some() {
                return Err(VellumError::Schema(format!("duplicate linetype: {}", name)));
            }
        }

        let mut tables = BTreeMap::new();
        for (name, info) in self.tables {
            if tables.insert(name.clone(), info).is_some() {
                return Err(VellumError::Schema(format!("duplicate table: {}", name)));
            }
        }

        // Wire relations: resolve targets, precompute incoming edges and
        // which linetype sits on each side of each relation.
        let mut incoming: BTreeMap<String, Vec<Incoming>> = BTreeMap::new();
        let mut relation_sides: BTreeMap<String, (String, String)> = BTreeMap::new();
        for (name, linetype) in &linetypes {
            let edges = linetype
                .children_specs()
                .iter()
                .map(|c| (c.linetype.clone(), c.relation.clone(), c.reverse, c.alias.clone()))
                .chain(
                    linetype
                        .inline_specs()
                        .iter()
                        .map(|i| (i.linetype.clone(), i.relation.clone(), i.reverse, None)),
                );
            for (child, relation, reverse, alias) in edges {
                if !linetypes.contains_key(&child) {
                    return Err(VellumError::Schema(format!(
                        "{} relates to unknown linetype {}",
                        name, child
                    )));
                }
                let sides = if reverse {
                    (child.clone(), name.clone())
                } else {
                    (name.clone(), child.clone())
                };
                if let Some(existing) = relation_sides.get(&relation) {
                    if *existing != sides {
                        return Err(VellumError::Schema(format!(
                            "relation {} declared with conflicting endpoints",
                            relation
                        )));
                    }
                } else {
                    relation_sides.insert(relation.clone(), sides);
                }
                incoming.entry(child).or_default().push(Incoming {
                    relation,
                    reverse,
                    parent: name.clone(),
                    alias,
                });
            }
        }

        let mut reports = BTreeMap::new();
        for report in &self.reports {
            let name = report.name_str().to_string();
            if reports.contains_key(&name) {
                return Err(VellumError::Schema(format!("duplicate report: {}", name)));
            }
            reports.insert(name, Arc::new(report.clone()));
        }

        for (name, report) in &reports {
            let mut on_linetypes = false;
            let mut on_reports = false;
            for listen in report.listens() {
                match &listen.source {
                    Source::Linetype(lt) => {
                        on_linetypes = true;
                        if !linetypes.contains_key(lt) {
                            return Err(VellumError::Schema(format!(
                                "report {} listens on unknown linetype {}",
                                name, lt
                            )));
                        }
                        if listen.classifies_groups() {
                            return Err(VellumError::Schema(format!(
                                "report {} uses a group classifier on a linetype listen",
                                name
                            )));
                        }
                    }
                    Source::Report(src) => {
                        on_reports = true;
                        if !reports.contains_key(src) {
                            return Err(VellumError::Schema(format!(
                                "report {} listens on unknown report {}",
                                name, src
                            )));
                        }
                        if listen.classifies_lines() {
                            return Err(VellumError::Schema(format!(
                                "report {} uses a line classifier on a report listen",
                                name
                            )));
                        }
                    }
                }
            }
            if on_linetypes && on_reports {
                return Err(VellumError::Schema(format!(
                    "report {} mixes linetype and report listens",
                    name
                )));
            }
            if on_reports && !report.has_handler() {
                return Err(VellumError::Schema(format!(
                    "derived report {} has no handler",
                    name
                )));
            }
        }

        Ok(Registry {
            linetypes,
            reports,
            tables,
            incoming,
            relation_sides,
            sequence: self.sequence,
        })
    }
}

/// Immutable, validated schema shared by one or more database handles.
pub struct Registry {
    linetypes: BTreeMap<String, Arc<Linetype>>,
    reports: BTreeMap<String, Arc<Report>>,
    tables: BTreeMap<String, TableInfo>,
    incoming: BTreeMap<String, Vec<Incoming>>,
    relation_sides: BTreeMap<String, (String, String)>,
    sequence: Sequence,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("linetypes", &self.linetypes.keys().collect::<Vec<_>>())
            .field("reports", &self.reports.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn linetype(&self, name: &str) -> Result<Arc<Linetype>> {
        self.linetypes
            .get(name)
            .cloned()
            .ok_or_else(|| VellumError::UnrecognisedLinetype(name.to_string()))
    }

    pub fn report(&self, name: &str) -> Result<Arc<Report>> {
        self.reports
            .get(name)
            .cloned()
            .ok_or_else(|| VellumError::Schema(format!("unknown report: {}", name)))
    }

    pub fn linetypes(&self) -> impl Iterator<Item = (&String, &Arc<Linetype>)> {
        self.linetypes.iter()
    }

    pub fn reports(&self) -> impl Iterator<Item = (&String, &Arc<Report>)> {
        self.reports.iter()
    }

    /// Tables without explicit configuration default to JSON storage.
    pub fn table_info(&self, table: &str) -> TableInfo {
        self.tables.get(table).cloned().unwrap_or_default()
    }

    pub fn incoming(&self, linetype: &str) -> &[Incoming] {
        self.incoming
            .get(linetype)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// (forth-side, back-side) linetype names for a relation.
    pub fn relation_sides(&self, relation: &str) -> Option<&(String, String)> {
        self.relation_sides.get(relation)
    }

    pub fn linetypes_for_table(&self, table: &str) -> Vec<&str> {
        self.linetypes
            .values()
            .filter(|lt| lt.table_str() == table)
            .map(|lt| lt.name_str())
            .collect()
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linetype::ChildSpec;
    use crate::report::Listen;
    use crate::testutil;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::Arc as StdArc;

    #[test]
    fn test_incoming_edges_precomputed() {
        let registry = testutil::registry();

        let incoming = registry.incoming("post");
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].relation, "user_post");
        assert_eq!(incoming[0].parent, "user");
        assert_eq!(incoming[0].alias.as_deref(), Some("user"));
        assert!(registry.incoming("user").is_empty());

        assert_eq!(
            registry.relation_sides("user_post"),
            Some(&("user".to_string(), "post".to_string()))
        );
    }

    #[test]
    fn test_unknown_relation_target_rejected() {
        let err = RegistryBuilder::new(testutil::sequence())
            .linetype(
                Linetype::new("user").child(ChildSpec::new("posts", "post", "user_post")),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, VellumError::Schema(msg) if msg.contains("unknown linetype")));
    }

    #[test]
    fn test_mixed_listen_set_rejected() {
        let report = Report::new("mixed")
            .listen(Listen::linetype("user"))
            .listen(Listen::report("other"))
            .handle(StdArc::new(|_, _, _, _| Value::Null));
        let err = testutil::builder()
            .report(Report::new("other").listen(Listen::linetype("user")))
            .report(report)
            .build()
            .unwrap_err();
        assert!(matches!(err, VellumError::Schema(msg) if msg.contains("mixes")));
    }

    #[test]
    fn test_derived_report_requires_handler() {
        let err = testutil::builder()
            .report(Report::new("source").listen(Listen::linetype("user")))
            .report(Report::new("derived").listen(Listen::report("source")))
            .build()
            .unwrap_err();
        assert!(matches!(err, VellumError::Schema(msg) if msg.contains("handler")));
    }

    #[test]
    fn test_default_table_info_is_json() {
        let registry = testutil::registry();
        let info = registry.table_info("user");
        assert_eq!(info.extension, "json");
    }
}
