// Record - one stored entity: a flat bag of scalar fields persisted as a
// JSON object (or a raw blob for binary tables) under records/{table}/{id}.

use crate::error::{Result, VellumError};
use crate::line::is_scalar;
use crate::store::Store;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// On-disk representation of a table's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    #[default]
    Json,
    Binary,
}

/// Per-table storage configuration.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub format: RecordFormat,
    pub extension: String,
}

impl Default for TableInfo {
    fn default() -> Self {
        TableInfo {
            format: RecordFormat::Json,
            extension: "json".to_string(),
        }
    }
}

impl TableInfo {
    pub fn binary(extension: &str) -> Self {
        TableInfo {
            format: RecordFormat::Binary,
            extension: extension.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RecordData {
    Fields(Map<String, Value>),
    Blob(Vec<u8>),
}

/// A lazily loaded record. Field mutations mark it dirty; `save` stages the
/// file into the store, `delete` stages its removal. For binary tables the
/// whole payload lives under the pseudo-field `content`.
#[derive(Debug, Clone)]
pub struct Record {
    table: String,
    id: Option<String>,
    format: RecordFormat,
    extension: String,
    data: Option<RecordData>,
    dirty: bool,
}

impl Record {
    pub fn new(table: &str, id: Option<&str>, info: &TableInfo) -> Self {
        Record {
            table: table.to_string(),
            id: id.map(str::to_string),
            format: info.format,
            extension: info.extension.clone(),
            data: None,
            dirty: false,
        }
    }

    /// A record that starts empty rather than lazily loading from disk.
    /// Used for freshly created entities.
    pub fn fresh(table: &str, id: Option<&str>, info: &TableInfo) -> Self {
        let mut record = Record::new(table, id, info);
        record.data = Some(match info.format {
            RecordFormat::Json => RecordData::Fields(Map::new()),
            RecordFormat::Binary => RecordData::Blob(Vec::new()),
        });
        record
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }

    pub fn file(&self, home: &Path) -> Result<PathBuf> {
        let id = self
            .id
            .as_deref()
            .ok_or_else(|| VellumError::MissingId(self.table.clone()))?;
        Ok(home
            .join("records")
            .join(&self.table)
            .join(format!("{}.{}", id, self.extension)))
    }

    pub fn exists(&self, home: &Path, store: &Store) -> Result<bool> {
        Ok(store.has(&self.file(home)?))
    }

    pub fn assert_exists(&self, home: &Path, store: &Store) -> Result<()> {
        if self.exists(home, store)? {
            Ok(())
        } else {
            Err(VellumError::NotFound {
                table: self.table.clone(),
                id: self.id.clone().unwrap_or_default(),
            })
        }
    }

    fn load(&mut self, home: &Path, store: &mut Store) -> Result<&mut RecordData> {
        if self.data.is_none() {
            let file = self.file(home)?;
            let bytes = store.get(&file)?.ok_or_else(|| VellumError::NotFound {
                table: self.table.clone(),
                id: self.id.clone().unwrap_or_default(),
            })?;
            self.data = Some(match self.format {
                RecordFormat::Json => {
                    let value: Value = serde_json::from_slice(&bytes)?;
                    match value {
                        Value::Object(map) => RecordData::Fields(map),
                        other => {
                            return Err(VellumError::Schema(format!(
                                "record {}/{} is not a JSON object: {}",
                                self.table,
                                self.id.as_deref().unwrap_or("?"),
                                other
                            )))
                        }
                    }
                }
                RecordFormat::Binary => RecordData::Blob(bytes),
            });
        }
        match self.data.as_mut() {
            Some(data) => Ok(data),
            None => Err(VellumError::NotFound {
                table: self.table.clone(),
                id: self.id.clone().unwrap_or_default(),
            }),
        }
    }

    pub fn get(&mut self, home: &Path, store: &mut Store, field: &str) -> Result<Value> {
        match self.load(home, store)? {
            RecordData::Fields(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
            RecordData::Blob(bytes) => {
                if field == "content" {
                    Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
                } else {
                    Ok(Value::Null)
                }
            }
        }
    }

    /// Set a field. Non-scalar values are rejected; unchanged values do not
    /// mark the record dirty.
    pub fn set(&mut self, home: &Path, store: &mut Store, field: &str, value: Value) -> Result<()> {
        if !is_scalar(&value) {
            return Err(VellumError::InvalidFieldType(field.to_string()));
        }

        let mut changed = false;
        match self.load(home, store)? {
            RecordData::Fields(map) => {
                if map.get(field) != Some(&value) {
                    if value.is_null() {
                        changed = map.remove(field).is_some();
                    } else {
                        map.insert(field.to_string(), value);
                        changed = true;
                    }
                }
            }
            RecordData::Blob(bytes) => {
                if field != "content" {
                    return Err(VellumError::Schema(format!(
                        "binary table {} only stores 'content', not '{}'",
                        self.table, field
                    )));
                }
                let new = value.as_str().unwrap_or_default().as_bytes().to_vec();
                if *bytes != new {
                    *bytes = new;
                    changed = true;
                }
            }
        }
        if changed {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The record's scalar fields plus its id, for assembly into a line.
    pub fn to_map(&mut self, home: &Path, store: &mut Store) -> Result<Map<String, Value>> {
        let id = self.id.clone();
        let mut map = match self.load(home, store)? {
            RecordData::Fields(map) => map.clone(),
            RecordData::Blob(bytes) => {
                let mut map = Map::new();
                map.insert(
                    "content".to_string(),
                    Value::String(String::from_utf8_lossy(bytes).into_owned()),
                );
                map
            }
        };
        if let Some(id) = id {
            map.insert("id".to_string(), Value::String(id));
        }
        Ok(map)
    }

    /// Stage the record into the store. A clean record is a no-op.
    pub fn save(&mut self, home: &Path, store: &mut Store) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let file = self.file(home)?;
        let bytes = match self.data.as_ref() {
            Some(RecordData::Fields(map)) => serde_json::to_vec(&Value::Object(map.clone()))?,
            Some(RecordData::Blob(bytes)) => bytes.clone(),
            None => return Ok(()),
        };
        store.put(&file, bytes)?;
        self.dirty = false;
        Ok(())
    }

    pub fn delete(&self, home: &Path, store: &mut Store) -> Result<()> {
        store.delete(&self.file(home)?)
    }
}
