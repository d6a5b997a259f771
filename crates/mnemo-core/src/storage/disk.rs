//! Sled-backed durable terminal backend.
//!
//! One sled tree per class holds codec-encoded rows wrapped in an rkyv
//! record envelope; a manifest tree tracks the stored property set per
//! class so property-level schema checks work even for empty stores.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use mnemo_expr::{codec, Expression, Row, Value};

use crate::error::{conflict, ConflictMode, Error, Warnings};
use crate::model::UnitClass;
use crate::sequencer::{MonotonicSequencer, Sequencer};
use crate::unit::Unit;

use super::{Join, Options, StorageBackend};

/// Tree name for per-class manifests.
const MANIFEST_TREE: &str = "mnemo:manifest";

/// Prefix for per-class data trees.
const DATA_PREFIX: &str = "unit:";

/// A stored row with metadata.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct StoredRecord {
    /// Codec-encoded field row.
    data: Vec<u8>,
    /// Save timestamp in microseconds since the Unix epoch.
    saved_at: u64,
}

impl StoredRecord {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            saved_at: current_timestamp(),
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// The stored property set for one class.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct Manifest {
    fields: Vec<String>,
}

impl Manifest {
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Microseconds since the Unix epoch.
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A durable storage backend over sled.
pub struct DiskBackend {
    db: Db,
    manifest_tree: Tree,
    classes: DashMap<String, Arc<UnitClass>>,
    reserve_locks: DashMap<String, Arc<Mutex<()>>>,
    seq: Box<dyn Sequencer>,
}

impl DiskBackend {
    /// Open or create a store.
    ///
    /// Recognized options: `path` (directory for the sled database; a
    /// temporary database is used when absent, for tests and scratch work).
    pub fn open(options: &Options) -> Result<Self, Error> {
        let config = match options.get_path("path") {
            Some(path) => sled::Config::new().path(path),
            None => sled::Config::new().temporary(true),
        };
        let db = config.open()?;
        let manifest_tree = db.open_tree(MANIFEST_TREE)?;
        Ok(Self {
            db,
            manifest_tree,
            classes: DashMap::new(),
            reserve_locks: DashMap::new(),
            seq: Box::new(MonotonicSequencer),
        })
    }

    /// Replace the identity sequencer.
    pub fn with_sequencer(mut self, seq: impl Sequencer + 'static) -> Self {
        self.seq = Box::new(seq);
        self
    }

    fn data_tree(&self, class: &str) -> Result<Tree, Error> {
        if !self.has_storage(class) {
            return Err(Error::Mapping(format!("{class}: no storage found")));
        }
        Ok(self.db.open_tree(format!("{DATA_PREFIX}{class}"))?)
    }

    fn manifest(&self, class: &str) -> Result<Option<Manifest>, Error> {
        match self.manifest_tree.get(class.as_bytes())? {
            Some(bytes) => Ok(Some(Manifest::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_manifest(&self, class: &str, manifest: &Manifest) -> Result<(), Error> {
        self.manifest_tree
            .insert(class.as_bytes(), manifest.to_bytes()?)?;
        Ok(())
    }

    fn reserve_lock(&self, class: &str) -> Arc<Mutex<()>> {
        self.reserve_locks
            .entry(class.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn row_key(unit: &Unit) -> Vec<u8> {
        if unit.class().has_identifiers() {
            unit.identity_key()
        } else {
            codec::encode_row(&unit.row())
        }
    }

    fn put_row(&self, tree: &Tree, key: Vec<u8>, row: &Row) -> Result<(), Error> {
        let record = StoredRecord::new(codec::encode_row(row));
        tree.insert(key, record.to_bytes()?)?;
        Ok(())
    }

    /// Rewrite every stored row of a class in place.
    fn rewrite_rows<F>(&self, class: &str, mut edit: F) -> Result<(), Error>
    where
        F: FnMut(&mut Row),
    {
        let tree = self.data_tree(class)?;
        for entry in tree.iter() {
            let (key, bytes) = entry?;
            let record = StoredRecord::from_bytes(&bytes)?;
            let mut row = codec::decode_row(&record.data)?;
            edit(&mut row);
            self.put_row(&tree, key.to_vec(), &row)?;
        }
        Ok(())
    }
}

impl StorageBackend for DiskBackend {
    fn register(&self, class: &Arc<UnitClass>) -> Result<(), Error> {
        self.classes.insert(class.name().to_owned(), class.clone());
        self.reserve_lock(class.name());
        Ok(())
    }

    fn is_registered(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    fn reserve(&self, unit: &mut Unit) -> Result<(), Error> {
        let class = unit.class().clone();
        if !class.has_identifiers() {
            return Ok(());
        }
        let lock = self.reserve_lock(class.name());
        let _guard = lock.lock();
        let tree = self.data_tree(class.name())?;
        if !self.seq.valid(&unit.identity()) {
            let mut existing = Vec::new();
            for entry in tree.iter() {
                let (key, _) = entry?;
                existing.push(codec::decode_values(&key)?);
            }
            let identity = self.seq.assign(&class, &existing)?;
            for (field, value) in class.identifiers().iter().zip(identity) {
                unit.set_raw(field, value)?;
            }
        }
        unit.cleanse();
        self.put_row(&tree, unit.identity_key(), &unit.row())?;
        debug!(class = class.name(), "reserve");
        Ok(())
    }

    fn save(&self, unit: &mut Unit, force: bool) -> Result<(), Error> {
        if !force && !unit.dirty() {
            return Ok(());
        }
        let class = unit.class().clone();
        if class.has_identifiers() && !unit.has_identity() {
            return Err(Error::MissingIdentity(class.name().to_owned()));
        }
        let tree = self.data_tree(class.name())?;
        debug!(
            class = class.name(),
            state = &unit.fingerprint_hex()[..12],
            "save"
        );
        self.put_row(&tree, Self::row_key(unit), &unit.row())?;
        unit.cleanse();
        Ok(())
    }

    fn destroy(&self, class: &str, identity: &[Value]) -> Result<(), Error> {
        let tree = self.data_tree(class)?;
        tree.remove(codec::encode_values(identity))?;
        debug!(class, "destroy");
        Ok(())
    }

    fn recall(&self, class: &str, expr: Option<&Expression>) -> Result<Vec<Row>, Error> {
        let tree = self.data_tree(class)?;
        debug!(class, filtered = expr.is_some(), "recall");
        let mut matches = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry?;
            let record = StoredRecord::from_bytes(&bytes)?;
            let row = codec::decode_row(&record.data)?;
            let keep = match expr {
                Some(expr) => expr.matches(&row)?,
                None => true,
            };
            if keep {
                matches.push(row);
            }
        }
        Ok(matches)
    }

    fn distinct(
        &self,
        class: &str,
        fields: &[String],
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Value>>, Error> {
        let rows = self.recall(class, expr)?;
        Ok(super::distinct_projection(rows, fields))
    }

    fn multirecall(
        &self,
        join: &Join,
        expr: Option<&Expression>,
    ) -> Result<Vec<Vec<Row>>, Error> {
        super::combine(|class| self.recall(class, None), join, expr)
    }

    fn create_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        let def = self
            .classes
            .get(class)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownClass(class.to_owned()))?;
        debug!(class, "create storage");
        if self.manifest(class)?.is_some() {
            match conflicts {
                ConflictMode::Repair | ConflictMode::Ignore => {}
                mode => conflict(mode, &mut warnings, class, "storage already exists")?,
            }
            return Ok(warnings);
        }
        let manifest = Manifest {
            fields: def.fields().iter().map(|f| f.name.clone()).collect(),
        };
        self.put_manifest(class, &manifest)?;
        self.db.open_tree(format!("{DATA_PREFIX}{class}"))?;
        Ok(warnings)
    }

    fn has_storage(&self, class: &str) -> bool {
        self.manifest_tree
            .contains_key(class.as_bytes())
            .unwrap_or(false)
    }

    fn drop_storage(&self, class: &str, conflicts: ConflictMode) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, "drop storage");
        if self.manifest_tree.remove(class.as_bytes())?.is_none() {
            match conflicts {
                ConflictMode::Repair | ConflictMode::Ignore => {}
                mode => conflict(mode, &mut warnings, class, "no storage to drop")?,
            }
            return Ok(warnings);
        }
        self.db.drop_tree(format!("{DATA_PREFIX}{class}"))?;
        Ok(warnings)
    }

    fn add_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, property = name, "add property");
        let Some(mut manifest) = self.manifest(class)? else {
            conflict(conflicts, &mut warnings, class, "no storage found")?;
            return Ok(warnings);
        };
        if !manifest.fields.iter().any(|f| f == name) {
            manifest.fields.push(name.to_owned());
            self.put_manifest(class, &manifest)?;
        }
        self.rewrite_rows(class, |row| {
            if codec::get_field(row, name).is_none() {
                row.push((name.to_owned(), Value::Null));
            }
        })?;
        Ok(warnings)
    }

    fn has_property(&self, class: &str, name: &str) -> Result<bool, Error> {
        match self.manifest(class)? {
            Some(manifest) => Ok(manifest.fields.iter().any(|f| f == name)),
            None => Err(Error::Mapping(format!("{class}: no storage found"))),
        }
    }

    fn drop_property(
        &self,
        class: &str,
        name: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, property = name, "drop property");
        let Some(mut manifest) = self.manifest(class)? else {
            conflict(conflicts, &mut warnings, class, "no storage found")?;
            return Ok(warnings);
        };
        manifest.fields.retain(|f| f != name);
        self.put_manifest(class, &manifest)?;
        self.rewrite_rows(class, |row| row.retain(|(field, _)| field != name))?;
        Ok(warnings)
    }

    fn rename_property(
        &self,
        class: &str,
        old: &str,
        new: &str,
        conflicts: ConflictMode,
    ) -> Result<Warnings, Error> {
        let mut warnings = Warnings::new();
        debug!(class, from = old, to = new, "rename property");
        let Some(mut manifest) = self.manifest(class)? else {
            conflict(conflicts, &mut warnings, class, "no storage found")?;
            return Ok(warnings);
        };
        for field in manifest.fields.iter_mut() {
            if field == old {
                *field = new.to_owned();
            }
        }
        self.put_manifest(class, &manifest)?;
        self.rewrite_rows(class, |row| {
            for (field, _) in row.iter_mut() {
                if field == old {
                    *field = new.to_owned();
                }
            }
        })?;
        Ok(warnings)
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}
