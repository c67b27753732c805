//! The shared per-vehicle status documents.
//!
//! Every registered vehicle owns one [VehicleStatus], a schemaless JSON object
//! as returned by the vendor backend. The [StatusStore] guards each document
//! with its own mutex so a refresh replacing a document and a command patching
//! a few fields of it can never interleave.
//!
//! Only the coordinator replaces whole documents; everything else goes through
//! [StatusPatch]es.

use std::collections::HashMap;
use std::fmt;

use rocket::tokio::sync::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A dotted path into a [VehicleStatus], e.g.
/// `additionalVehicleStatus.electricVehicleStatus.chargerState`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StatusPath(Vec<String>);

impl StatusPath {
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The path of a sibling field, sharing everything but the last segment.
    pub fn sibling(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.pop();
        segments.push(key.to_string());
        Self(segments)
    }
}

impl From<&str> for StatusPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for StatusPath {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<StatusPath> for String {
    fn from(value: StatusPath) -> Self {
        value.to_string()
    }
}

impl fmt::Display for StatusPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Last known (or optimistically patched) state of one vehicle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleStatus(Map<String, Value>);

impl VehicleStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, path: &StatusPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        rest.iter()
            .try_fold(self.0.get(first)?, |value, segment| value.get(segment))
    }

    /// Read a scalar as a string, the way the backend's encodings are compared.
    ///
    /// Numbers and booleans are stringified, `null` and containers are treated
    /// as missing.
    pub fn get_str(&self, path: &StatusPath) -> Option<String> {
        scalar_to_string(self.get(path)?)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Write `value` at `path`, creating intermediate objects as needed.
    ///
    /// A non-object value found on the way is replaced by an empty object.
    pub fn set(&mut self, path: &StatusPath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut cursor = &mut self.0;
        for segment in parents {
            let entry = cursor
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(map) = entry else {
                return;
            };
            cursor = map;
        }
        cursor.insert(last.clone(), value);
    }
}

impl TryFrom<Value> for VehicleStatus {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A set of writes applied atomically to one vehicle document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    writes: Vec<(StatusPath, Value)>,
}

impl StatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: StatusPath, value: impl Into<Value>) -> Self {
        self.writes.push((path, value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[(StatusPath, Value)] {
        &self.writes
    }

    pub fn apply_to(&self, status: &mut VehicleStatus) {
        for (path, value) in &self.writes {
            status.set(path, value.clone());
        }
    }
}

/// Owner of every vehicle document.
///
/// The set of VINs is fixed at construction, matching the immutable vehicle
/// registry.
#[derive(Debug)]
pub struct StatusStore {
    vehicles: HashMap<String, Mutex<VehicleStatus>>,
}

impl StatusStore {
    pub fn new<I>(vins: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            vehicles: vins
                .into_iter()
                .map(|vin| (vin, Mutex::new(VehicleStatus::new())))
                .collect(),
        }
    }

    pub async fn get_snapshot(&self, vin: &str) -> Option<VehicleStatus> {
        let slot = self.vehicles.get(vin)?;
        let guard = slot.lock().await;
        Some(guard.clone())
    }

    /// Replace the document with the result of `merge(previous)`, under one
    /// lock acquisition. Reserved to the coordinator's refresh.
    pub(crate) async fn replace_with<F>(&self, vin: &str, merge: F) -> bool
    where
        F: FnOnce(&VehicleStatus) -> VehicleStatus,
    {
        match self.vehicles.get(vin) {
            Some(slot) => {
                let mut guard = slot.lock().await;
                let next = merge(&*guard);
                *guard = next;
                true
            }
            None => false,
        }
    }

    pub async fn apply_patch(&self, vin: &str, patch: &StatusPatch) -> bool {
        match self.vehicles.get(vin) {
            Some(slot) => {
                let mut guard = slot.lock().await;
                patch.apply_to(&mut guard);
                true
            }
            None => false,
        }
    }
}
