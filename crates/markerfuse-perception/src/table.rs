//! Persisted marker→reference transform table.
//!
//! # File layout
//!
//! A single pretty-printed JSON document:
//!
//! ```json
//! {
//!   "reference_id": 45,
//!   "calibration_id": "6f0e…",
//!   "created_at": "2024-05-01T12:00:00Z",
//!   "transforms": [
//!     { "id": 12, "translation": [0.1, 0.0, 0.0], "rotation": [0.0, 0.0, 0.0, 1.0] }
//!   ]
//! }
//! ```
//!
//! Records are sorted by marker id.  Quaternions are stored `[x, y, z, w]`.
//! Floats are written in shortest round-trip form and parsed with correct
//! rounding, so a reloaded table is bit-identical to the saved one.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use markerfuse_types::{MarkerId, PoseRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::transform::Transform3D;

/// Errors that can arise when saving or loading a table.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Transform for marker {0} is not a finite rigid transform")]
    NonFinite(MarkerId),
    #[error("Table lists the reference marker {0} as an entry")]
    ContainsReference(MarkerId),
}

/// Transform from each marker's frame to the reference marker's frame.
///
/// The reference marker maps to the identity implicitly and is never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceTransformTable {
    reference_id: MarkerId,
    calibration_id: Uuid,
    created_at: DateTime<Utc>,
    transforms: BTreeMap<MarkerId, Transform3D>,
}

impl ReferenceTransformTable {
    /// An empty table for `reference_id`, stamped now.
    pub fn new(reference_id: MarkerId) -> Self {
        Self {
            reference_id,
            calibration_id: Uuid::new_v4(),
            created_at: Utc::now(),
            transforms: BTreeMap::new(),
        }
    }

    pub fn reference_id(&self) -> MarkerId {
        self.reference_id
    }

    pub fn calibration_id(&self) -> Uuid {
        self.calibration_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Store T_marker_reference.  Inserting the reference itself is a no-op.
    pub fn insert(&mut self, id: MarkerId, transform: Transform3D) {
        if id == self.reference_id {
            return;
        }
        self.transforms.insert(id, transform);
    }

    /// T_id_reference; identity for the reference marker, `None` for markers
    /// that could not be resolved.
    pub fn get(&self, id: MarkerId) -> Option<Transform3D> {
        if id == self.reference_id {
            Some(Transform3D::identity())
        } else {
            self.transforms.get(&id).copied()
        }
    }

    /// `true` if observations of `id` can be fused.
    pub fn resolves(&self, id: MarkerId) -> bool {
        id == self.reference_id || self.transforms.contains_key(&id)
    }

    /// Stored (non-reference) entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (MarkerId, &Transform3D)> {
        self.transforms.iter().map(|(id, t)| (*id, t))
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Write the table to `path` as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), TableError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.to_file())?;
        fs::write(path, raw)?;
        info!(
            path = %path.display(),
            reference = self.reference_id,
            markers = self.transforms.len(),
            calibration = %self.calibration_id,
            "Saved reference transform table"
        );
        Ok(())
    }

    /// Read a table previously written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, TableError> {
        let raw = fs::read_to_string(path)?;
        let table = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            reference = table.reference_id,
            markers = table.transforms.len(),
            calibration = %table.calibration_id,
            "Loaded reference transform table"
        );
        Ok(table)
    }

    pub fn to_json(&self) -> Result<String, TableError> {
        Ok(serde_json::to_string_pretty(&self.to_file())?)
    }

    pub fn from_json(raw: &str) -> Result<Self, TableError> {
        let file: TableFile = serde_json::from_str(raw)?;
        let mut transforms = BTreeMap::new();
        for record in file.transforms {
            if record.id == file.reference_id {
                return Err(TableError::ContainsReference(record.id));
            }
            let transform = Transform3D::from_record(&record.pose())
                .ok_or(TableError::NonFinite(record.id))?;
            transforms.insert(record.id, transform);
        }
        Ok(Self {
            reference_id: file.reference_id,
            calibration_id: file.calibration_id,
            created_at: file.created_at,
            transforms,
        })
    }

    fn to_file(&self) -> TableFile {
        TableFile {
            reference_id: self.reference_id,
            calibration_id: self.calibration_id,
            created_at: self.created_at,
            transforms: self
                .transforms
                .iter()
                .map(|(id, t)| {
                    let pose = t.to_record();
                    TransformRecord {
                        id: *id,
                        translation: pose.translation,
                        rotation: pose.rotation,
                    }
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TableFile {
    reference_id: MarkerId,
    calibration_id: Uuid,
    created_at: DateTime<Utc>,
    transforms: Vec<TransformRecord>,
}

#[derive(Serialize, Deserialize)]
struct TransformRecord {
    id: MarkerId,
    translation: [f64; 3],
    rotation: [f64; 4],
}

impl TransformRecord {
    fn pose(&self) -> PoseRecord {
        PoseRecord {
            translation: self.translation,
            rotation: self.rotation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn sample_table() -> ReferenceTransformTable {
        let mut table = ReferenceTransformTable::new(45);
        table.insert(
            12,
            Transform3D::new(
                Vector3::new(0.1234567890123, -0.000001, 3.0e-12),
                UnitQuaternion::from_euler_angles(0.1, -2.9, 1.7),
            ),
        );
        table.insert(
            7,
            Transform3D::new(
                Vector3::new(-1.0 / 3.0, 2.0 / 7.0, 0.0),
                UnitQuaternion::from_euler_angles(3.1, 0.0, -0.3),
            ),
        );
        table
    }

    #[test]
    fn reference_is_implicit_identity() {
        let mut table = ReferenceTransformTable::new(45);
        table.insert(45, Transform3D::new(Vector3::new(1.0, 0.0, 0.0), UnitQuaternion::identity()));
        assert!(table.is_empty());
        assert_eq!(table.get(45), Some(Transform3D::identity()));
        assert!(table.resolves(45));
        assert!(!table.resolves(3));
        assert!(table.get(3).is_none());
    }

    #[test]
    fn save_then_load_is_bit_identical() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("nested").join("marker_transforms.json");
        let table = sample_table();
        table.save(&path).expect("save");

        let loaded = ReferenceTransformTable::load(&path).expect("load");
        assert_eq!(loaded.reference_id(), 45);
        assert_eq!(loaded.calibration_id(), table.calibration_id());
        assert_eq!(loaded.created_at(), table.created_at());
        assert_eq!(loaded.len(), 2);
        for (id, original) in table.iter() {
            let back = loaded.get(id).expect("entry survives");
            assert_eq!(back.to_record(), original.to_record());
            assert!((back.translation - original.translation).abs().max() <= 1e-9);
        }
    }

    #[test]
    fn records_are_sorted_by_id() {
        let json = sample_table().to_json().unwrap();
        let pos7 = json.find("\"id\": 7").unwrap();
        let pos12 = json.find("\"id\": 12").unwrap();
        assert!(pos7 < pos12);
        assert!(json.contains("\"rotation\""));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = ReferenceTransformTable::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, TableError::Io(_)));
    }

    #[test]
    fn zero_quaternion_is_rejected() {
        let raw = r#"{
            "reference_id": 1,
            "calibration_id": "00000000-0000-0000-0000-000000000000",
            "created_at": "2024-01-01T00:00:00Z",
            "transforms": [
                { "id": 2, "translation": [0.0, 0.0, 0.0], "rotation": [0.0, 0.0, 0.0, 0.0] }
            ]
        }"#;
        assert!(matches!(
            ReferenceTransformTable::from_json(raw),
            Err(TableError::NonFinite(2))
        ));
    }

    #[test]
    fn reference_entry_is_rejected() {
        let raw = r#"{
            "reference_id": 1,
            "calibration_id": "00000000-0000-0000-0000-000000000000",
            "created_at": "2024-01-01T00:00:00Z",
            "transforms": [
                { "id": 1, "translation": [0.0, 0.0, 0.0], "rotation": [0.0, 0.0, 0.0, 1.0] }
            ]
        }"#;
        assert!(matches!(
            ReferenceTransformTable::from_json(raw),
            Err(TableError::ContainsReference(1))
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            ReferenceTransformTable::from_json("{ not json"),
            Err(TableError::Json(_))
        ));
    }
}
