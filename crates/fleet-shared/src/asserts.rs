//! Assertion records: model, serial and store.
//!
//! Signature verification happens upstream of this module. What lands
//! here is already trusted, so the database only enforces identity and
//! revision ordering.

use crate::error::AssertsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Security grade of a model. `Unset` marks legacy models without
/// recovery systems or managed boot assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelGrade {
    #[default]
    Unset,
    Dangerous,
    Signed,
    Secured,
}

impl ModelGrade {
    pub fn is_set(&self) -> bool {
        !matches!(self, ModelGrade::Unset)
    }
}

impl fmt::Display for ModelGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelGrade::Unset => "unset",
            ModelGrade::Dangerous => "dangerous",
            ModelGrade::Signed => "signed",
            ModelGrade::Secured => "secured",
        };
        f.write_str(s)
    }
}

/// Signed statement of what a device is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Model {
    pub brand_id: String,
    pub model: String,
    #[serde(default)]
    pub grade: ModelGrade,
    #[serde(default)]
    pub classic: bool,
    #[serde(default)]
    pub gadget: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub base: String,
    /// Brand store id; empty means the global store
    #[serde(default)]
    pub store: String,
    #[serde(default)]
    pub revision: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub required_snaps: Vec<String>,
}

impl Model {
    /// "brand/model" as used in logs and summaries.
    pub fn key(&self) -> String {
        format!("{}/{}", self.brand_id, self.model)
    }

    pub fn encode(&self) -> Result<String, AssertsError> {
        Assertion::Model(self.clone()).encode()
    }
}

/// Binds a device key to a brand, model and serial number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Serial {
    pub brand_id: String,
    pub model: String,
    pub serial: String,
    pub device_key_id: String,
    #[serde(default)]
    pub device_key: String,
    #[serde(default)]
    pub revision: u32,
    pub timestamp: DateTime<Utc>,
}

impl Serial {
    pub fn encode(&self) -> Result<String, AssertsError> {
        Assertion::Serial(self.clone()).encode()
    }
}

/// Store (proxy) declaration referenced by a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreAssertion {
    pub store: String,
    pub operator_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revision: u32,
}

/// Any assertion, tagged with its type on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Assertion {
    Model(Model),
    Serial(Serial),
    Store(StoreAssertion),
}

impl Assertion {
    pub fn kind(&self) -> &'static str {
        match self {
            Assertion::Model(_) => "model",
            Assertion::Serial(_) => "serial",
            Assertion::Store(_) => "store",
        }
    }

    pub fn encode(&self) -> Result<String, AssertsError> {
        serde_json::to_string(self).map_err(|e| AssertsError::Encode(e.to_string()))
    }

    pub fn decode(data: &str) -> Result<Self, AssertsError> {
        serde_json::from_str(data).map_err(|e| AssertsError::Decode(e.to_string()))
    }
}

/// Accepted assertions, keyed by their primary keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssertionDb {
    #[serde(default)]
    models: BTreeMap<String, Model>,
    #[serde(default)]
    serials: BTreeMap<String, Serial>,
    #[serde(default)]
    stores: BTreeMap<String, StoreAssertion>,
}

fn check_revision(kind: &'static str, key: &str, current: u32, new: u32) -> Result<(), AssertsError> {
    if new == current {
        return Err(AssertsError::AlreadyAccepted {
            kind,
            key: key.to_string(),
            revision: new,
        });
    }
    if new < current {
        return Err(AssertsError::Outdated {
            kind,
            key: key.to_string(),
            new,
            current,
        });
    }
    Ok(())
}

impl AssertionDb {
    pub fn add(&mut self, a: Assertion) -> Result<(), AssertsError> {
        match a {
            Assertion::Model(m) => self.add_model(m),
            Assertion::Serial(s) => self.add_serial(s),
            Assertion::Store(s) => self.add_store(s),
        }
    }

    /// Adds a model, replacing an older revision of the same brand/model.
    pub fn add_model(&mut self, model: Model) -> Result<(), AssertsError> {
        let key = model.key();
        if let Some(cur) = self.models.get(&key) {
            check_revision("model", &key, cur.revision, model.revision)?;
        }
        self.models.insert(key, model);
        Ok(())
    }

    pub fn add_serial(&mut self, serial: Serial) -> Result<(), AssertsError> {
        let key = format!("{}/{}/{}", serial.brand_id, serial.model, serial.serial);
        if let Some(cur) = self.serials.get(&key) {
            check_revision("serial", &key, cur.revision, serial.revision)?;
        }
        self.serials.insert(key, serial);
        Ok(())
    }

    pub fn add_store(&mut self, store: StoreAssertion) -> Result<(), AssertsError> {
        if let Some(cur) = self.stores.get(&store.store) {
            check_revision("store", &store.store, cur.revision, store.revision)?;
        }
        self.stores.insert(store.store.clone(), store);
        Ok(())
    }

    pub fn find_model(&self, brand_id: &str, model: &str) -> Result<&Model, AssertsError> {
        self.models
            .get(&format!("{}/{}", brand_id, model))
            .ok_or(AssertsError::NotFound { kind: "model" })
    }

    pub fn find_serial(&self, brand_id: &str, model: &str, serial: &str) -> Result<&Serial, AssertsError> {
        self.serials
            .get(&format!("{}/{}/{}", brand_id, model, serial))
            .ok_or(AssertsError::NotFound { kind: "serial" })
    }

    /// Serials issued for the given device key.
    pub fn find_serials_for_key(&self, brand_id: &str, model: &str, device_key_id: &str) -> Vec<&Serial> {
        self.serials
            .values()
            .filter(|s| s.brand_id == brand_id && s.model == model && s.device_key_id == device_key_id)
            .collect()
    }

    pub fn find_store(&self, store: &str) -> Result<&StoreAssertion, AssertsError> {
        self.stores
            .get(store)
            .ok_or(AssertsError::NotFound { kind: "store" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(revision: u32) -> Model {
        Model {
            brand_id: "canonical".to_string(),
            model: "pc".to_string(),
            grade: ModelGrade::Unset,
            classic: false,
            gadget: "pc".to_string(),
            kernel: "pc-kernel".to_string(),
            base: "core18".to_string(),
            store: String::new(),
            revision,
            timestamp: Utc::now(),
            required_snaps: vec![],
        }
    }

    #[test]
    fn test_add_model_replaces_older_revision() {
        let mut db = AssertionDb::default();
        db.add_model(model(1)).unwrap();
        db.add_model(model(2)).unwrap();
        assert_eq!(db.find_model("canonical", "pc").unwrap().revision, 2);
    }

    #[test]
    fn test_add_model_same_revision_already_accepted() {
        let mut db = AssertionDb::default();
        db.add_model(model(1)).unwrap();
        let err = db.add_model(model(1)).unwrap_err();
        assert!(err.is_already_accepted());

        let err = db.add_model(model(0)).unwrap_err();
        assert!(matches!(err, AssertsError::Outdated { .. }));
    }

    #[test]
    fn test_find_missing_is_not_found() {
        let db = AssertionDb::default();
        assert!(db.find_model("canonical", "pc").unwrap_err().is_not_found());
        assert!(db.find_serial("canonical", "pc", "1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_decode_keeps_type() {
        let enc = model(3).encode().unwrap();
        assert!(enc.contains("\"type\":\"model\""));
        match Assertion::decode(&enc).unwrap() {
            Assertion::Model(m) => assert_eq!(m.revision, 3),
            other => panic!("unexpected assertion {:?}", other.kind()),
        }
        assert!(Assertion::decode("not json").is_err());
    }

    #[test]
    fn test_find_serials_for_key() {
        let mut db = AssertionDb::default();
        db.add_serial(Serial {
            brand_id: "canonical".to_string(),
            model: "pc".to_string(),
            serial: "1234".to_string(),
            device_key_id: "key-1".to_string(),
            device_key: String::new(),
            revision: 0,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(db.find_serials_for_key("canonical", "pc", "key-1").len(), 1);
        assert!(db.find_serials_for_key("canonical", "pc", "key-2").is_empty());
    }
}
