//! Place model

use serde::{Deserialize, Serialize};

use super::visit::new_record_id;

/// A location visits point at. Places have no sync status of their own;
/// they are pushed on demand as a dependency of a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub category: Option<String>,
}

impl Place {
    #[must_use]
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: new_record_id(),
            name: name.into(),
            latitude,
            longitude,
            address: None,
            category: None,
        }
    }
}
