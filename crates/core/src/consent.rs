//! Consent catalogue.
//!
//! The catalogue lists the consent items offered at step 6 and which of them are required. A
//! deployment may supply its own catalogue as YAML; otherwise the built-in default is used.

use crate::error::{EnrolError, EnrolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentItem {
    pub id: String,
    pub label: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ConsentItem {
    fn new(id: &str, label: &str, required: bool, description: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            required,
            description: Some(description.to_string()),
        }
    }
}

/// Validated, ordered list of consent items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConsentCatalogue {
    items: Vec<ConsentItem>,
}

impl ConsentCatalogue {
    /// # Errors
    ///
    /// Returns `EnrolError::InvalidInput` if the list is empty, an id is blank, or an id
    /// appears twice.
    pub fn new(items: Vec<ConsentItem>) -> EnrolResult<Self> {
        if items.is_empty() {
            return Err(EnrolError::InvalidInput(
                "consent catalogue must contain at least one item".into(),
            ));
        }
        let mut seen = HashSet::new();
        for item in &items {
            if item.id.trim().is_empty() {
                return Err(EnrolError::InvalidInput(
                    "consent item id cannot be empty".into(),
                ));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(EnrolError::InvalidInput(format!(
                    "duplicate consent item id: {}",
                    item.id
                )));
            }
        }
        Ok(Self { items })
    }

    pub fn default_catalogue() -> Self {
        Self {
            items: vec![
                ConsentItem::new(
                    "registration",
                    "Registration",
                    true,
                    "Store my details to register me as a patient",
                ),
                ConsentItem::new(
                    "treatment",
                    "Treatment",
                    true,
                    "Use my health information to provide care",
                ),
                ConsentItem::new(
                    "health-id-linking",
                    "Health ID linking",
                    false,
                    "Link records from other providers to my health ID",
                ),
                ConsentItem::new(
                    "data-sharing",
                    "Data sharing",
                    false,
                    "Share my records with providers involved in my care",
                ),
                ConsentItem::new(
                    "research",
                    "Research",
                    false,
                    "Use my de-identified data for research",
                ),
                ConsentItem::new(
                    "communications",
                    "Communications",
                    false,
                    "Contact me with reminders and health updates",
                ),
            ],
        }
    }

    /// Parses a YAML list of items, reporting the path of the first bad field.
    pub fn parse_yaml(yaml_text: &str) -> EnrolResult<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let items: Vec<ConsentItem> = serde_path_to_error::deserialize(deserializer)
            .map_err(|e| EnrolError::YamlDeserialization(format!("{}: {}", e.path(), e.inner())))?;
        Self::new(items)
    }

    pub fn load(path: &Path) -> EnrolResult<Self> {
        let text = std::fs::read_to_string(path).map_err(EnrolError::FileRead)?;
        Self::parse_yaml(&text)
    }

    pub fn items(&self) -> &[ConsentItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&ConsentItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn required_items(&self) -> impl Iterator<Item = &ConsentItem> {
        self.items.iter().filter(|item| item.required)
    }
}

impl Default for ConsentCatalogue {
    fn default() -> Self {
        Self::default_catalogue()
    }
}
