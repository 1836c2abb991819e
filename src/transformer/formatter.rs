//! Integration payload output
//!
//! Renders events and inventory in the integration protocol (version 3)
//! JSON layout.
//!
//! # Format
//!
//! ```text
//! {
//!   "name": "flex-collector",
//!   "protocol_version": "3",
//!   "integration_version": "0.1.0",
//!   "data": [
//!     {"metrics": [{"event_type": "diskSample", "used": 42}],
//!      "inventory": {"config": {"port": "8080"}},
//!      "events": []},
//!     {"entity": {"name": "db-1", "type": "postgres"},
//!      "metrics": [], "inventory": {},
//!      "events": [{"summary": "failover", "category": "state"}]}
//!   ]
//! }
//! ```
//!
//! The first block is the local entity; APIs naming an `entity` get a block
//! of their own.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{EntityId, StringMap};

use super::sample::Sample;

/// Protocol version of the payload
pub const PROTOCOL_VERSION: &str = "3";

/// Inventory: category -> item -> value
pub type Inventory = BTreeMap<String, BTreeMap<String, Value>>;

/// One entity block of the payload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
    pub metrics: Vec<Sample>,
    pub inventory: Inventory,
    pub events: Vec<Value>,
}

/// Full integration payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationPayload {
    pub name: String,
    pub protocol_version: String,
    pub integration_version: String,
    pub data: Vec<EntityData>,
}

impl Default for IntegrationPayload {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            integration_version: env!("CARGO_PKG_VERSION").to_string(),
            data: vec![EntityData::default()],
        }
    }
}

impl IntegrationPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block of an entity, created on first use; `None` is the local entity
    fn entity(&mut self, id: Option<&EntityId>) -> &mut EntityData {
        if self.data.is_empty() {
            self.data.push(EntityData::default());
        }
        let Some(id) = id else {
            return &mut self.data[0];
        };
        let index = match self.data.iter().position(|d| d.entity.as_ref() == Some(id)) {
            Some(index) => index,
            None => {
                self.data.push(EntityData {
                    entity: Some(id.clone()),
                    ..Default::default()
                });
                self.data.len() - 1
            }
        };
        &mut self.data[index]
    }

    /// Append emitted samples
    pub fn add_samples(&mut self, entity: Option<&EntityId>, samples: impl IntoIterator<Item = Sample>) {
        self.entity(entity).metrics.extend(samples);
    }

    /// Record events of a sample
    ///
    /// `mapping` is the API's `events` directive: attribute -> category. The
    /// attribute's value is the event summary; an empty category or `value`
    /// uses the attribute name.
    pub fn add_events(&mut self, entity: Option<&EntityId>, sample: &Sample, mapping: &StringMap) {
        let events = &mut self.entity(entity).events;
        for (attribute, category) in mapping.iter() {
            let Some(summary) = sample.get_string(attribute) else {
                continue;
            };
            let category = if category.is_empty() || category == "value" {
                attribute
            } else {
                category
            };
            events.push(serde_json::json!({
                "summary": summary,
                "category": category,
                "attributes": {"event_type": sample.event_type},
            }));
        }
    }

    /// Record inventory items of a sample
    ///
    /// `mapping` is the API's `inventory` directive: attribute -> category.
    /// A category of `value` files the attribute under its own name.
    pub fn add_inventory(&mut self, entity: Option<&EntityId>, sample: &Sample, mapping: &StringMap) {
        let inventory = &mut self.entity(entity).inventory;
        for (attribute, category) in mapping.iter() {
            let Some(value) = sample.get(attribute) else {
                continue;
            };
            let category = if category.is_empty() || category == "value" {
                attribute
            } else {
                category
            };
            inventory
                .entry(category.to_string())
                .or_default()
                .insert(attribute.to_string(), value.clone());
        }
    }

    pub fn sample_count(&self) -> usize {
        self.data.iter().map(|d| d.metrics.len()).sum()
    }

    pub fn inventory_count(&self) -> usize {
        self.data.iter().map(|d| d.inventory.len()).sum()
    }

    pub fn event_count(&self) -> usize {
        self.data.iter().map(|d| d.events.len()).sum()
    }
}

/// Payload formatter
#[derive(Debug, Clone, Default)]
pub struct PayloadFormatter {
    pretty: bool,
}

impl PayloadFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to pretty-print the output
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Render any serializable value (payload or metric batches)
    pub fn format<T: Serialize>(&self, value: &T) -> serde_json::Result<String> {
        if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
    }
}
