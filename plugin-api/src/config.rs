// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

/// Soft cap on spans per trace; error spans may run up to twice this.
pub const DEFAULT_MAX_SPANS: usize = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid plugin properties: {0}")]
    InvalidProperties(#[from] serde_json::Error),
}

/// Typed plugin property. Lookups are type-checked: asking for the wrong
/// type behaves as if the property were unset.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Boolean(bool),
    Double(f64),
    String(String),
}

/// Change callback. No payload is delivered: the receiver re-reads the
/// latest values, which avoids ordering worries when two updates race.
pub trait ConfigListener: Send + Sync {
    fn on_change(&self);
}

struct ConfigInner {
    enabled: AtomicBool,
    max_spans: AtomicUsize,
    properties: ArcSwap<HashMap<String, PropertyValue>>,
    listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
}

/// Shared plugin configuration with lock-free reads on the hot path.
#[derive(Clone)]
pub struct PluginConfig {
    inner: Arc<ConfigInner>,
}

impl PluginConfig {
    pub fn new() -> Self {
        PluginConfig {
            inner: Arc::new(ConfigInner {
                enabled: AtomicBool::new(true),
                max_spans: AtomicUsize::new(DEFAULT_MAX_SPANS),
                properties: ArcSwap::from_pointee(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
        self.notify();
    }

    pub fn max_spans(&self) -> usize {
        self.inner.max_spans.load(Ordering::Relaxed)
    }

    pub fn set_max_spans(&self, max_spans: usize) {
        self.inner.max_spans.store(max_spans, Ordering::Relaxed);
        self.notify();
    }

    /// `""` when unset or not a string property.
    pub fn string_property(&self, name: &str) -> String {
        match self.inner.properties.load().get(name) {
            Some(PropertyValue::String(value)) => value.clone(),
            _ => String::new(),
        }
    }

    /// `false` when unset or not a boolean property.
    pub fn boolean_property(&self, name: &str) -> bool {
        matches!(
            self.inner.properties.load().get(name),
            Some(PropertyValue::Boolean(true))
        )
    }

    /// `None` when unset or not a numeric property.
    pub fn double_property(&self, name: &str) -> Option<f64> {
        match self.inner.properties.load().get(name) {
            Some(PropertyValue::Double(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn set_property(&self, name: impl Into<String>, value: PropertyValue) {
        let name = name.into();
        self.inner.properties.rcu(|properties| {
            let mut properties = HashMap::clone(properties);
            properties.insert(name.clone(), value.clone());
            properties
        });
        self.notify();
    }

    /// Replaces the whole property map from a JSON object.
    pub fn load_properties(&self, json: &serde_json::Value) -> Result<(), ConfigError> {
        let properties: HashMap<String, PropertyValue> =
            serde_json::from_value(json.clone())?;
        self.inner.properties.store(Arc::new(properties));
        self.notify();
        Ok(())
    }

    pub fn register_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.inner.listeners.lock().push(listener);
    }

    fn notify(&self) {
        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener.on_change();
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self::new()
    }
}
