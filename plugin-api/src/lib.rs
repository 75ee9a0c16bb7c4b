pub mod config;
pub mod registry;
pub mod services;

pub use config::{ConfigError, ConfigListener, PluginConfig, PropertyValue, DEFAULT_MAX_SPANS};
pub use registry::TraceRegistry;
pub use services::{MetricTimer, PluginServices, PluginSpan, ThreadSourceFactory};
