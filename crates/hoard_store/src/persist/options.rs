//! Per-cell persistence options

use super::codec::{Codec, JsonCodec, SharedCodec};
use crate::config::StoreConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Which backend a cell persists to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// The registry's synchronous key-value store
    #[default]
    Local,
    /// The registry's connection pool; unset names fall back to the config
    Pooled {
        db_name: Option<String>,
        store_name: Option<String>,
    },
}

/// How (and whether) a registry cell is mirrored to storage
///
/// Unset values fall back to the registry's [`StoreConfig`].
///
/// ```rust
/// use hoard_store::PersistOptions;
/// use std::time::Duration;
///
/// let options = PersistOptions::<Vec<String>>::json()
///     .pooled("app", "todos")
///     .debounce(Duration::from_millis(100))
///     .emit_events(true);
/// assert!(options.is_enabled());
/// ```
pub struct PersistOptions<T> {
    enabled: bool,
    backend: BackendKind,
    storage_key: Option<String>,
    codec: SharedCodec<T>,
    debounce: Option<Duration>,
    emit_events: Option<bool>,
    hydrate_timeout: Option<Duration>,
}

impl<T: Serialize + DeserializeOwned + 'static> PersistOptions<T> {
    /// Local backend, JSON codec, registry defaults for everything else
    pub fn json() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl<T: 'static> PersistOptions<T> {
    pub fn with_codec(codec: impl Codec<T> + 'static) -> Self {
        Self::with_shared_codec(Arc::new(codec))
    }

    pub fn with_shared_codec(codec: SharedCodec<T>) -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Local,
            storage_key: None,
            codec,
            debounce: None,
            emit_events: None,
            hydrate_timeout: None,
        }
    }
}

impl<T> PersistOptions<T> {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn local(mut self) -> Self {
        self.backend = BackendKind::Local;
        self
    }

    pub fn pooled(mut self, db_name: impl Into<String>, store_name: impl Into<String>) -> Self {
        self.backend = BackendKind::Pooled {
            db_name: Some(db_name.into()),
            store_name: Some(store_name.into()),
        };
        self
    }

    /// Pooled backend with the configured database and store names
    pub fn pooled_default(mut self) -> Self {
        self.backend = BackendKind::Pooled {
            db_name: None,
            store_name: None,
        };
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window);
        self
    }

    pub fn emit_events(mut self, emit: bool) -> Self {
        self.emit_events = Some(emit);
        self
    }

    pub fn hydrate_timeout(mut self, timeout: Duration) -> Self {
        self.hydrate_timeout = Some(timeout);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn codec(&self) -> &SharedCodec<T> {
        &self.codec
    }

    /// Fill unset values from `config` for the registry key `key`
    pub fn resolve(&self, key: &str, config: &StoreConfig) -> ResolvedOptions {
        let target = match &self.backend {
            BackendKind::Local => TargetSpec::Local,
            BackendKind::Pooled {
                db_name,
                store_name,
            } => TargetSpec::Pooled {
                db_name: db_name.clone().unwrap_or_else(|| config.db_name.clone()),
                store_name: store_name
                    .clone()
                    .unwrap_or_else(|| config.store_name.clone()),
            },
        };
        ResolvedOptions {
            storage_key: self
                .storage_key
                .clone()
                .unwrap_or_else(|| config.storage_key(key)),
            target,
            debounce: self.debounce.unwrap_or_else(|| config.debounce()),
            emit_events: self.emit_events.unwrap_or(config.emit_events),
            hydrate_timeout: self.hydrate_timeout.or_else(|| config.hydrate_timeout()),
        }
    }
}

impl<T> Clone for PersistOptions<T> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            backend: self.backend.clone(),
            storage_key: self.storage_key.clone(),
            codec: self.codec.clone(),
            debounce: self.debounce,
            emit_events: self.emit_events,
            hydrate_timeout: self.hydrate_timeout,
        }
    }
}

impl<T> fmt::Debug for PersistOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistOptions")
            .field("enabled", &self.enabled)
            .field("backend", &self.backend)
            .field("storage_key", &self.storage_key)
            .field("debounce", &self.debounce)
            .field("emit_events", &self.emit_events)
            .field("hydrate_timeout", &self.hydrate_timeout)
            .finish_non_exhaustive()
    }
}

/// Fully addressed backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetSpec {
    Local,
    Pooled { db_name: String, store_name: String },
}

/// Options with every default applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub storage_key: String,
    pub target: TargetSpec,
    pub debounce: Duration,
    pub emit_events: bool,
    pub hydrate_timeout: Option<Duration>,
}
