use base64::{engine::general_purpose::STANDARD, Engine as _};
use indexmap::IndexMap;
use log::{info, warn};
use thiserror::Error;

use crate::{
    attributes::{is_truthy, AttributeStore, ParseError},
    keys::{MANAGED_PROPERTIES, PASSWORD_MASK, PROP_GATEWAY_PASSWORD, PROP_PASSWORD},
};

/// Usable bytes of the 1 KiB properties blob once its marker is accounted for.
pub const MAX_PROPERTIES_BYTES: usize = 1024 - 14;

pub const ADMIN_USER: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("properties need {size} bytes but only {capacity} are available")]
    CapacityExceeded { size: usize, capacity: usize },
    #[error("property store failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertiesError {
    #[error("invalid properties: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence backend for the properties blob.
pub trait PropertyStore {
    fn load(&mut self) -> Result<Option<String>, StoreError>;
    fn save(&mut self, blob: &str) -> Result<(), StoreError>;
}

/// Node configuration as key/value text, persisted through a [`PropertyStore`].
///
/// Three layers answer a lookup, first hit wins: values noted at runtime (addresses, versions),
/// persisted values, then defaults. Only the persisted layer is ever written to the store.
pub struct Properties {
    persisted: AttributeStore,
    noted: AttributeStore,
    defaults: AttributeStore,
    declared: Vec<String>,
    store: Box<dyn PropertyStore>,
}

impl Properties {
    pub fn new(store: Box<dyn PropertyStore>) -> Self {
        Self {
            persisted: AttributeStore::new(),
            noted: AttributeStore::new(),
            defaults: AttributeStore::new(),
            declared: MANAGED_PROPERTIES.iter().map(|key| key.to_string()).collect(),
            store,
        }
    }

    /// Lists `key` under `/defaults` even while it has no value.
    pub fn declare(&mut self, key: &str) {
        if !self.declared.iter().any(|declared| declared == key) {
            self.declared.push(key.to_string());
        }
    }

    /// Reads the persisted blob. Unreadable text is discarded and an empty blob saved.
    pub fn load(&mut self) -> Result<(), StoreError> {
        let Some(blob) = self.store.load()? else {
            info!("No stored properties, starting empty");
            return Ok(());
        };
        match AttributeStore::parse(&blob) {
            Ok(persisted) => {
                info!("Loaded {} properties", persisted.len());
                self.persisted = persisted;
                Ok(())
            }
            Err(err) => {
                warn!("Stored properties are unreadable, resetting: {err}");
                self.persisted.clear();
                self.save()
            }
        }
    }

    pub fn save(&mut self) -> Result<(), StoreError> {
        let blob = self.persisted.to_json();
        if blob.len() > MAX_PROPERTIES_BYTES {
            warn!(
                "Properties do not fit ({} > {MAX_PROPERTIES_BYTES} bytes), not saved",
                blob.len()
            );
            return Err(StoreError::CapacityExceeded {
                size: blob.len(),
                capacity: MAX_PROPERTIES_BYTES,
            });
        }
        self.store.save(&blob)?;
        info!("Saved properties ({} bytes)", blob.len());
        Ok(())
    }

    /// Persists `value` when it differs from the stored one. Returns whether it changed.
    pub fn put(&mut self, key: &str, value: &str) -> Result<bool, StoreError> {
        if !self.persisted.set(key, Some(value)) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        if !self.persisted.remove(key) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Records a runtime fact that is never persisted.
    pub fn note(&mut self, key: &str, value: &str) {
        self.noted.set(key, Some(value));
    }

    /// Fallback used while nothing is persisted for `key`.
    pub fn set_default(&mut self, key: &str, value: &str) {
        self.defaults.set(key, Some(value));
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.persisted.clear();
        self.save()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.noted
            .get(key)
            .or_else(|| self.persisted.get(key))
            .or_else(|| self.defaults.get(key))
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_truthy)
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.parsed(key).unwrap_or(0)
    }

    pub fn get_unsigned(&self, key: &str) -> u64 {
        self.parsed(key).unwrap_or(0)
    }

    pub fn get_float(&self, key: &str) -> f32 {
        self.parsed(key).unwrap_or(0.0)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }

    /// Listing served by `GET /defaults`, with secrets masked.
    pub fn masked_json(&self) -> String {
        let mut listing: IndexMap<&str, Option<&str>> = IndexMap::new();
        for (key, value) in self.persisted.iter() {
            listing.insert(key, Some(value));
        }
        for key in &self.declared {
            listing
                .entry(key.as_str())
                .or_insert_with(|| self.defaults.get(key));
        }
        for (key, value) in self.noted.iter() {
            listing.insert(key, Some(value));
        }
        for (key, value) in self.defaults.iter() {
            listing.entry(key).or_insert(Some(value));
        }

        match listing.get(PROP_PASSWORD) {
            Some(Some(_)) => {
                listing.insert(PROP_PASSWORD, Some(PASSWORD_MASK));
            }
            _ => {
                listing.shift_remove(PROP_PASSWORD);
            }
        }
        if let Some(value) = listing.get_mut(PROP_GATEWAY_PASSWORD) {
            *value = Some(if value.is_some() { PASSWORD_MASK } else { "" });
        }

        serde_json::to_string(&listing).unwrap_or_else(|_| String::from("{}"))
    }

    /// Replaces the persisted values from a `/defaults` listing.
    ///
    /// The current `Password` always survives; `GatewayPassword` survives unless the listing
    /// carries a real new value. Runtime-only keys echoed back by the listing are dropped.
    pub fn update_from(&mut self, text: &str) -> Result<(), PropertiesError> {
        let mut incoming = AttributeStore::parse(text)?;

        let runtime_only: Vec<String> = self
            .noted
            .keys()
            .filter(|key| !self.declared.iter().any(|declared| declared == key))
            .map(str::to_string)
            .collect();
        for key in runtime_only {
            incoming.remove(&key);
        }

        match self.persisted.get(PROP_PASSWORD) {
            Some(password) => {
                incoming.set(PROP_PASSWORD, Some(password));
            }
            None => {
                incoming.remove(PROP_PASSWORD);
            }
        }
        if let Some(current) = self.persisted.get(PROP_GATEWAY_PASSWORD) {
            let replaced = incoming
                .get(PROP_GATEWAY_PASSWORD)
                .is_some_and(|value| value != PASSWORD_MASK);
            if !replaced {
                incoming.set(PROP_GATEWAY_PASSWORD, Some(current));
            }
        }

        self.persisted = incoming;
        self.save()?;
        Ok(())
    }

    /// Bulk replace used by `/setup`. Nothing changes when `text` does not parse.
    pub fn replace_from(&mut self, text: &str) -> Result<(), PropertiesError> {
        self.persisted = AttributeStore::parse(text)?;
        self.save()?;
        Ok(())
    }

    /// Checks an `Authorization` header against `admin:{Password}`.
    /// Always passes while no password is set.
    pub fn authorize(&self, authorization: Option<&str>) -> bool {
        let Some(password) = self.persisted.get(PROP_PASSWORD) else {
            return true;
        };
        let Some(encoded) = authorization.and_then(|header| header.trim().strip_prefix("Basic "))
        else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        match std::str::from_utf8(&decoded) {
            Ok(credentials) => credentials
                .split_once(':')
                .is_some_and(|(user, pass)| user == ADMIN_USER && pass == password),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keys::{PROP_IP, PROP_NICKNAME, PROP_UID},
        testing::MemoryStore,
    };
    use pretty_assertions::assert_eq;

    fn properties_with(blob: Option<&str>) -> (Properties, MemoryStore) {
        let store = MemoryStore::new(blob);
        let mut properties = Properties::new(Box::new(store.clone()));
        properties.load().unwrap();
        (properties, store)
    }

    #[test]
    fn put_saves_only_on_change() {
        let (mut properties, store) = properties_with(None);
        assert!(properties.put(PROP_NICKNAME, "Garage").unwrap());
        assert_eq!(store.saves(), 1);
        assert!(!properties.put(PROP_NICKNAME, "Garage").unwrap());
        assert_eq!(store.saves(), 1);
        assert_eq!(store.blob().as_deref(), Some(r#"{"Nickname":"Garage"}"#));
    }

    #[test]
    fn noted_and_default_values_are_not_persisted() {
        let (mut properties, store) = properties_with(Some(r#"{"IpCheck":"5"}"#));
        properties.note(PROP_UID, "aabbcc");
        properties.set_default("IpPort", "80");
        properties.set_default("IpCheck", "60");
        assert_eq!(properties.get(PROP_UID), Some("aabbcc"));
        assert_eq!(properties.get_unsigned("IpPort"), 80);
        assert_eq!(properties.get_unsigned("IpCheck"), 5);

        properties.put(PROP_NICKNAME, "Shed").unwrap();
        assert_eq!(
            store.blob().as_deref(),
            Some(r#"{"IpCheck":"5","Nickname":"Shed"}"#)
        );
    }

    #[test]
    fn unreadable_blob_is_reset() {
        let (properties, store) = properties_with(Some(r#"{"Nickname":"#));
        assert!(!properties.has(PROP_NICKNAME));
        assert_eq!(store.blob().as_deref(), Some("{}"));
    }

    #[test]
    fn oversized_save_is_reported_and_kept_in_memory() {
        let (mut properties, store) = properties_with(None);
        let long = "x".repeat(MAX_PROPERTIES_BYTES);
        let result = properties.put("Blob", &long);
        assert!(matches!(
            result,
            Err(StoreError::CapacityExceeded { capacity: MAX_PROPERTIES_BYTES, .. })
        ));
        assert_eq!(properties.get("Blob"), Some(long.as_str()));
        assert_eq!(store.saves(), 0);
    }

    #[test]
    fn listing_masks_secrets_and_shows_unset_keys() {
        let (mut properties, _) = properties_with(Some(
            r#"{"Nickname":"Porch","Password":"hunter2","GatewayPassword":"gw"}"#,
        ));
        properties.note(PROP_IP, "10.0.0.7");
        assert_eq!(
            properties.masked_json(),
            r#"{"Nickname":"Porch","Password":"********","GatewayPassword":"********","NetworkRestart":null,"NoMulticast":null,"ip":"10.0.0.7","gw":null,"nm":null}"#
        );
    }

    #[test]
    fn listing_omits_an_empty_password() {
        let (properties, _) = properties_with(None);
        let listing = properties.masked_json();
        assert!(!listing.contains(PROP_PASSWORD));
        assert!(listing.starts_with(r#"{"Nickname":null"#));
    }

    #[test]
    fn update_keeps_passwords() {
        let (mut properties, store) = properties_with(Some(
            r#"{"Password":"hunter2","GatewayPassword":"gw"}"#,
        ));
        properties.note(PROP_UID, "aabbcc");
        properties
            .update_from(
                r#"{"Nickname":"Den","Password":"changed","GatewayPassword":"********","uid":"aabbcc"}"#,
            )
            .unwrap();
        assert_eq!(
            store.blob().as_deref(),
            Some(r#"{"Nickname":"Den","Password":"hunter2","GatewayPassword":"gw"}"#)
        );

        properties
            .update_from(r#"{"GatewayPassword":"fresh"}"#)
            .unwrap();
        assert_eq!(properties.get(PROP_GATEWAY_PASSWORD), Some("fresh"));
        assert_eq!(properties.get(PROP_PASSWORD), Some("hunter2"));
    }

    #[test]
    fn replace_validates_before_touching_values() {
        let (mut properties, store) = properties_with(Some(r#"{"Nickname":"Den"}"#));
        let err = properties.replace_from(r#"{"Nickname" "x"}"#).unwrap_err();
        assert!(matches!(err, PropertiesError::Parse(ParseError::MissingColon(_))));
        assert_eq!(properties.get(PROP_NICKNAME), Some("Den"));
        assert_eq!(store.saves(), 0);

        properties.replace_from(r#"{"NoMulticast":"true","IpCheck":"0"}"#).unwrap();
        assert!(properties.is("NoMulticast"));
        assert!(!properties.is("IpCheck"));
        assert!(!properties.has(PROP_NICKNAME));
    }

    #[test]
    fn authorization_requires_admin_password() {
        let (mut properties, _) = properties_with(None);
        assert!(properties.authorize(None));

        properties.put(PROP_PASSWORD, "secret").unwrap();
        let good = format!("Basic {}", STANDARD.encode("admin:secret"));
        let wrong = format!("Basic {}", STANDARD.encode("admin:nope"));
        assert!(properties.authorize(Some(&good)));
        assert!(!properties.authorize(Some(&wrong)));
        assert!(!properties.authorize(Some("Bearer abc")));
        assert!(!properties.authorize(None));
    }

    #[test]
    fn backend_failure_is_surfaced() {
        let store = MemoryStore::failing();
        let mut properties = Properties::new(Box::new(store));
        assert!(matches!(
            properties.put(PROP_NICKNAME, "x"),
            Err(StoreError::Backend(_))
        ));
    }
}
