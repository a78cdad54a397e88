use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Map, Value, json};

/// Wording vendors use when a single field has a value they do not accept.
static REJECTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(invalid|unsupported|not supported|not allowed|must be|one of|expected|out of range|illegal|required|missing)",
    )
    .ok()
});

/// Adjusts submission parameters after an upstream validation error.
/// Best-effort: returning `None` means "no idea", and the error surfaces.
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Mutate `params` and describe the change, or leave them alone.
    fn repair(&self, message: &str, params: &mut Map<String, Value>) -> Option<String>;
}

/// When the vendor complains about `field`, first substitute a conservative
/// value, then drop the field entirely.
pub struct EnumFallback {
    field: String,
    fallback: Value,
    mention: Regex,
}

impl EnumFallback {
    pub fn new(field: &str, fallback: Value) -> Result<Self, regex::Error> {
        let mention = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(field)))?;
        Ok(Self {
            field: field.to_string(),
            fallback,
            mention,
        })
    }
}

impl RepairStrategy for EnumFallback {
    fn name(&self) -> &str {
        &self.field
    }

    fn repair(&self, message: &str, params: &mut Map<String, Value>) -> Option<String> {
        if !self.mention.is_match(message) {
            return None;
        }
        let rejected = REJECTION.as_ref().is_none_or(|re| re.is_match(message));
        if !rejected {
            return None;
        }

        match params.get(&self.field) {
            Some(current) if *current == self.fallback => {
                params.remove(&self.field);
                Some(format!("{}: dropped", self.field))
            }
            current => {
                let before = current.map(Value::to_string).unwrap_or_else(|| "unset".into());
                params.insert(self.field.clone(), self.fallback.clone());
                Some(format!("{}: {} -> {}", self.field, before, self.fallback))
            }
        }
    }
}

/// Per-vendor repair strategies plus defaults applied to every vendor.
pub struct RepairRegistry {
    defaults: Vec<Arc<dyn RepairStrategy>>,
    by_vendor: HashMap<String, Vec<Arc<dyn RepairStrategy>>>,
}

impl RepairRegistry {
    pub fn empty() -> Self {
        Self {
            defaults: Vec::new(),
            by_vendor: HashMap::new(),
        }
    }

    /// `aspect_ratio → "16:9"`, `duration → "5"`, `resolution → "720p"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let fallbacks = [
            ("aspect_ratio", json!("16:9")),
            ("duration", json!("5")),
            ("resolution", json!("720p")),
        ];
        for (field, value) in fallbacks {
            if let Ok(strategy) = EnumFallback::new(field, value) {
                registry.defaults.push(Arc::new(strategy));
            }
        }
        registry
    }

    pub fn register(&mut self, vendor: &str, strategy: Arc<dyn RepairStrategy>) {
        self.by_vendor
            .entry(vendor.to_string())
            .or_default()
            .push(strategy);
    }

    /// Vendor-specific strategies are tried before the defaults. The first
    /// strategy that changes something wins.
    pub fn try_repair(
        &self,
        vendor: &str,
        message: &str,
        params: &mut Map<String, Value>,
    ) -> Option<String> {
        let vendor_specific = self.by_vendor.get(vendor).into_iter().flatten();
        vendor_specific
            .chain(self.defaults.iter())
            .find_map(|strategy| strategy.repair(message, params))
    }
}

impl Default for RepairRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
