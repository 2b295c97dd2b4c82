use serde::{Deserialize, Serialize};

/// A selector naming family and what membership implies for reference
/// counting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFamily {
    pub prefix: String,
    /// Calls return a reference the caller owns.
    #[serde(default)]
    pub returns_retained: bool,
    /// Calls take over the receiver's reference.
    #[serde(default)]
    pub consumes_receiver: bool,
}

impl MethodFamily {
    pub fn new(prefix: &str, returns_retained: bool, consumes_receiver: bool) -> Self {
        Self {
            prefix: prefix.to_string(),
            returns_retained,
            consumes_receiver,
        }
    }

    /// A selector belongs to the family when, after leading underscores, it
    /// starts with the prefix and the next character is not a lowercase
    /// letter (`copyWithZone:` is in `copy`, `copyright` is not).
    pub fn matches(&self, selector: &str) -> bool {
        selector
            .trim_start_matches('_')
            .strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_lowercase()))
    }
}

/// The naming-convention table deciding which calls hand back owned
/// references. Loaded from configuration; the default is version 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipConventions {
    pub version: u32,
    pub families: Vec<MethodFamily>,
}

impl Default for OwnershipConventions {
    fn default() -> Self {
        Self {
            version: 1,
            families: vec![
                MethodFamily::new("alloc", true, false),
                MethodFamily::new("copy", true, false),
                MethodFamily::new("mutableCopy", true, false),
                MethodFamily::new("new", true, false),
                MethodFamily::new("init", true, true),
            ],
        }
    }
}

impl OwnershipConventions {
    /// The family `selector` belongs to. The longest matching prefix wins.
    pub fn classify(&self, selector: &str) -> Option<&MethodFamily> {
        self.families
            .iter()
            .filter(|f| f.matches(selector))
            .max_by_key(|f| f.prefix.len())
    }

    pub fn returns_retained(&self, selector: &str) -> bool {
        self.classify(selector).is_some_and(|f| f.returns_retained)
    }

    pub fn consumes_receiver(&self, selector: &str) -> bool {
        self.classify(selector).is_some_and(|f| f.consumes_receiver)
    }
}
