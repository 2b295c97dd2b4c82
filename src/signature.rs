use crate::{
    error::{BridgeError, Result},
    resolve::MetadataCache,
    types::members::MethodSignature,
    utils::selector_arity,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, trace};

/// What to do when no declaration of a selector exists anywhere a class can
/// see.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Type every argument and the return value as an object reference.
    #[default]
    Generic,
    /// Fail with [`BridgeError::NoSignature`].
    Strict,
}

pub struct SignatureResolver {
    cache: Arc<MetadataCache>,
    policy: FallbackPolicy,
}

impl SignatureResolver {
    pub fn new(cache: Arc<MetadataCache>, policy: FallbackPolicy) -> Self {
        Self { cache, policy }
    }

    /// Signature of `selector` as seen from `class`.
    ///
    /// Lookup order: the class and its superclasses; for class methods, the
    /// root class's instance methods; protocols adopted anywhere in the
    /// chain, including inherited protocols. If nothing declares the
    /// selector, the fallback policy decides.
    pub fn resolve(&self, class: &str, selector: &str, is_class_method: bool) -> Result<MethodSignature> {
        if let Some(sig) = self.find_declared(class, selector, is_class_method)? {
            return Ok(sig);
        }
        match self.policy {
            FallbackPolicy::Generic => {
                debug!(class, selector, is_class_method, "no declared signature, using generic fallback");
                Ok(MethodSignature::generic(selector_arity(selector)))
            }
            FallbackPolicy::Strict => Err(BridgeError::NoSignature {
                class: class.to_string(),
                selector: selector.to_string(),
            }),
        }
    }

    /// The declared signature, if any. A declaration that failed to decode is
    /// an error rather than a miss.
    pub fn find_declared(
        &self,
        class: &str,
        selector: &str,
        is_class_method: bool,
    ) -> Result<Option<MethodSignature>> {
        let chain = self.cache.ancestors(class)?;

        for meta in &chain {
            if let Some(sig) = meta.method(selector, is_class_method)? {
                trace!(class, owner = %meta.name, selector, "resolved declared signature");
                return Ok(Some(sig.clone()));
            }
        }

        // The root metaclass inherits from the root class.
        if is_class_method {
            if let Some(root) = chain.last() {
                if let Some(sig) = root.method(selector, false)? {
                    trace!(class, root = %root.name, selector, "resolved via root instance method");
                    return Ok(Some(sig.clone()));
                }
            }
        }

        let mut seen = HashSet::new();
        for meta in &chain {
            for protocol in &meta.protocols {
                if let Some(sig) = self.protocol_signature(protocol, selector, is_class_method, &mut seen)? {
                    trace!(class, protocol = %protocol, selector, "resolved signature from protocol");
                    return Ok(Some(sig));
                }
            }
        }
        Ok(None)
    }

    fn protocol_signature(
        &self,
        protocol: &str,
        selector: &str,
        is_class_method: bool,
        seen: &mut HashSet<String>,
    ) -> Result<Option<MethodSignature>> {
        if !seen.insert(protocol.to_string()) {
            return Ok(None);
        }
        let meta = self.cache.resolve_protocol(protocol)?;
        if let Some(m) = meta.method(selector, is_class_method)? {
            return Ok(Some(m.signature.clone()));
        }
        for parent in &meta.protocols {
            if let Some(sig) = self.protocol_signature(parent, selector, is_class_method, seen)? {
                return Ok(Some(sig));
            }
        }
        Ok(None)
    }
}
