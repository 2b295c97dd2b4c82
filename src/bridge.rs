use crate::{
    config::BridgeConfig,
    error::{BridgeError, EntityKind, Result},
    invoke::{CallFrame, InvocationEngine},
    metrics::CacheStats,
    proxy::{ClassProxy, ProtocolProxy, ProxyHandle},
    resolve::MetadataCache,
    runtime::{libobjc::LibObjc, ClassPtr, ForeignRuntime, ProtocolPtr},
    signature::SignatureResolver,
    types::{members::MethodSignature, TypeDescriptor},
    value::{marshal::infer_variadic, HostValue, Marshaller, Ownership},
};
use std::sync::Arc;
use tracing::{debug, trace};

struct BridgeState {
    runtime: Arc<dyn ForeignRuntime>,
    cache: Arc<MetadataCache>,
    resolver: SignatureResolver,
    marshaller: Marshaller,
    engine: InvocationEngine,
    config: BridgeConfig,
}

/// Entry point for host code: name lookup of classes and protocols, and the
/// message send path every proxy call goes through.
///
/// Cloning is cheap; clones share one metadata cache.
#[derive(Clone)]
pub struct Bridge(Arc<BridgeState>);

impl Bridge {
    pub fn new(runtime: Arc<dyn ForeignRuntime>) -> Self {
        Self::with_config(runtime, BridgeConfig::default())
    }

    pub fn with_config(runtime: Arc<dyn ForeignRuntime>, config: BridgeConfig) -> Self {
        let cache = Arc::new(MetadataCache::new(runtime.clone()));
        debug!(
            runtime = runtime.name(),
            fallback = ?config.fallback,
            conventions = config.conventions.version,
            "creating bridge"
        );
        Self(Arc::new(BridgeState {
            resolver: SignatureResolver::new(cache.clone(), config.fallback),
            marshaller: Marshaller::new(config.autobox),
            engine: InvocationEngine::new(),
            runtime,
            cache,
            config,
        }))
    }

    /// Bridge to the platform Objective-C runtime, configured from
    /// `OBJC_BRIDGE_CONFIG` when set.
    pub fn load() -> Result<Self> {
        let config = BridgeConfig::from_env()?;
        Ok(Self::with_config(Arc::new(LibObjc::load()?), config))
    }

    pub fn runtime(&self) -> &Arc<dyn ForeignRuntime> {
        &self.0.runtime
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.0.cache
    }

    pub fn resolver(&self) -> &SignatureResolver {
        &self.0.resolver
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.0.marshaller
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.0.config
    }

    pub fn resolve_class(&self, name: &str) -> Result<ClassProxy> {
        let meta = self.0.cache.resolve_class(name)?;
        Ok(ClassProxy::new(self.clone(), meta.class, meta.name.clone()))
    }

    pub fn resolve_protocol(&self, name: &str) -> Result<ProtocolProxy> {
        let meta = self.0.cache.resolve_protocol(name)?;
        Ok(ProtocolProxy::new(self.clone(), meta.protocol, meta.name.clone()))
    }

    pub fn class_proxy(&self, class: ClassPtr) -> Result<ClassProxy> {
        Ok(ClassProxy::new(self.clone(), class, self.0.runtime.class_name(class)?))
    }

    pub fn protocol_proxy(&self, protocol: ProtocolPtr) -> Result<ProtocolProxy> {
        Ok(ProtocolProxy::new(
            self.clone(),
            protocol,
            self.0.runtime.protocol_name(protocol)?,
        ))
    }

    /// Whether objects whose class (or metaclass) is `class` respond to
    /// `selector`.
    pub fn responds_to(&self, class: ClassPtr, selector: &str) -> bool {
        self.0
            .marshaller
            .selector(self, selector)
            .is_ok_and(|sel| self.0.runtime.responds_to(class, sel))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            class: self.0.cache.class_stats(),
            protocol: self.0.cache.protocol_stats(),
            selector: self.0.marshaller.selector_stats(),
        }
    }

    /// Send `selector` to `receiver`.
    ///
    /// Every host-side check and all argument marshalling happen before the
    /// foreign call, so a rejected argument never reaches the runtime. The
    /// return value is owned by the host when the selector's naming family
    /// returns retained references, borrowed otherwise.
    pub fn send(
        &self,
        receiver: &ProxyHandle,
        selector: &str,
        args: &[HostValue],
        signature: Option<MethodSignature>,
    ) -> Result<HostValue> {
        let state = &*self.0;
        let runtime = &*state.runtime;

        let (class, is_class_method) = match receiver {
            ProxyHandle::Class(c) => (c.class_ptr(), true),
            ProxyHandle::Instance(i) => {
                let class = runtime.object_class(i.handle().ptr()).ok_or_else(|| {
                    BridgeError::Unsupported(format!("{receiver:?} has no class"))
                })?;
                (class, false)
            }
            ProxyHandle::Protocol(p) => {
                return Err(BridgeError::Unsupported(format!(
                    "protocol {} cannot receive messages",
                    p.name()
                )))
            }
        };
        let class_name = runtime.class_name(class)?;

        let signature = match signature {
            Some(s) => s,
            None => state.resolver.resolve(&class_name, selector, is_class_method)?,
        };
        let fixed = signature.arity();
        if args.len() < fixed || (!signature.variadic && args.len() != fixed) {
            return Err(BridgeError::ArgumentCount {
                selector: selector.to_string(),
                expected: fixed,
                found: args.len(),
            });
        }

        let sel = state.marshaller.selector(self, selector)?;
        if state.config.check_responds {
            let dispatch_class = if is_class_method {
                runtime.metaclass(class).ok_or_else(|| {
                    BridgeError::not_found(EntityKind::Class, format!("metaclass of {class_name}"))
                })?
            } else {
                class
            };
            if !runtime.responds_to(dispatch_class, sel) {
                return Err(BridgeError::DoesNotRespond {
                    target: class_name,
                    selector: selector.to_string(),
                });
            }
        }

        let mut arg_types: Vec<TypeDescriptor> = signature.arguments.clone();
        arg_types.extend(args[fixed..].iter().map(infer_variadic));
        let mut slots = args
            .iter()
            .zip(&arg_types)
            .map(|(value, ty)| state.marshaller.to_foreign(self, value, ty))
            .collect::<Result<Vec<_>>>()?;

        let frame = CallFrame {
            receiver: receiver.object_ptr(),
            class,
            selector: sel,
            selector_name: selector,
            arguments: &arg_types,
            fixed_arguments: fixed,
            return_type: &signature.return_type,
        };
        let prepared = state.engine.prepare(runtime, &frame)?;

        // The receiver is handed over only once nothing can fail before the call.
        let conventions = &state.config.conventions;
        if conventions.consumes_receiver(selector) {
            if let ProxyHandle::Instance(i) = receiver {
                i.handle().consume();
            }
        }
        let ret = state.engine.call(runtime, &frame, &prepared, &mut slots)?;
        drop(slots);

        let ownership = if conventions.returns_retained(selector) {
            Ownership::Owned
        } else {
            Ownership::Borrowed
        };
        if signature.return_type.is_object_like() {
            debug!(class = %class_name, selector, ?ownership, "adopting returned object");
        }
        let value = state
            .marshaller
            .to_host(self, &ret, &signature.return_type, ownership)?;
        trace!(class = %class_name, selector, ?value, "send complete");
        Ok(value)
    }
}
