//! A bridge from Rust to the Objective-C object runtime.
//!
//! Classes, protocols and methods are discovered at run time from the
//! runtime's type-encoding metadata: encodings are decoded into
//! [`TypeDescriptor`]s, method signatures are resolved through the class
//! hierarchy, and calls are marshalled and dispatched through libffi.
//!
//! ```no_run
//! use objc_bridge::{Bridge, HostValue};
//!
//! let bridge = Bridge::load()?;
//! let string = bridge
//!     .resolve_class("NSString")?
//!     .call("stringWithUTF8String:", &["hello".into()])?;
//! let length = string.as_object().unwrap().call("length", &[])?;
//! assert_eq!(length, HostValue::UInt(5));
//! # Ok::<(), objc_bridge::BridgeError>(())
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod invoke;
pub mod metrics;
pub mod proxy;
pub mod resolve;
pub mod runtime;
pub mod signature;
pub mod types;
pub mod utils;
pub mod value;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, DecodeError, Result};
pub use proxy::{Attribute, BoundMethod, ClassProxy, InstanceProxy, ProtocolProxy, ProxyHandle};
pub use signature::FallbackPolicy;
pub use types::{decode, decode_method_encoding, members::MethodSignature, TypeDescriptor};
pub use value::{HostValue, Ownership};
