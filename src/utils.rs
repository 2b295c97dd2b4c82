use std::mem::size_of;

/// Zero-padded hex address, as wide as a pointer on this platform.
pub fn format_address(address: usize) -> String {
    format!("0x{:0width$x}", address, width = size_of::<usize>() * 2)
}

/// Number of arguments a selector takes: one per `:`.
pub fn selector_arity(selector: &str) -> usize {
    selector.bytes().filter(|&b| b == b':').count()
}

/// Attribute-style member name to selector (`setValue_forKey_` becomes
/// `setValue:forKey:`).
pub fn attribute_to_selector(name: &str) -> String {
    name.replace('_', ":")
}
