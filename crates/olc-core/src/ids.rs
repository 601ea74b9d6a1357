//! Identifier newtypes.
//!
//! Sub-graph and module ids are assigned by the command source and carried
//! verbatim. Port and correlation ids are assigned by the container.

use std::fmt;

/// Client-assigned sub-graph identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubGraphId(pub u32);

/// Client-assigned module instance identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl fmt::Display for SubGraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SG 0x{:X}", self.0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Address of a module data or control port: `(module instance id, port id)`.
///
/// External ports are keyed by the internal port they attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    /// Owning module.
    pub module: ModuleId,
    /// Port id within the module.
    pub port: u32,
}

impl PortRef {
    /// Creates a port reference.
    pub const fn new(module: u32, port: u32) -> Self {
        Self {
            module: ModuleId(module),
            port,
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(0x{:X}, 0x{:X})", self.module.0, self.port)
    }
}

/// Container-assigned unique id of an external port.
///
/// Ids are handed out sequentially and never reused within an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub(crate) u32);

impl PortId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    /// Returns a sentinel value used for uninitialized port references.
    #[inline]
    pub fn sentinel() -> Self {
        Self(u32::MAX)
    }
}

/// Identifies one command in flight to the satellite.
///
/// Every dispatched command gets a fresh id; the response carries it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub(crate) u32);

impl CorrelationId {
    /// Rebuilds an id from its raw value, as a transport would after
    /// serializing it.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_ref_orders_by_module_then_port() {
        let a = PortRef::new(0x10, 2);
        let b = PortRef::new(0x10, 3);
        let c = PortRef::new(0x11, 0);
        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "(0x10, 0x2)");
    }

    #[test]
    fn sentinel_is_max() {
        assert_eq!(PortId::sentinel().index(), u32::MAX);
        assert_eq!(CorrelationId::from_raw(7).index(), 7);
    }
}
