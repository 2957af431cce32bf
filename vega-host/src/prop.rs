//! Typed properties and their dirty-tracking state.
//!
//! A property is a named, typed state variable attached to a node. Properties
//! participate in graph-wide propagation: writing one marks it dirty, and the
//! graph runs resolvers until everything is clean and consistent again. The
//! value is a closed tagged variant rather than an open type-erased box, so
//! type mismatches are ordinary errors instead of downcast surprises.

use crate::args::DeviceAddr;
use crate::error::{Error, Result};
use bytes::Bytes;
use num_complex::Complex64;

/// Value of a property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number (rates, frequencies, gains).
    Float(f64),
    /// String (format names, antenna names).
    Str(String),
    /// Complex number (DC offset, IQ balance corrections).
    Complex(Complex64),
    /// Vector of floats (filter taps, coefficient sets).
    FloatVec(Vec<f64>),
    /// Key/value argument bag.
    DeviceAddr(DeviceAddr),
    /// Serialized blob for anything wider; accessors live with the producer.
    Blob(Bytes),
}

impl PropValue {
    /// Returns the type tag of this value.
    pub fn prop_type(&self) -> PropType {
        match self {
            PropValue::Bool(_) => PropType::Bool,
            PropValue::Int(_) => PropType::Int,
            PropValue::Float(_) => PropType::Float,
            PropValue::Str(_) => PropType::Str,
            PropValue::Complex(_) => PropType::Complex,
            PropValue::FloatVec(_) => PropType::FloatVec,
            PropValue::DeviceAddr(_) => PropType::DeviceAddr,
            PropValue::Blob(_) => PropType::Blob,
        }
    }

    /// Returns the boolean value, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float value, if this is a `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the string value, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> PropValue {
        PropValue::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> PropValue {
        PropValue::Int(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> PropValue {
        PropValue::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> PropValue {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> PropValue {
        PropValue::Str(v)
    }
}

impl From<Complex64> for PropValue {
    fn from(v: Complex64) -> PropValue {
        PropValue::Complex(v)
    }
}

impl From<Vec<f64>> for PropValue {
    fn from(v: Vec<f64>) -> PropValue {
        PropValue::FloatVec(v)
    }
}

impl From<DeviceAddr> for PropValue {
    fn from(v: DeviceAddr) -> PropValue {
        PropValue::DeviceAddr(v)
    }
}

impl From<Bytes> for PropValue {
    fn from(v: Bytes) -> PropValue {
        PropValue::Blob(v)
    }
}

/// Type tag of a [`PropValue`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PropType {
    Bool,
    Int,
    Float,
    Str,
    Complex,
    FloatVec,
    DeviceAddr,
    Blob,
}

/// Where a property lives on its node.
///
/// Edge-scoped properties take part in propagation across graph edges; user
/// properties are the API surface of a block; framework properties exist for
/// the runtime's own bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PropSource {
    /// User-facing property; the index is the channel instance.
    User(usize),
    /// Property on an input port.
    InputEdge(usize),
    /// Property on an output port.
    OutputEdge(usize),
    /// Runtime-internal property.
    Framework,
}

impl PropSource {
    /// Returns the port or instance number.
    pub fn instance(&self) -> usize {
        match self {
            PropSource::User(i) | PropSource::InputEdge(i) | PropSource::OutputEdge(i) => *i,
            PropSource::Framework => 0,
        }
    }

    /// Returns whether this is an edge-scoped source.
    pub fn is_edge(&self) -> bool {
        matches!(self, PropSource::InputEdge(_) | PropSource::OutputEdge(_))
    }

    /// Flips an input edge into the output edge of the same port and vice
    /// versa. Non-edge sources have no inverse.
    pub fn invert(&self) -> Option<PropSource> {
        match self {
            PropSource::InputEdge(p) => Some(PropSource::OutputEdge(*p)),
            PropSource::OutputEdge(p) => Some(PropSource::InputEdge(*p)),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropSource::User(i) => write!(f, "USER:{i}"),
            PropSource::InputEdge(p) => write!(f, "INPUT_EDGE:{p}"),
            PropSource::OutputEdge(p) => write!(f, "OUTPUT_EDGE:{p}"),
            PropSource::Framework => write!(f, "FRAMEWORK"),
        }
    }
}

/// Access mode of a property at a given moment of resolution.
///
/// Outside of resolution every property is read-only; the runtime grants
/// write access to the outputs of the currently running resolver, downgraded
/// to locked when a previous resolver in the same pass already wrote them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessMode {
    /// Reads only; writes are an access error.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
    /// Writes allowed only if they do not change the value.
    ReadWriteLocked,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PropKind {
    Normal,
    /// Reports dirty forever, compares equal to nothing, holds no value.
    /// Resolvers that list it as an input run on every resolution.
    AlwaysDirty,
}

/// A property slot on a node.
#[derive(Debug)]
pub struct Property {
    id: String,
    source: PropSource,
    ty: PropType,
    value: Option<PropValue>,
    dirty: bool,
    access: AccessMode,
    kind: PropKind,
}

impl Property {
    /// Creates a property without an initial value. It is invalid until the
    /// first write and starts out dirty so that initial resolution visits it.
    pub fn new(id: impl Into<String>, source: PropSource, ty: PropType) -> Property {
        Property {
            id: id.into(),
            source,
            ty,
            value: None,
            dirty: true,
            access: AccessMode::ReadOnly,
            kind: PropKind::Normal,
        }
    }

    /// Creates a property with an initial value. It starts out dirty.
    pub fn with_value(
        id: impl Into<String>,
        source: PropSource,
        value: impl Into<PropValue>,
    ) -> Property {
        let value = value.into();
        Property {
            id: id.into(),
            source,
            ty: value.prop_type(),
            value: Some(value),
            dirty: true,
            access: AccessMode::ReadOnly,
            kind: PropKind::Normal,
        }
    }

    /// Creates the framework dirtifier used to force resolver invocations.
    pub(crate) fn dirtifier() -> Property {
        Property {
            id: "__dirtifier".to_string(),
            source: PropSource::Framework,
            ty: PropType::Bool,
            value: None,
            dirty: true,
            access: AccessMode::ReadOnly,
            kind: PropKind::AlwaysDirty,
        }
    }

    /// Returns the property id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the property source.
    pub fn source(&self) -> PropSource {
        self.source
    }

    /// Returns the type tag.
    pub fn prop_type(&self) -> PropType {
        self.ty
    }

    /// Returns the value, or `None` while the property is invalid.
    pub fn value(&self) -> Option<&PropValue> {
        self.value.as_ref()
    }

    /// Returns whether the property holds a value.
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    /// Returns whether the property is dirty.
    pub fn is_dirty(&self) -> bool {
        match self.kind {
            PropKind::Normal => self.dirty,
            PropKind::AlwaysDirty => true,
        }
    }

    /// Returns whether this is the framework dirtifier.
    pub(crate) fn is_dirtifier(&self) -> bool {
        self.kind == PropKind::AlwaysDirty
    }

    pub(crate) fn access(&self) -> AccessMode {
        self.access
    }

    pub(crate) fn set_access(&mut self, access: AccessMode) {
        self.access = access;
    }

    /// Writes the value, honoring the current access mode.
    ///
    /// The property becomes dirty only if the value actually changed (or was
    /// invalid before).
    pub(crate) fn set(&mut self, value: PropValue) -> Result<()> {
        if self.kind == PropKind::AlwaysDirty {
            return Err(Error::Access(format!(
                "property {} cannot take a value",
                self.id
            )));
        }
        if value.prop_type() != self.ty {
            return Err(Error::Type(format!(
                "property {}@{} is {:?}, written with {:?}",
                self.id,
                self.source,
                self.ty,
                value.prop_type()
            )));
        }
        let changed = self.value.as_ref() != Some(&value);
        match self.access {
            AccessMode::ReadWrite => {
                self.value = Some(value);
                if changed {
                    self.dirty = true;
                }
                Ok(())
            }
            AccessMode::ReadWriteLocked => {
                if changed {
                    Err(Error::Resolve(format!(
                        "conflicting write to property {}@{} held by another resolver",
                        self.id, self.source
                    )))
                } else {
                    Ok(())
                }
            }
            AccessMode::ReadOnly => Err(Error::Access(format!(
                "write to read-only property {}@{}",
                self.id, self.source
            ))),
        }
    }

    /// Marks the property clean; returns whether a dirty-to-clean transition
    /// happened. The dirtifier never becomes clean.
    pub(crate) fn mark_clean(&mut self) -> bool {
        if self.kind == PropKind::AlwaysDirty || !self.dirty {
            return false;
        }
        self.dirty = false;
        true
    }

    /// Value equality between two properties.
    ///
    /// Invalid properties and the dirtifier are never equal to anything.
    pub fn equal(&self, other: &Property) -> bool {
        if self.kind == PropKind::AlwaysDirty || other.kind == PropKind::AlwaysDirty {
            return false;
        }
        match (&self.value, &other.value) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn writable(mut prop: Property) -> Property {
        prop.set_access(AccessMode::ReadWrite);
        prop
    }

    #[test]
    fn set_marks_dirty_only_on_change() {
        let mut prop = writable(Property::with_value("samp_rate", PropSource::User(0), 1e6));
        prop.mark_clean();
        prop.set(PropValue::Float(1e6)).unwrap();
        assert!(!prop.is_dirty());
        prop.set(PropValue::Float(2e6)).unwrap();
        assert!(prop.is_dirty());
    }

    #[test]
    fn type_mismatch_rejected() {
        let mut prop = writable(Property::with_value("decim", PropSource::User(0), 4i64));
        assert!(matches!(
            prop.set(PropValue::Float(4.0)),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn read_only_write_is_access_error() {
        let mut prop = Property::with_value("gain", PropSource::User(0), 10.0);
        assert!(matches!(
            prop.set(PropValue::Float(20.0)),
            Err(Error::Access(_))
        ));
    }

    #[test]
    fn locked_write_must_not_change_value() {
        let mut prop = Property::with_value("rate", PropSource::User(0), 1e6);
        prop.set_access(AccessMode::ReadWriteLocked);
        prop.set(PropValue::Float(1e6)).unwrap();
        assert!(matches!(
            prop.set(PropValue::Float(2e6)),
            Err(Error::Resolve(_))
        ));
    }

    #[test]
    fn dirtifier_is_always_dirty_and_never_equal() {
        let mut d = Property::dirtifier();
        assert!(d.is_dirty());
        assert!(!d.mark_clean());
        assert!(d.is_dirty());
        assert!(!d.equal(&Property::dirtifier()));
        d.set_access(AccessMode::ReadWrite);
        assert!(matches!(d.set(PropValue::Bool(true)), Err(Error::Access(_))));
    }

    #[test]
    fn invalid_property_becomes_valid_and_dirty_on_first_write() {
        let mut prop = Property::new("freq", PropSource::InputEdge(0), PropType::Float);
        assert!(!prop.is_valid());
        prop.mark_clean();
        prop.set_access(AccessMode::ReadWrite);
        prop.set(PropValue::Float(100e6)).unwrap();
        assert!(prop.is_valid());
        assert!(prop.is_dirty());
    }
}
