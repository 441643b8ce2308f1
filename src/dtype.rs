// This module defines the value types a kernel graph carries. ScalarType enumerates the
// boolean, signed, unsigned and floating kinds with their byte widths. DType adds a lane count
// for vectors and a pointer flag for buffer parameters, and exposes the classification
// predicates the rewrite pass and the backends dispatch on (float, unsigned, integer,
// boolean). Display and FromStr use the short listing names (`f32`, `f32x4`, `*f32`) so
// types round-trip through the text format.

//! Value types consumed by the lowering stage.
//!
//! A [`DType`] is a scalar kind plus a lane count. Pointer types carry the
//! element type they point at, so `DType::ptr(FLOAT32)` has the byte size of
//! an `f32` and the pointer flag set; the parameter header renders them as
//! 64-bit addresses.

use std::fmt;

/// Scalar component kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
}

impl ScalarType {
    /// Size in bytes of one lane.
    pub const fn itemsize(self) -> usize {
        use ScalarType::*;
        match self {
            Bool | Int8 | UInt8 => 1,
            Int16 | UInt16 | Float16 => 2,
            Int32 | UInt32 | Float32 => 4,
            Int64 | UInt64 | Float64 => 8,
        }
    }

    /// Short name used by the text listing (`i32`, `f16`, ...).
    pub const fn short_name(self) -> &'static str {
        use ScalarType::*;
        match self {
            Bool => "bool",
            Int8 => "i8",
            Int16 => "i16",
            Int32 => "i32",
            Int64 => "i64",
            UInt8 => "u8",
            UInt16 => "u16",
            UInt32 => "u32",
            UInt64 => "u64",
            Float16 => "f16",
            Float32 => "f32",
            Float64 => "f64",
        }
    }

    pub fn from_short_name(s: &str) -> Option<Self> {
        use ScalarType::*;
        Some(match s {
            "bool" => Bool,
            "i8" => Int8,
            "i16" => Int16,
            "i32" => Int32,
            "i64" => Int64,
            "u8" => UInt8,
            "u16" => UInt16,
            "u32" => UInt32,
            "u64" => UInt64,
            "f16" => Float16,
            "f32" => Float32,
            "f64" => Float64,
            _ => return None,
        })
    }
}

/// A scalar, vector or pointer value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub scalar: ScalarType,
    pub count: usize,
    pub is_ptr: bool,
}

pub const BOOL: DType = DType::new(ScalarType::Bool);
pub const INT8: DType = DType::new(ScalarType::Int8);
pub const INT16: DType = DType::new(ScalarType::Int16);
pub const INT32: DType = DType::new(ScalarType::Int32);
pub const INT64: DType = DType::new(ScalarType::Int64);
pub const UINT8: DType = DType::new(ScalarType::UInt8);
pub const UINT16: DType = DType::new(ScalarType::UInt16);
pub const UINT32: DType = DType::new(ScalarType::UInt32);
pub const UINT64: DType = DType::new(ScalarType::UInt64);
pub const FLOAT16: DType = DType::new(ScalarType::Float16);
pub const FLOAT32: DType = DType::new(ScalarType::Float32);
pub const FLOAT64: DType = DType::new(ScalarType::Float64);

impl DType {
    pub const fn new(scalar: ScalarType) -> Self {
        Self { scalar, count: 1, is_ptr: false }
    }

    /// Vector of `count` lanes of `self`'s scalar kind.
    pub const fn vec(self, count: usize) -> Self {
        Self { scalar: self.scalar, count, is_ptr: false }
    }

    /// Pointer to elements of `elem`.
    pub const fn ptr(elem: DType) -> Self {
        Self { scalar: elem.scalar, count: elem.count, is_ptr: true }
    }

    /// Element type of a vector (or the pointee of a pointer).
    pub const fn scalar(self) -> Self {
        Self::new(self.scalar)
    }

    /// Byte size of the whole value; for pointers, of the pointee.
    pub const fn itemsize(self) -> usize {
        self.scalar.itemsize() * self.count
    }

    pub const fn is_float(self) -> bool {
        matches!(self.scalar, ScalarType::Float16 | ScalarType::Float32 | ScalarType::Float64)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(
            self.scalar,
            ScalarType::UInt8 | ScalarType::UInt16 | ScalarType::UInt32 | ScalarType::UInt64
        )
    }

    /// Signed or unsigned integer (booleans excluded).
    pub const fn is_int(self) -> bool {
        !self.is_float() && !matches!(self.scalar, ScalarType::Bool)
    }

    pub const fn is_bool(self) -> bool {
        matches!(self.scalar, ScalarType::Bool) && !self.is_ptr
    }

    pub const fn is_vector(self) -> bool {
        self.count > 1 && !self.is_ptr
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ptr {
            write!(f, "*")?;
        }
        write!(f, "{}", self.scalar.short_name())?;
        if self.count > 1 {
            write!(f, "x{}", self.count)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (is_ptr, rest) = match s.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (name, count) = match rest.split_once('x') {
            Some((name, lanes)) => {
                let count = lanes.parse::<usize>().map_err(|_| format!("bad lane count in '{s}'"))?;
                if count == 0 {
                    return Err(format!("zero lanes in '{s}'"));
                }
                (name, count)
            }
            None => (rest, 1),
        };
        let scalar = ScalarType::from_short_name(name).ok_or_else(|| format!("unknown dtype '{s}'"))?;
        let dtype = DType::new(scalar).vec(count);
        Ok(if is_ptr { DType::ptr(dtype) } else { dtype })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_itemsize_and_predicates() {
        assert_eq!(FLOAT32.vec(4).itemsize(), 16);
        assert_eq!(BOOL.itemsize(), 1);
        assert!(FLOAT16.is_float());
        assert!(UINT8.is_unsigned() && UINT8.is_int());
        assert!(!BOOL.is_int());
        assert!(!INT32.is_unsigned());
        assert_eq!(FLOAT32.vec(4).scalar(), FLOAT32);
    }

    #[test]
    fn test_pointer_keeps_element_size() {
        let p = DType::ptr(FLOAT64);
        assert!(p.is_ptr);
        assert_eq!(p.itemsize(), 8);
        assert!(!p.is_bool());
        assert!(!DType::ptr(BOOL).is_bool());
    }

    #[test]
    fn test_parse_display() {
        for s in ["bool", "f32x4", "*f16", "u8", "*i32"] {
            let dt: DType = s.parse().unwrap();
            assert_eq!(dt.to_string(), s);
        }
        assert!("q32".parse::<DType>().is_err());
        assert!("f32x0".parse::<DType>().is_err());
    }
}
