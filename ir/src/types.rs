// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! IR types and their in-memory layout (sizes, alignment, struct offsets).

use std::fmt;

/// An IR type. Pointers are opaque; memory-touching instructions carry the
/// pointee type explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    /// The empty type (function returns only).
    Void,
    /// An integer of the given bit width.
    Int(u32),
    /// Single-precision float.
    Float,
    /// Double-precision float.
    Double,
    /// 80-bit extended float.
    Fp80,
    /// An untyped virtual address.
    Ptr,
    /// A fixed-length array.
    Array(u64, Box<Ty>),
    /// A struct with the given field types, laid out with natural alignment.
    Struct(Vec<Ty>),
}

fn round_up(n: u64, align: u64) -> u64 {
    (n + align - 1) / align * align
}

impl Ty {
    /// Shorthand for the 32-bit integer type.
    pub fn i32() -> Ty {
        Ty::Int(32)
    }

    /// The number of bytes a value of this type occupies when stored.
    pub fn store_size(&self) -> u64 {
        match self {
            Ty::Void => 0,
            Ty::Int(w) => (*w as u64 + 7) / 8,
            Ty::Float => 4,
            Ty::Double => 8,
            Ty::Fp80 => 10,
            Ty::Ptr => 8,
            Ty::Array(n, elem) => n * elem.alloc_size(),
            Ty::Struct(_) => self.alloc_size(),
        }
    }

    /// The alignment of this type.
    pub fn align(&self) -> u64 {
        match self {
            Ty::Void => 1,
            Ty::Int(w) => ((*w as u64 + 7) / 8).next_power_of_two().min(8),
            Ty::Float => 4,
            Ty::Double => 8,
            Ty::Fp80 => 16,
            Ty::Ptr => 8,
            Ty::Array(_, elem) => elem.align(),
            Ty::Struct(fields) => fields.iter().map(Ty::align).max().unwrap_or(1),
        }
    }

    /// The number of bytes an allocation of this type occupies, including
    /// padding up to the alignment.
    pub fn alloc_size(&self) -> u64 {
        match self {
            Ty::Struct(fields) => {
                let mut offset = 0;
                for f in fields {
                    offset = round_up(offset, f.align());
                    offset += f.alloc_size();
                }
                round_up(offset.max(1), self.align())
            }
            Ty::Fp80 => 16,
            _ => round_up(self.store_size().max(1), self.align()),
        }
    }

    /// The byte offset and type of struct field `idx`.
    pub fn field(&self, idx: u64) -> Option<(u64, &Ty)> {
        let Ty::Struct(fields) = self else {
            return None;
        };
        let mut offset = 0;
        for (i, f) in fields.iter().enumerate() {
            offset = round_up(offset, f.align());
            if i as u64 == idx {
                return Some((offset, f));
            }
            offset += f.alloc_size();
        }
        None
    }

    /// Whether this is an integer type.
    pub fn is_int(&self) -> bool {
        matches!(self, Ty::Int(_))
    }

    /// Whether this is the pointer type.
    pub fn is_ptr(&self) -> bool {
        matches!(self, Ty::Ptr)
    }

    /// Whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, Ty::Float | Ty::Double | Ty::Fp80)
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int(w) => write!(f, "i{w}"),
            Ty::Float => write!(f, "float"),
            Ty::Double => write!(f, "double"),
            Ty::Fp80 => write!(f, "x86_fp80"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::Array(n, elem) => write!(f, "[{n} x {elem}]"),
            Ty::Struct(fields) => {
                write!(f, "{{")?;
                for (i, t) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(Ty::Int(1).store_size(), 1);
        assert_eq!(Ty::Int(32).store_size(), 4);
        assert_eq!(Ty::Int(64).alloc_size(), 8);
        assert_eq!(Ty::Ptr.store_size(), 8);
        assert_eq!(Ty::Fp80.store_size(), 10);
        assert_eq!(Ty::Fp80.alloc_size(), 16);
    }

    #[test]
    fn test_array_layout() {
        let a = Ty::Array(4, Box::new(Ty::Int(32)));
        assert_eq!(a.alloc_size(), 16);
        assert_eq!(a.align(), 4);
    }

    #[test]
    fn test_struct_layout() {
        // {i8, i32, i8} lays out as 0, 4, 8 with total size 12
        let s = Ty::Struct(vec![Ty::Int(8), Ty::Int(32), Ty::Int(8)]);
        assert_eq!(s.field(0).unwrap().0, 0);
        assert_eq!(s.field(1).unwrap().0, 4);
        assert_eq!(s.field(2).unwrap().0, 8);
        assert_eq!(s.alloc_size(), 12);
        assert!(s.field(3).is_none());
    }
}
