//! Type declarations produced by the metadata parser
//!
//! A declaration describes the layout of a value in the trace byte stream.
//! Declarations live in a [`DeclArena`] and refer to each other through
//! [`DeclId`] indices, so compound types (structs, variants, arrays,
//! sequences) never hold back-pointers.

use std::fmt;

/// Byte order of multi-byte fields in the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the host running the reader
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn swapped(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "le"),
            ByteOrder::Big => write!(f, "be"),
        }
    }
}

/// The eight CTF type classes, used as the decode dispatch key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Integer,
    Float,
    Enum,
    String,
    Struct,
    Variant,
    Array,
    Sequence,
}

/// Index of a declaration inside its [`DeclArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeclId(usize);

#[derive(Debug, Clone)]
pub struct IntegerDecl {
    /// Field length in bits, 1..=64
    pub len: u32,
    pub signed: bool,
    pub byte_order: ByteOrder,
    /// Display base (10, 16, 8 or 2)
    pub base: u32,
    /// Alignment in bits
    pub align: u64,
}

impl IntegerDecl {
    /// Default alignment rule: byte-aligned when the length is a whole
    /// number of bytes, bit-packed otherwise.
    pub fn default_align(len: u32) -> u64 {
        if len % 8 == 0 {
            8
        } else {
            1
        }
    }
}

#[derive(Debug, Clone)]
pub struct FloatDecl {
    /// Exponent length in bits, including none of the sign
    pub exp_dig: u32,
    /// Mantissa length in bits, including the implicit leading bit
    pub mant_dig: u32,
    pub byte_order: ByteOrder,
    pub align: u64,
}

impl FloatDecl {
    pub fn total_len(&self) -> u32 {
        // sign bit + exponent + explicit mantissa bits
        1 + self.exp_dig + (self.mant_dig - 1)
    }
}

#[derive(Debug, Clone)]
pub struct EnumMapping {
    pub label: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone)]
pub struct EnumDecl {
    /// Container integer carrying the raw value
    pub container: IntegerDecl,
    pub mappings: Vec<EnumMapping>,
}

impl EnumDecl {
    /// Label for a raw container value, if any mapping covers it
    pub fn label_for(&self, value: i64) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.start <= value && value <= m.end)
            .map(|m| m.label.as_str())
    }
}

/// NUL-terminated byte string, 8-bit aligned
#[derive(Debug, Clone)]
pub struct StringDecl;

#[derive(Debug, Clone)]
pub struct StructFieldDecl {
    pub name: String,
    pub decl: DeclId,
}

#[derive(Debug, Clone)]
pub struct StructDecl {
    pub fields: Vec<StructFieldDecl>,
    /// Alignment in bits: the declared minimum combined with the largest
    /// field alignment, computed when the declaration is built.
    pub align: u64,
}

impl StructDecl {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct VariantDecl {
    /// Name of the tag definition, resolved by scope lookup at decode time
    pub tag: String,
    /// One arm per tag label; the arm whose name matches the tag's current
    /// label is decoded.
    pub arms: Vec<StructFieldDecl>,
}

impl VariantDecl {
    pub fn arm(&self, name: &str) -> Option<&StructFieldDecl> {
        self.arms.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ArrayDecl {
    pub len: u64,
    pub elem: DeclId,
}

#[derive(Debug, Clone)]
pub struct SequenceDecl {
    /// Name of the length definition, resolved by scope lookup at decode time
    pub length_field: String,
    pub elem: DeclId,
}

#[derive(Debug, Clone)]
pub enum Declaration {
    Integer(IntegerDecl),
    Float(FloatDecl),
    Enum(EnumDecl),
    String(StringDecl),
    Struct(StructDecl),
    Variant(VariantDecl),
    Array(ArrayDecl),
    Sequence(SequenceDecl),
}

impl Declaration {
    pub fn type_class(&self) -> TypeClass {
        match self {
            Declaration::Integer(_) => TypeClass::Integer,
            Declaration::Float(_) => TypeClass::Float,
            Declaration::Enum(_) => TypeClass::Enum,
            Declaration::String(_) => TypeClass::String,
            Declaration::Struct(_) => TypeClass::Struct,
            Declaration::Variant(_) => TypeClass::Variant,
            Declaration::Array(_) => TypeClass::Array,
            Declaration::Sequence(_) => TypeClass::Sequence,
        }
    }
}

/// Arena owning every declaration of one trace
#[derive(Debug, Default)]
pub struct DeclArena {
    decls: Vec<Declaration>,
}

impl DeclArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, decl: Declaration) -> DeclId {
        let id = DeclId(self.decls.len());
        self.decls.push(decl);
        id
    }

    pub fn get(&self, id: DeclId) -> &Declaration {
        &self.decls[id.0]
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Alignment of a declaration in bits
    pub fn alignment(&self, id: DeclId) -> u64 {
        match self.get(id) {
            Declaration::Integer(i) => i.align,
            Declaration::Float(f) => f.align,
            Declaration::Enum(e) => e.container.align,
            Declaration::String(_) => 8,
            Declaration::Struct(s) => s.align,
            // The selected arm aligns itself once the tag is known
            Declaration::Variant(_) => 1,
            Declaration::Array(a) => self.alignment(a.elem),
            Declaration::Sequence(s) => self.alignment(s.elem),
        }
    }

    /// Combined alignment for a struct declaration: the declared minimum
    /// raised to the largest member alignment.
    pub fn struct_align(&self, fields: &[StructFieldDecl], min_align: u64) -> u64 {
        fields
            .iter()
            .map(|f| self.alignment(f.decl))
            .fold(min_align.max(1), u64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_decl() -> IntegerDecl {
        IntegerDecl {
            len: 32,
            signed: false,
            byte_order: ByteOrder::Little,
            base: 10,
            align: 8,
        }
    }

    #[test]
    fn test_byte_order__swapped__then_opposite() {
        assert_eq!(ByteOrder::Little.swapped(), ByteOrder::Big);
        assert_eq!(ByteOrder::Big.swapped(), ByteOrder::Little);
    }

    #[test]
    fn test_integer_decl__default_align__then_byte_or_bit() {
        assert_eq!(IntegerDecl::default_align(32), 8);
        assert_eq!(IntegerDecl::default_align(5), 1);
        assert_eq!(IntegerDecl::default_align(64), 8);
    }

    #[test]
    fn test_enum_decl__label_for__then_range_match() {
        let decl = EnumDecl {
            container: u32_decl(),
            mappings: vec![
                EnumMapping {
                    label: "compact".into(),
                    start: 0,
                    end: 30,
                },
                EnumMapping {
                    label: "extended".into(),
                    start: 31,
                    end: 31,
                },
            ],
        };
        assert_eq!(decl.label_for(0), Some("compact"));
        assert_eq!(decl.label_for(30), Some("compact"));
        assert_eq!(decl.label_for(31), Some("extended"));
        assert_eq!(decl.label_for(32), None);
    }

    #[test]
    fn test_arena__struct_align__then_max_of_members() {
        let mut arena = DeclArena::new();
        let narrow = arena.alloc(Declaration::Integer(IntegerDecl {
            len: 5,
            signed: false,
            byte_order: ByteOrder::Little,
            base: 10,
            align: 1,
        }));
        let wide = arena.alloc(Declaration::Integer(IntegerDecl {
            len: 64,
            signed: false,
            byte_order: ByteOrder::Little,
            base: 10,
            align: 64,
        }));
        let fields = vec![
            StructFieldDecl {
                name: "a".into(),
                decl: narrow,
            },
            StructFieldDecl {
                name: "b".into(),
                decl: wide,
            },
        ];
        assert_eq!(arena.struct_align(&fields, 1), 64);
        assert_eq!(arena.struct_align(&[], 8), 8);
    }

    #[test]
    fn test_float_decl__total_len__then_ieee_widths() {
        let single = FloatDecl {
            exp_dig: 8,
            mant_dig: 24,
            byte_order: ByteOrder::Little,
            align: 8,
        };
        let double = FloatDecl {
            exp_dig: 11,
            mant_dig: 53,
            byte_order: ByteOrder::Little,
            align: 8,
        };
        assert_eq!(single.total_len(), 32);
        assert_eq!(double.total_len(), 64);
    }
}
