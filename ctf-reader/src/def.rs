//! Decoded value definitions and scoped name lookup
//!
//! A definition is the materialized instance of a declaration after a read:
//! the value tree for one packet header, packet context, event header or
//! event payload. Scopes chain struct frames from the outermost
//! (trace packet header) to the innermost (the struct currently being
//! decoded) so that variants and sequences can resolve their tag and
//! length fields by name.

use std::fmt;

/// Raw integer value keeping the declared signedness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntValue {
    Unsigned(u64),
    Signed(i64),
}

impl IntValue {
    /// Value reinterpreted as unsigned, the way packet-context and
    /// header fields are consumed.
    pub fn as_unsigned(self) -> u64 {
        match self {
            IntValue::Unsigned(v) => v,
            IntValue::Signed(v) => v as u64,
        }
    }

    pub fn as_signed(self) -> i64 {
        match self {
            IntValue::Unsigned(v) => v as i64,
            IntValue::Signed(v) => v,
        }
    }
}

impl fmt::Display for IntValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntValue::Unsigned(v) => write!(f, "{v}"),
            IntValue::Signed(v) => write!(f, "{v}"),
        }
    }
}

/// Decoded integer with enough of its declaration to be re-interpreted
#[derive(Debug, Clone, PartialEq)]
pub struct IntDef {
    pub value: IntValue,
    /// Declared length in bits; drives timestamp wrap reconstruction
    pub len: u32,
    /// Declared display base
    pub base: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub value: IntValue,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub value: Definition,
}

/// Decoded struct: named fields in declaration order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructDef {
    pub fields: Vec<FieldDef>,
}

impl StructDef {
    pub fn field(&self, name: &str) -> Option<&Definition> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    pub fn field_at(&self, index: usize) -> Option<&FieldDef> {
        self.fields.get(index)
    }

    /// Unsigned integer (or enum container) field by name
    pub fn unsigned_field(&self, name: &str) -> Option<u64> {
        self.field(name).and_then(Definition::as_unsigned)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantDef {
    /// Label of the tag value that selected the arm
    pub tag_label: String,
    /// Name of the selected arm
    pub arm: String,
    pub value: Definition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    Integer(IntDef),
    Float(f64),
    Enum(EnumDef),
    String(String),
    Struct(StructDef),
    Variant(Box<VariantDef>),
    Array(Vec<Definition>),
    Sequence(Vec<Definition>),
}

impl Definition {
    /// Unsigned view of an integer or enum definition
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Definition::Integer(i) => Some(i.value.as_unsigned()),
            Definition::Enum(e) => Some(e.value.as_unsigned()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<&IntDef> {
        match self {
            Definition::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumDef> {
        match self {
            Definition::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructDef> {
        match self {
            Definition::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&VariantDef> {
        match self {
            Definition::Variant(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Definition]> {
        match self {
            Definition::Array(a) => Some(a),
            Definition::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view of an array of 8-bit integers (uuid fields)
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        let elems = self.as_array()?;
        elems
            .iter()
            .map(|e| e.as_unsigned().map(|v| v as u8))
            .collect()
    }
}

/// One frame per enclosing struct, innermost last.
///
/// Frames borrow the partially decoded field vectors of their structs; the
/// chain lives on the decode call stack, never in the value tree.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    fields: &'a [FieldDef],
}

impl<'a> Scope<'a> {
    pub fn root(fields: &'a [FieldDef]) -> Self {
        Scope {
            parent: None,
            fields,
        }
    }

    pub fn child(&'a self, fields: &'a [FieldDef]) -> Scope<'a> {
        Scope {
            parent: Some(self),
            fields,
        }
    }

    /// Resolve a name against the innermost scope first, walking outward.
    ///
    /// Within a frame the most recently decoded field wins, matching the
    /// rule that a length or tag reference designates the closest
    /// preceding definition.
    pub fn lookup(&self, name: &str) -> Option<&'a Definition> {
        let mut scope = Some(self);
        while let Some(s) = scope {
            if let Some(field) = s.fields.iter().rev().find(|f| f.name == name) {
                return Some(&field.value);
            }
            scope = s.parent;
        }
        None
    }

    /// Resolve a possibly dotted reference; a dotted path falls back to
    /// its final component when the full spelling is not in scope.
    pub fn lookup_ref(&self, reference: &str) -> Option<&'a Definition> {
        self.lookup(reference).or_else(|| {
            let last = reference.rsplit('.').next()?;
            self.lookup(last)
        })
    }

    pub fn lookup_unsigned(&self, name: &str) -> Option<u64> {
        self.lookup_ref(name).and_then(Definition::as_unsigned)
    }
}

/// Render a definition for diagnostics and CLI output
impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Definition::Integer(i) => match (i.base, i.value) {
                (16, v) => write!(f, "0x{:X}", v.as_unsigned() & crate::bitfield::mask(i.len)),
                (8, v) => write!(f, "0{:o}", v.as_unsigned() & crate::bitfield::mask(i.len)),
                (2, v) => write!(f, "0b{:b}", v.as_unsigned() & crate::bitfield::mask(i.len)),
                (_, v) => write!(f, "{v}"),
            },
            Definition::Float(v) => write!(f, "{v}"),
            Definition::Enum(e) => match &e.label {
                Some(label) => write!(f, "( \"{label}\" : container = {} )", e.value),
                None => write!(f, "( <unknown> : container = {} )", e.value),
            },
            Definition::String(s) => write!(f, "\"{s}\""),
            Definition::Struct(s) => {
                write!(f, "{{ ")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", field.name, field.value)?;
                }
                write!(f, " }}")
            }
            Definition::Variant(v) => write!(f, "{{ {} = {} }}", v.arm, v.value),
            Definition::Array(elems) | Definition::Sequence(elems) => {
                write!(f, "[ ")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, " ]")
            }
        }
    }
}

/// Helper for building integer definitions in tests and decode
pub(crate) fn int_def(value: IntValue, len: u32, base: u32) -> Definition {
    Definition::Integer(IntDef { value, len, base })
}
