//! Type-class-dispatched decode over the declaration tree
//!
//! Decoding recurses over compound declarations: structs iterate their
//! fields, variants select an arm from their tag's current label, and
//! sequences read their length field before iterating. Every primitive
//! read honors the declaration's alignment, bit length, signedness and
//! byte order, advancing the cursor by exactly the field length.

use crate::decl::{
    ArrayDecl, DeclArena, DeclId, Declaration, EnumDecl, FloatDecl, IntegerDecl, SequenceDecl,
    StructDecl, VariantDecl,
};
use crate::def::{Definition, EnumDef, FieldDef, IntDef, IntValue, Scope, StructDef, VariantDef};
use crate::error::{CtfError, Result};
use crate::pos::StreamPos;

/// Decode one definition for declaration `id` at the current cursor.
pub fn decode(
    arena: &DeclArena,
    id: DeclId,
    pos: &mut StreamPos,
    scope: Option<&Scope<'_>>,
) -> Result<Definition> {
    match arena.get(id) {
        Declaration::Integer(d) => decode_integer(d, pos),
        Declaration::Float(d) => decode_float(d, pos),
        Declaration::Enum(d) => decode_enum(d, pos),
        Declaration::String(_) => Ok(Definition::String(pos.read_string()?)),
        Declaration::Struct(d) => decode_struct(arena, d, pos, scope),
        Declaration::Variant(d) => decode_variant(arena, d, pos, scope),
        Declaration::Array(d) => decode_array(arena, d, pos, scope),
        Declaration::Sequence(d) => decode_sequence(arena, d, pos, scope),
    }
}

/// Decode a struct declaration into its own root definition.
pub fn decode_struct_root(
    arena: &DeclArena,
    id: DeclId,
    pos: &mut StreamPos,
    scope: Option<&Scope<'_>>,
) -> Result<StructDef> {
    match decode(arena, id, pos, scope)? {
        Definition::Struct(s) => Ok(s),
        _ => Err(CtfError::decode("scope root declaration is not a struct")),
    }
}

fn decode_integer(d: &IntegerDecl, pos: &mut StreamPos) -> Result<Definition> {
    pos.align(d.align)?;
    let value = if d.signed {
        IntValue::Signed(pos.read_signed(d.len, d.byte_order)?)
    } else {
        IntValue::Unsigned(pos.read_unsigned(d.len, d.byte_order)?)
    };
    Ok(Definition::Integer(IntDef {
        value,
        len: d.len,
        base: d.base,
    }))
}

fn decode_float(d: &FloatDecl, pos: &mut StreamPos) -> Result<Definition> {
    pos.align(d.align)?;
    let value = match (d.exp_dig, d.mant_dig) {
        (8, 24) => {
            let bits = pos.read_unsigned(32, d.byte_order)? as u32;
            f64::from(f32::from_bits(bits))
        }
        (11, 53) => {
            let bits = pos.read_unsigned(64, d.byte_order)?;
            f64::from_bits(bits)
        }
        (exp, mant) => {
            return Err(CtfError::decode(format!(
                "unsupported floating point layout: exp_dig {exp}, mant_dig {mant}"
            )))
        }
    };
    Ok(Definition::Float(value))
}

fn decode_enum(d: &EnumDecl, pos: &mut StreamPos) -> Result<Definition> {
    let c = &d.container;
    pos.align(c.align)?;
    let value = if c.signed {
        IntValue::Signed(pos.read_signed(c.len, c.byte_order)?)
    } else {
        IntValue::Unsigned(pos.read_unsigned(c.len, c.byte_order)?)
    };
    let label = d.label_for(value.as_signed()).map(str::to_owned);
    Ok(Definition::Enum(EnumDef { value, label }))
}

fn decode_struct(
    arena: &DeclArena,
    d: &StructDecl,
    pos: &mut StreamPos,
    scope: Option<&Scope<'_>>,
) -> Result<Definition> {
    pos.align(d.align)?;
    let mut fields: Vec<FieldDef> = Vec::with_capacity(d.fields.len());
    for field in &d.fields {
        // Fields decoded so far are visible to this field's tag and
        // length references.
        let value = {
            let frame = match scope {
                Some(outer) => outer.child(&fields),
                None => Scope::root(&fields),
            };
            decode(arena, field.decl, pos, Some(&frame))?
        };
        fields.push(FieldDef {
            name: field.name.clone(),
            value,
        });
    }
    Ok(Definition::Struct(StructDef { fields }))
}

fn decode_variant(
    arena: &DeclArena,
    d: &VariantDecl,
    pos: &mut StreamPos,
    scope: Option<&Scope<'_>>,
) -> Result<Definition> {
    let scope =
        scope.ok_or_else(|| CtfError::decode(format!("variant tag {:?} out of scope", d.tag)))?;
    let tag = scope
        .lookup_ref(&d.tag)
        .ok_or_else(|| CtfError::decode(format!("variant tag {:?} not found in scope", d.tag)))?;
    let label = match tag {
        Definition::Enum(e) => e.label.clone().ok_or_else(|| {
            CtfError::decode(format!("variant tag {:?} value has no label", d.tag))
        })?,
        _ => {
            return Err(CtfError::decode(format!(
                "variant tag {:?} is not an enum",
                d.tag
            )))
        }
    };
    let arm = d.arm(&label).ok_or_else(|| {
        CtfError::decode(format!("no variant arm for tag label {label:?}"))
    })?;
    let value = decode(arena, arm.decl, pos, Some(scope))?;
    Ok(Definition::Variant(Box::new(VariantDef {
        tag_label: label,
        arm: arm.name.clone(),
        value,
    })))
}

fn decode_array(
    arena: &DeclArena,
    d: &ArrayDecl,
    pos: &mut StreamPos,
    scope: Option<&Scope<'_>>,
) -> Result<Definition> {
    pos.align(arena.alignment(d.elem))?;
    let mut elems = Vec::with_capacity(d.len as usize);
    for _ in 0..d.len {
        elems.push(decode(arena, d.elem, pos, scope)?);
    }
    Ok(Definition::Array(elems))
}

fn decode_sequence(
    arena: &DeclArena,
    d: &SequenceDecl,
    pos: &mut StreamPos,
    scope: Option<&Scope<'_>>,
) -> Result<Definition> {
    let scope_ref = scope.ok_or_else(|| {
        CtfError::decode(format!("sequence length {:?} out of scope", d.length_field))
    })?;
    let len = scope_ref.lookup_unsigned(&d.length_field).ok_or_else(|| {
        CtfError::decode(format!(
            "sequence length {:?} not found in scope",
            d.length_field
        ))
    })?;
    // Each element occupies at least one bit; a length beyond the packet
    // content cannot decode.
    if len > pos.content_size {
        return Err(CtfError::decode(format!(
            "sequence length {len} exceeds packet content"
        )));
    }
    pos.align(arena.alignment(d.elem))?;
    let mut elems = Vec::with_capacity(len as usize);
    for _ in 0..len {
        elems.push(decode(arena, d.elem, pos, scope)?);
    }
    Ok(Definition::Sequence(elems))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{ByteOrder, EnumMapping, StringDecl, StructFieldDecl};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pos_over(bytes: &[u8]) -> (NamedTempFile, StreamPos) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        let mut pos = StreamPos::new(file.reopen().unwrap()).unwrap();
        pos.map_window(0, bytes.len() as u64).unwrap();
        pos.packet_size = bytes.len() as u64 * 8;
        pos.content_size = bytes.len() as u64 * 8;
        (file, pos)
    }

    fn uint_decl(len: u32) -> IntegerDecl {
        IntegerDecl {
            len,
            signed: false,
            byte_order: ByteOrder::Little,
            base: 10,
            align: IntegerDecl::default_align(len),
        }
    }

    #[test]
    fn test_decode__integer_le__then_value_and_advance() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::Integer(uint_decl(32)));
        let (_f, mut pos) = pos_over(&0xCAFEBABEu32.to_le_bytes());

        let def = decode(&arena, id, &mut pos, None).unwrap();
        assert_eq!(def.as_unsigned(), Some(0xCAFEBABE));
        assert_eq!(pos.offset(), Some(32));
    }

    #[test]
    fn test_decode__integer_be__then_big_endian_value() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::Integer(IntegerDecl {
            byte_order: ByteOrder::Big,
            ..uint_decl(32)
        }));
        let (_f, mut pos) = pos_over(&0xCAFEBABEu32.to_be_bytes());

        let def = decode(&arena, id, &mut pos, None).unwrap();
        assert_eq!(def.as_unsigned(), Some(0xCAFEBABE));
    }

    #[test]
    fn test_decode__signed_integer__then_sign_extended() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::Integer(IntegerDecl {
            signed: true,
            ..uint_decl(16)
        }));
        let (_f, mut pos) = pos_over(&(-123i16).to_le_bytes());

        let def = decode(&arena, id, &mut pos, None).unwrap();
        assert_eq!(def.as_integer().unwrap().value, IntValue::Signed(-123));
    }

    #[test]
    fn test_decode__float32__then_widened_to_f64() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::Float(FloatDecl {
            exp_dig: 8,
            mant_dig: 24,
            byte_order: ByteOrder::Little,
            align: 8,
        }));
        let (_f, mut pos) = pos_over(&1.5f32.to_bits().to_le_bytes());

        match decode(&arena, id, &mut pos, None).unwrap() {
            Definition::Float(v) => assert_eq!(v, 1.5),
            other => panic!("unexpected definition: {other:?}"),
        }
    }

    #[test]
    fn test_decode__float64__then_exact() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::Float(FloatDecl {
            exp_dig: 11,
            mant_dig: 53,
            byte_order: ByteOrder::Little,
            align: 8,
        }));
        let (_f, mut pos) = pos_over(&2.25f64.to_bits().to_le_bytes());

        match decode(&arena, id, &mut pos, None).unwrap() {
            Definition::Float(v) => assert_eq!(v, 2.25),
            other => panic!("unexpected definition: {other:?}"),
        }
    }

    #[test]
    fn test_decode__unsupported_float_layout__then_error() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::Float(FloatDecl {
            exp_dig: 5,
            mant_dig: 11,
            byte_order: ByteOrder::Little,
            align: 8,
        }));
        let (_f, mut pos) = pos_over(&[0u8; 2]);

        assert!(decode(&arena, id, &mut pos, None).is_err());
    }

    #[test]
    fn test_decode__enum__then_label_resolved() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::Enum(EnumDecl {
            container: uint_decl(8),
            mappings: vec![EnumMapping {
                label: "RUNNING".into(),
                start: 2,
                end: 2,
            }],
        }));
        let (_f, mut pos) = pos_over(&[2u8]);

        match decode(&arena, id, &mut pos, None).unwrap() {
            Definition::Enum(e) => {
                assert_eq!(e.value, IntValue::Unsigned(2));
                assert_eq!(e.label.as_deref(), Some("RUNNING"));
            }
            other => panic!("unexpected definition: {other:?}"),
        }
    }

    #[test]
    fn test_decode__string__then_nul_terminated() {
        let mut arena = DeclArena::new();
        let id = arena.alloc(Declaration::String(StringDecl));
        let (_f, mut pos) = pos_over(b"sys_open\0");

        match decode(&arena, id, &mut pos, None).unwrap() {
            Definition::String(s) => assert_eq!(s, "sys_open"),
            other => panic!("unexpected definition: {other:?}"),
        }
    }

    #[test]
    fn test_decode__struct_with_padding__then_fields_aligned() {
        let mut arena = DeclArena::new();
        let u8_id = arena.alloc(Declaration::Integer(uint_decl(8)));
        let u32_id = arena.alloc(Declaration::Integer(uint_decl(32)));
        let fields = vec![
            StructFieldDecl {
                name: "a".into(),
                decl: u8_id,
            },
            StructFieldDecl {
                name: "b".into(),
                decl: u32_id,
            },
        ];
        let align = arena.struct_align(&fields, 1);
        let s = arena.alloc(Declaration::Struct(StructDecl { fields, align }));

        // u8 then u32; byte alignment keeps them adjacent.
        let mut data = vec![7u8];
        data.extend_from_slice(&0x11223344u32.to_le_bytes());
        let (_f, mut pos) = pos_over(&data);

        let def = decode(&arena, s, &mut pos, None).unwrap();
        let s = def.as_struct().unwrap();
        assert_eq!(s.unsigned_field("a"), Some(7));
        assert_eq!(s.unsigned_field("b"), Some(0x11223344));
    }

    #[test]
    fn test_decode__fixed_array__then_len_elements() {
        let mut arena = DeclArena::new();
        let u8_id = arena.alloc(Declaration::Integer(uint_decl(8)));
        let arr = arena.alloc(Declaration::Array(ArrayDecl {
            len: 4,
            elem: u8_id,
        }));
        let (_f, mut pos) = pos_over(&[10, 20, 30, 40]);

        let def = decode(&arena, arr, &mut pos, None).unwrap();
        assert_eq!(def.as_bytes(), Some(vec![10, 20, 30, 40]));
    }

    #[test]
    fn test_decode__sequence__then_length_from_sibling() {
        let mut arena = DeclArena::new();
        let u8_id = arena.alloc(Declaration::Integer(uint_decl(8)));
        let seq = arena.alloc(Declaration::Sequence(SequenceDecl {
            length_field: "len".into(),
            elem: u8_id,
        }));
        let fields = vec![
            StructFieldDecl {
                name: "len".into(),
                decl: u8_id,
            },
            StructFieldDecl {
                name: "data".into(),
                decl: seq,
            },
        ];
        let align = arena.struct_align(&fields, 1);
        let s = arena.alloc(Declaration::Struct(StructDecl { fields, align }));
        let (_f, mut pos) = pos_over(&[3, 0xAA, 0xBB, 0xCC, 0xDD]);

        let def = decode(&arena, s, &mut pos, None).unwrap();
        let data = def.as_struct().unwrap().field("data").unwrap();
        assert_eq!(data.as_bytes(), Some(vec![0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn test_decode__sequence_length_overflow__then_error() {
        let mut arena = DeclArena::new();
        let u32_id = arena.alloc(Declaration::Integer(uint_decl(32)));
        let u8_id = arena.alloc(Declaration::Integer(uint_decl(8)));
        let seq = arena.alloc(Declaration::Sequence(SequenceDecl {
            length_field: "len".into(),
            elem: u8_id,
        }));
        let fields = vec![
            StructFieldDecl {
                name: "len".into(),
                decl: u32_id,
            },
            StructFieldDecl {
                name: "data".into(),
                decl: seq,
            },
        ];
        let align = arena.struct_align(&fields, 1);
        let s = arena.alloc(Declaration::Struct(StructDecl { fields, align }));
        let (_f, mut pos) = pos_over(&u32::MAX.to_le_bytes());

        assert!(decode(&arena, s, &mut pos, None).is_err());
    }

    #[test]
    fn test_decode__variant__then_arm_selected_by_tag_label() {
        let mut arena = DeclArena::new();
        let tag = arena.alloc(Declaration::Enum(EnumDecl {
            container: uint_decl(8),
            mappings: vec![
                EnumMapping {
                    label: "compact".into(),
                    start: 0,
                    end: 0,
                },
                EnumMapping {
                    label: "extended".into(),
                    start: 1,
                    end: 1,
                },
            ],
        }));
        let u16_id = arena.alloc(Declaration::Integer(uint_decl(16)));
        let u32_id = arena.alloc(Declaration::Integer(uint_decl(32)));
        let variant = arena.alloc(Declaration::Variant(VariantDecl {
            tag: "id".into(),
            arms: vec![
                StructFieldDecl {
                    name: "compact".into(),
                    decl: u16_id,
                },
                StructFieldDecl {
                    name: "extended".into(),
                    decl: u32_id,
                },
            ],
        }));
        let fields = vec![
            StructFieldDecl {
                name: "id".into(),
                decl: tag,
            },
            StructFieldDecl {
                name: "v".into(),
                decl: variant,
            },
        ];
        let align = arena.struct_align(&fields, 1);
        let s = arena.alloc(Declaration::Struct(StructDecl { fields, align }));

        // Tag 1 selects the "extended" 32-bit arm, byte-aligned after the tag.
        let mut data = vec![1u8];
        data.extend_from_slice(&0xFEEDF00Du32.to_le_bytes());
        let (_f, mut pos) = pos_over(&data);

        let def = decode(&arena, s, &mut pos, None).unwrap();
        let v = def.as_struct().unwrap().field("v").unwrap().as_variant().unwrap();
        assert_eq!(v.arm, "extended");
        assert_eq!(v.tag_label, "extended");
        assert_eq!(v.value.as_unsigned(), Some(0xFEEDF00D));
    }

    #[test]
    fn test_decode__variant_unknown_label__then_error() {
        let mut arena = DeclArena::new();
        let tag = arena.alloc(Declaration::Enum(EnumDecl {
            container: uint_decl(8),
            mappings: vec![EnumMapping {
                label: "only".into(),
                start: 0,
                end: 0,
            }],
        }));
        let u16_id = arena.alloc(Declaration::Integer(uint_decl(16)));
        let variant = arena.alloc(Declaration::Variant(VariantDecl {
            tag: "id".into(),
            arms: vec![StructFieldDecl {
                name: "other".into(),
                decl: u16_id,
            }],
        }));
        let fields = vec![
            StructFieldDecl {
                name: "id".into(),
                decl: tag,
            },
            StructFieldDecl {
                name: "v".into(),
                decl: variant,
            },
        ];
        let align = arena.struct_align(&fields, 1);
        let s = arena.alloc(Declaration::Struct(StructDecl { fields, align }));
        let (_f, mut pos) = pos_over(&[0u8, 0, 0, 0]);

        assert!(decode(&arena, s, &mut pos, None).is_err());
    }
}
