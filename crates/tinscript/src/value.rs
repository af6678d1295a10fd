//! The closed type registry and the runtime value representation.
//!
//! `VarType` doubles as the on-wire type tag (one instruction/stack word)
//! and as the "push kind" request threaded through compile-tree `eval`:
//! `Void` means "leave nothing", `Var`/`HashVar`/`Member`/`StackVar`/
//! `PodMember` mean "leave a reference", `Resolve` means "leave whatever
//! you have", and a concrete type means "leave a value convertible to it".
//!
//! `Value` is the decoded form opcode handlers operate on. On the exec
//! stack, a value is `size_words()` data words followed by one type-tag
//! word; strings travel as their 32-bit hash, objects as their id.

use serde::{Deserialize, Serialize};

use crate::error::{ScriptError, ScriptResult};
use crate::intern::StringTable;

/// Widest value payload in words. Local-variable stack slots and return
/// value shuttling reserve this many words per entry.
pub const MAX_TYPE_WORDS: usize = 4;

/// Type tags for values, variables, and exec-stack reference markers.
///
/// The `Var`..`Resolve` tail never names a declared variable type; those
/// tags only appear as stack markers and `eval` push requests.
#[repr(u32)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::IntoStaticStr, Serialize, Deserialize,
)]
pub enum VarType {
    Void = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Object = 5,
    HashTable = 6,
    /// Reference to a global/local by `(ns_hash, func_hash, var_hash)`.
    Var = 7,
    /// Reference into a hashtable entry: `Var` plus a fourth key hash.
    HashVar = 8,
    /// Reference to an object member as `(member_hash, object_id)`.
    Member = 9,
    /// Reference to a local by `(declared_type, frame_offset)`.
    StackVar = 10,
    /// Reference to a sub-field of a POD value as `(declared_type, slot)`.
    PodMember = 11,
    /// Type-erased placeholder for scheduled-call return values.
    Resolve = 12,
}

impl VarType {
    /// Decodes a type tag from an instruction or stack word.
    pub fn from_word(word: u32) -> ScriptResult<Self> {
        Self::from_repr(word).ok_or_else(|| ScriptError::internal(format!("invalid type tag word: {word}")))
    }

    /// Payload size in 32-bit words when pushed on the exec stack.
    #[must_use]
    pub fn size_words(self) -> usize {
        match self {
            Self::Void | Self::HashTable | Self::Resolve => 0,
            Self::Bool | Self::Int | Self::Float | Self::String | Self::Object => 1,
            Self::Member | Self::StackVar | Self::PodMember => 2,
            Self::Var => 3,
            Self::HashVar => 4,
        }
    }

    /// True for the seven declarable types (`void` through `hashtable`).
    #[must_use]
    pub fn is_declarable(self) -> bool {
        matches!(
            self,
            Self::Void | Self::Bool | Self::Int | Self::Float | Self::String | Self::Object | Self::HashTable
        )
    }

    /// True for the stack reference markers.
    #[must_use]
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Self::Var | Self::HashVar | Self::Member | Self::StackVar | Self::PodMember
        )
    }

    /// True when an `eval` with this push kind wants something on the stack.
    #[must_use]
    pub fn wants_result(self) -> bool {
        self != Self::Void
    }

    /// Parses a declaration keyword (`int`, `float`, ...).
    #[must_use]
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "void" => Some(Self::Void),
            "bool" => Some(Self::Bool),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "string" => Some(Self::String),
            "object" => Some(Self::Object),
            "hashtable" => Some(Self::HashTable),
            _ => None,
        }
    }

    /// The declaration keyword for a declarable type.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Object => "object",
            Self::HashTable => "hashtable",
            other => {
                let name: &'static str = other.into();
                name
            }
        }
    }
}

/// A decoded runtime value.
///
/// `String` carries the string-table hash, `Object` the registry id. There
/// is no hashtable value: hashtables are only ever addressed through
/// variable references.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Void,
    Bool(bool),
    Int(i32),
    Float(f32),
    String(u32),
    Object(u32),
}

impl Value {
    #[must_use]
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Void => VarType::Void,
            Self::Bool(_) => VarType::Bool,
            Self::Int(_) => VarType::Int,
            Self::Float(_) => VarType::Float,
            Self::String(_) => VarType::String,
            Self::Object(_) => VarType::Object,
        }
    }

    /// The zero value of a declarable type. Hashtable and void variables
    /// have no scalar cell; they decode as `Void`.
    #[must_use]
    pub fn default_for(ty: VarType) -> Self {
        match ty {
            VarType::Bool => Self::Bool(false),
            VarType::Int => Self::Int(0),
            VarType::Float => Self::Float(0.0),
            VarType::String => Self::String(0),
            VarType::Object => Self::Object(0),
            _ => Self::Void,
        }
    }

    /// Encodes the payload words (without the type tag).
    #[must_use]
    pub fn encode_words(&self) -> Option<u32> {
        match *self {
            Self::Void => None,
            Self::Bool(b) => Some(u32::from(b)),
            Self::Int(i) => Some(i as u32),
            Self::Float(f) => Some(f.to_bits()),
            Self::String(h) => Some(h),
            Self::Object(id) => Some(id),
        }
    }

    /// Decodes a single payload word as the given concrete type.
    pub fn decode_word(ty: VarType, word: u32) -> ScriptResult<Self> {
        match ty {
            VarType::Bool => Ok(Self::Bool(word != 0)),
            VarType::Int => Ok(Self::Int(word as i32)),
            VarType::Float => Ok(Self::Float(f32::from_bits(word))),
            VarType::String => Ok(Self::String(word)),
            VarType::Object => Ok(Self::Object(word)),
            other => Err(ScriptError::internal(format!(
                "cannot decode a {} from a stack word",
                <&'static str>::from(other)
            ))),
        }
    }

    /// Converts to another concrete type, per the fixed coercion table.
    ///
    /// Strings resolve and re-intern through the table; numeric conversions
    /// truncate toward zero; object/bool truthiness is non-zero id.
    pub fn convert(&self, to: VarType, strings: &mut StringTable) -> ScriptResult<Self> {
        if self.var_type() == to {
            return Ok(*self);
        }
        match (self, to) {
            (Self::Bool(b), VarType::Int) => Ok(Self::Int(i32::from(*b))),
            (Self::Bool(b), VarType::Float) => Ok(Self::Float(if *b { 1.0 } else { 0.0 })),
            (Self::Int(i), VarType::Bool) => Ok(Self::Bool(*i != 0)),
            (Self::Int(i), VarType::Float) => Ok(Self::Float(*i as f32)),
            (Self::Int(i), VarType::Object) => Ok(Self::Object(*i as u32)),
            (Self::Float(f), VarType::Bool) => Ok(Self::Bool(*f != 0.0)),
            (Self::Float(f), VarType::Int) => Ok(Self::Int(*f as i32)),
            (Self::Object(id), VarType::Bool) => Ok(Self::Bool(*id != 0)),
            (Self::Object(id), VarType::Int) => Ok(Self::Int(*id as i32)),
            (Self::String(h), _) => {
                let text = strings
                    .get(*h)
                    .ok_or_else(|| ScriptError::resolution(format!("unknown string hash 0x{h:08x}")))?
                    .to_owned();
                string_to_value(&text, to)
            }
            (_, VarType::String) => {
                let text = self.to_display(strings);
                Ok(Self::String(strings.add(&text)?))
            }
            (Self::Void, VarType::Int) => Ok(Self::Int(0)),
            (Self::Void, VarType::Bool) => Ok(Self::Bool(false)),
            (Self::Void, VarType::Float) => Ok(Self::Float(0.0)),
            _ => Err(ScriptError::type_error(format!(
                "cannot convert {} to {}",
                <&'static str>::from(self.var_type()),
                <&'static str>::from(to)
            ))),
        }
    }

    /// Formats for `Print` and diagnostics.
    #[must_use]
    pub fn to_display(&self, strings: &StringTable) -> String {
        match *self {
            Self::Void => String::new(),
            Self::Bool(b) => if b { "true" } else { "false" }.to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => {
                if f == f.trunc() && f.abs() < 1e7 {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Self::String(h) => strings.unhash(h),
            Self::Object(id) => id.to_string(),
        }
    }
}

/// Parses literal text as a concrete type; the from-string half of the type
/// registry, shared by the compiler's literal lowering and `convert`.
pub fn string_to_value(text: &str, to: VarType) -> ScriptResult<Value> {
    let trimmed = text.trim();
    match to {
        VarType::Bool => match trimmed {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" | "" => Ok(Value::Bool(false)),
            _ => Err(ScriptError::type_error(format!("cannot convert {trimmed:?} to bool"))),
        },
        VarType::Int => {
            if let Ok(i) = trimmed.parse::<i32>() {
                Ok(Value::Int(i))
            } else if let Some(hex) = trimmed.strip_prefix("0x") {
                i32::from_str_radix(hex, 16)
                    .map(Value::Int)
                    .map_err(|_| ScriptError::type_error(format!("cannot convert {trimmed:?} to int")))
            } else if let Ok(f) = trimmed.parse::<f32>() {
                Ok(Value::Int(f as i32))
            } else {
                Err(ScriptError::type_error(format!("cannot convert {trimmed:?} to int")))
            }
        }
        VarType::Float => trimmed
            .parse::<f32>()
            .map(Value::Float)
            .map_err(|_| ScriptError::type_error(format!("cannot convert {trimmed:?} to float"))),
        VarType::Object => trimmed
            .parse::<u32>()
            .map(Value::Object)
            .map_err(|_| ScriptError::type_error(format!("cannot convert {trimmed:?} to object"))),
        other => Err(ScriptError::type_error(format!(
            "cannot convert a string literal to {}",
            <&'static str>::from(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_round_trip() {
        for word in 0..=12u32 {
            let ty = VarType::from_word(word).unwrap();
            assert_eq!(ty as u32, word);
        }
        assert!(VarType::from_word(13).is_err());
    }

    #[test]
    fn word_encode_decode() {
        let mut strings = StringTable::new();
        let hash = strings.add("hi").unwrap();
        for value in [
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(2.5),
            Value::String(hash),
            Value::Object(42),
        ] {
            let word = value.encode_words().unwrap();
            assert_eq!(Value::decode_word(value.var_type(), word).unwrap(), value);
        }
    }

    #[test]
    fn string_coerces_to_int() {
        let mut strings = StringTable::new();
        let hash = strings.add("2").unwrap();
        let converted = Value::String(hash).convert(VarType::Int, &mut strings).unwrap();
        assert_eq!(converted, Value::Int(2));
    }

    #[test]
    fn int_coerces_to_string() {
        let mut strings = StringTable::new();
        let converted = Value::Int(42).convert(VarType::String, &mut strings).unwrap();
        let Value::String(hash) = converted else {
            panic!("expected string");
        };
        assert_eq!(strings.get(hash), Some("42"));
    }

    #[test]
    fn garbage_string_to_int_is_a_type_error() {
        let mut strings = StringTable::new();
        let hash = strings.add("not a number").unwrap();
        assert!(Value::String(hash).convert(VarType::Int, &mut strings).is_err());
    }

    #[test]
    fn display_floats() {
        let strings = StringTable::new();
        assert_eq!(Value::Float(2.0).to_display(&strings), "2.0");
        assert_eq!(Value::Float(2.5).to_display(&strings), "2.5");
        assert_eq!(Value::Int(7).to_display(&strings), "7");
    }
}
