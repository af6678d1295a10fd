//! The opcode set.
//!
//! An instruction is one opcode word followed by a fixed number of operand
//! words, except `Push`, whose operand count depends on the pushed type
//! (one type word plus the type's payload words). Branch operands are
//! signed word deltas applied to an instruction pointer that has already
//! advanced past the operand word.

use crate::error::{ScriptError, ScriptResult};
use crate::value::VarType;

/// One VM operation. The discriminant is the instruction word.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::IntoStaticStr)]
pub enum Opcode {
    Nop = 0,
    VarDecl,
    ParamDecl,
    Push,
    PushParam,
    PushLocalVar,
    PushLocalValue,
    PushGlobalVar,
    PushGlobalValue,
    PushArrayVar,
    PushArrayValue,
    PushMember,
    PushMemberVal,
    PushPodMember,
    PushPodMemberVal,
    PushSelf,
    Pop,
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    Assign,
    AssignAdd,
    AssignSub,
    AssignMult,
    AssignDiv,
    AssignMod,
    AssignLeftShift,
    AssignRightShift,
    AssignBitAnd,
    AssignBitOr,
    AssignBitXor,
    BitLeftShift,
    BitRightShift,
    BitAnd,
    BitOr,
    BitXor,
    CompareEqual,
    CompareNotEqual,
    CompareLess,
    CompareLessEqual,
    CompareGreater,
    CompareGreaterEqual,
    BooleanAnd,
    BooleanOr,
    UnaryPreInc,
    UnaryPreDec,
    UnaryNeg,
    UnaryPos,
    UnaryBitInvert,
    UnaryNot,
    Branch,
    BranchTrue,
    BranchFalse,
    FuncDecl,
    FuncDeclEnd,
    FuncCallArgs,
    MethodCallArgs,
    FuncCall,
    FuncReturn,
    ArrayHash,
    ArrayVarDecl,
    SelfVarDecl,
    ScheduleBegin,
    ScheduleParam,
    ScheduleEnd,
    CreateObject,
    DestroyObject,
    Eof,
}

impl Opcode {
    /// Decodes an instruction word.
    pub fn from_word(word: u32) -> ScriptResult<Self> {
        Self::from_repr(word).ok_or_else(|| ScriptError::internal(format!("invalid opcode word: {word}")))
    }

    /// Fixed operand word count, or `None` for `Push` (type-dependent).
    #[must_use]
    pub fn operand_words(self) -> Option<usize> {
        match self {
            Self::Push => None,
            Self::VarDecl
            | Self::ParamDecl
            | Self::PushLocalVar
            | Self::PushLocalValue
            | Self::FuncCallArgs
            | Self::MethodCallArgs
            | Self::SelfVarDecl => Some(2),
            Self::PushGlobalVar | Self::PushGlobalValue | Self::PushArrayVar | Self::PushArrayValue | Self::FuncDecl => {
                Some(3)
            }
            Self::PushParam
            | Self::PushMember
            | Self::PushMemberVal
            | Self::PushPodMember
            | Self::PushPodMemberVal
            | Self::Branch
            | Self::BranchTrue
            | Self::BranchFalse
            | Self::ArrayVarDecl
            | Self::ScheduleBegin
            | Self::ScheduleParam
            | Self::CreateObject => Some(1),
            _ => Some(0),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Renders an instruction buffer one instruction per line, for
/// diagnostics and trace output.
#[must_use]
pub fn disassemble(instructions: &[u32]) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let mut ip = 0usize;
    while ip < instructions.len() {
        let Ok(op) = Opcode::from_word(instructions[ip]) else {
            let _ = writeln!(out, "{ip:06}  <bad opcode 0x{:08x}>", instructions[ip]);
            ip += 1;
            continue;
        };
        let _ = write!(out, "{ip:06}  {}", op.name());
        ip += 1;
        let operand_count = match op.operand_words() {
            Some(n) => n,
            None => {
                // Push: the first operand is the type word
                let ty_word = instructions.get(ip).copied().unwrap_or(0);
                let payload = VarType::from_word(ty_word).map_or(0, VarType::size_words);
                1 + payload
            }
        };
        for _ in 0..operand_count {
            if let Some(word) = instructions.get(ip) {
                let _ = write!(out, " 0x{word:08x}");
            }
            ip += 1;
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        let mut word = 0u32;
        while let Some(op) = Opcode::from_repr(word) {
            assert_eq!(op as u32, word);
            word += 1;
        }
        assert_eq!(Opcode::from_repr(word - 1), Some(Opcode::Eof));
        assert!(Opcode::from_word(word).is_err());
    }

    #[test]
    fn push_has_variable_operands() {
        assert_eq!(Opcode::Push.operand_words(), None);
        assert_eq!(Opcode::FuncDecl.operand_words(), Some(3));
        assert_eq!(Opcode::Eof.operand_words(), Some(0));
    }

    #[test]
    fn disassemble_skips_operands() {
        let buf = vec![
            Opcode::Push as u32,
            VarType::Int as u32,
            7,
            Opcode::Pop as u32,
            Opcode::Eof as u32,
        ];
        let text = disassemble(&buf);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Push"));
        assert!(lines[1].contains("Pop"));
        assert!(lines[2].contains("Eof"));
    }
}
