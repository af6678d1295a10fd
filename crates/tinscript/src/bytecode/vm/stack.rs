//! The word-addressed execution stack and the function call stack.
//!
//! A pushed value is its payload words followed by one type-tag word;
//! pop reads the tag, then rewinds by that type's size. Reserve and
//! unreserve move the top without tagging, carving out the zeroed
//! local-variable regions of script calls.

use smallvec::SmallVec;

use crate::error::{ScriptError, ScriptResult};
use crate::value::{Value, VarType, MAX_TYPE_WORDS};

/// Exec stack capacity in words.
pub const EXEC_STACK_WORDS: usize = 4096;

/// Call stack depth limit.
pub const CALL_STACK_DEPTH: usize = 32;

/// Payload words of one popped stack entry.
pub type RawWords = SmallVec<[u32; MAX_TYPE_WORDS]>;

/// Linear buffer of 32-bit words with an append pointer.
#[derive(Debug, Default)]
pub struct ExecStack {
    words: Vec<u32>,
}

impl ExecStack {
    #[must_use]
    pub fn new() -> Self {
        Self { words: Vec::with_capacity(256) }
    }

    #[must_use]
    pub fn top(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn check_capacity(&self, extra: usize) -> ScriptResult<()> {
        if self.words.len() + extra > EXEC_STACK_WORDS {
            return Err(ScriptError::resource("exec stack overflow"));
        }
        Ok(())
    }

    /// Pushes payload words followed by the type tag.
    pub fn push_raw(&mut self, payload: &[u32], ty: VarType) -> ScriptResult<()> {
        debug_assert_eq!(payload.len(), ty.size_words());
        self.check_capacity(payload.len() + 1)?;
        self.words.extend_from_slice(payload);
        self.words.push(ty as u32);
        Ok(())
    }

    /// Pushes a concrete value.
    pub fn push_value(&mut self, value: Value) -> ScriptResult<()> {
        match value.encode_words() {
            Some(word) => self.push_raw(&[word], value.var_type()),
            None => Err(ScriptError::internal("cannot push a void value")),
        }
    }

    /// Pops the type tag, then the payload words.
    pub fn pop_raw(&mut self) -> ScriptResult<(RawWords, VarType)> {
        let tag = self
            .words
            .pop()
            .ok_or_else(|| ScriptError::internal("exec stack underflow"))?;
        let ty = VarType::from_word(tag)?;
        let size = ty.size_words();
        if self.words.len() < size {
            return Err(ScriptError::internal("exec stack underflow"));
        }
        let start = self.words.len() - size;
        let payload: RawWords = self.words[start..].into();
        self.words.truncate(start);
        Ok((payload, ty))
    }

    /// Moves the append pointer up by `count` zeroed words, untagged.
    pub fn reserve(&mut self, count: usize) -> ScriptResult<()> {
        self.check_capacity(count)?;
        self.words.resize(self.words.len() + count, 0);
        Ok(())
    }

    /// Moves the append pointer back down by `count` words.
    pub fn unreserve(&mut self, count: usize) -> ScriptResult<()> {
        if self.words.len() < count {
            return Err(ScriptError::internal("exec stack unreserve below base"));
        }
        self.words.truncate(self.words.len() - count);
        Ok(())
    }

    /// Absolute word index of a frame-relative variable slot.
    pub fn slot_index(&self, frame_base: usize, offset: u16) -> ScriptResult<usize> {
        let index = frame_base + usize::from(offset) * MAX_TYPE_WORDS;
        if index >= self.words.len() {
            return Err(ScriptError::internal("stack variable address out of range"));
        }
        Ok(index)
    }

    pub fn read_slot(&self, index: usize) -> ScriptResult<u32> {
        self.words
            .get(index)
            .copied()
            .ok_or_else(|| ScriptError::internal("stack variable address out of range"))
    }

    pub fn write_slot(&mut self, index: usize, word: u32) -> ScriptResult<()> {
        let slot = self
            .words
            .get_mut(index)
            .ok_or_else(|| ScriptError::internal("stack variable address out of range"))?;
        *slot = word;
        Ok(())
    }
}

/// One activation record.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Namespace hash of the function entry (0 = global namespace).
    pub ns_hash: u32,
    pub func_hash: u32,
    /// `self` for method calls, 0 otherwise.
    pub object_id: u32,
    /// Exec-stack top at push time; the local-variable region begins here.
    pub stack_base: usize,
    /// False between `FuncCallArgs` and `FuncCall` while parameters are
    /// still being assigned.
    pub is_executing: bool,
    /// Call-site line, for fault reporting.
    pub call_line: u32,
}

/// Array of frames tracking calls in progress.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ns_hash: u32, func_hash: u32, object_id: u32, stack_base: usize, call_line: u32) -> ScriptResult<()> {
        if self.frames.len() >= CALL_STACK_DEPTH {
            return Err(ScriptError::resource(format!(
                "call stack depth exceeds {CALL_STACK_DEPTH}"
            )));
        }
        self.frames.push(Frame {
            ns_hash,
            func_hash,
            object_id,
            stack_base,
            is_executing: false,
            call_line,
        });
        Ok(())
    }

    pub fn pop(&mut self) -> ScriptResult<Frame> {
        self.frames
            .pop()
            .ok_or_else(|| ScriptError::internal("function return with no call frame"))
    }

    #[must_use]
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Flips the top frame to executing.
    pub fn begin_execution(&mut self) -> ScriptResult<()> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| ScriptError::internal("begin execution with no call frame"))?;
        if frame.is_executing {
            return Err(ScriptError::internal("call frame already executing"));
        }
        frame.is_executing = true;
        Ok(())
    }

    /// The innermost frame actually executing (stack-variable base).
    #[must_use]
    pub fn executing(&self) -> Option<&Frame> {
        self.frames.iter().rev().find(|f| f.is_executing)
    }

    /// The innermost frame bound to an object (`self` resolution for
    /// dynamic-variable declaration).
    #[must_use]
    pub fn top_method(&self) -> Option<&Frame> {
        self.frames.iter().rev().find(|f| f.object_id != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let mut stack = ExecStack::new();
        stack.push_value(Value::Int(42)).unwrap();
        stack.push_value(Value::Bool(true)).unwrap();

        let (payload, ty) = stack.pop_raw().unwrap();
        assert_eq!(ty, VarType::Bool);
        assert_eq!(payload.as_slice(), &[1]);

        let (payload, ty) = stack.pop_raw().unwrap();
        assert_eq!(ty, VarType::Int);
        assert_eq!(payload.as_slice(), &[42]);
        assert!(stack.is_empty());
    }

    #[test]
    fn reserve_carves_zeroed_region() {
        let mut stack = ExecStack::new();
        stack.push_value(Value::Int(1)).unwrap();
        let base = stack.top();
        stack.reserve(2 * MAX_TYPE_WORDS).unwrap();
        let index = stack.slot_index(base, 1).unwrap();
        assert_eq!(stack.read_slot(index).unwrap(), 0);
        stack.write_slot(index, 9).unwrap();
        assert_eq!(stack.read_slot(index).unwrap(), 9);
        stack.unreserve(2 * MAX_TYPE_WORDS).unwrap();
        assert_eq!(stack.top(), base);
    }

    #[test]
    fn overflow_is_a_resource_error() {
        let mut stack = ExecStack::new();
        let err = stack.reserve(EXEC_STACK_WORDS + 1).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resource);
    }

    #[test]
    fn call_depth_is_limited() {
        let mut calls = CallStack::new();
        for i in 0..CALL_STACK_DEPTH {
            calls.push(0, i as u32, 0, 0, 0).unwrap();
        }
        assert!(calls.push(0, 99, 0, 0, 0).is_err());
    }

    #[test]
    fn executing_skips_frames_still_assembling_arguments() {
        let mut calls = CallStack::new();
        calls.push(0, 1, 0, 0, 0).unwrap();
        calls.begin_execution().unwrap();
        calls.push(0, 2, 0, 8, 0).unwrap();
        // frame 2 is still gathering args; stack vars resolve against 1
        assert_eq!(calls.executing().unwrap().func_hash, 1);
        calls.begin_execution().unwrap();
        assert_eq!(calls.executing().unwrap().func_hash, 2);
    }
}
