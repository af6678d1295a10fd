//! The two-pass instruction emitter.
//!
//! The first `eval` pass runs in count-only mode: nothing is written, but
//! the word counter advances exactly as emission would. The buffer is then
//! allocated and the second pass writes. The two passes must produce
//! identical sizes; the compiler checks this and treats a mismatch as a
//! fatal internal error.

use crate::bytecode::op::Opcode;
use crate::value::Value;

/// Marks a placeholder word to be back-patched with a branch count.
#[derive(Debug, Clone, Copy)]
pub struct PatchLabel(usize);

/// Word emitter shared by both compile passes.
#[derive(Debug)]
pub struct Emitter {
    count_only: bool,
    words: Vec<u32>,
    line_numbers: Vec<u32>,
    /// Words emitted (or counted) so far.
    count: usize,
    last_recorded_line: u32,
}

impl Emitter {
    /// Creates a count-only emitter for the sizing pass.
    #[must_use]
    pub fn counter() -> Self {
        Self {
            count_only: true,
            words: Vec::new(),
            line_numbers: Vec::new(),
            count: 0,
            last_recorded_line: u32::MAX,
        }
    }

    /// Creates a writing emitter with the buffer preallocated to the size
    /// the counting pass reported.
    #[must_use]
    pub fn writer(capacity: usize) -> Self {
        Self {
            count_only: false,
            words: Vec::with_capacity(capacity),
            line_numbers: Vec::new(),
            count: 0,
            last_recorded_line: u32::MAX,
        }
    }

    #[must_use]
    pub fn is_count_only(&self) -> bool {
        self.count_only
    }

    /// Current word offset; the next emitted word lands here.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.count
    }

    /// Emits one raw word. Returns the word count (always 1) so node
    /// `eval` implementations can accumulate sizes.
    pub fn word(&mut self, word: u32) -> usize {
        if !self.count_only {
            self.words.push(word);
        }
        self.count += 1;
        1
    }

    /// Emits an opcode word.
    pub fn op(&mut self, op: Opcode) -> usize {
        self.word(op as u32)
    }

    /// Emits a value payload (without a type word).
    pub fn value_words(&mut self, value: &Value) -> usize {
        match value.encode_words() {
            Some(word) => self.word(word),
            None => 0,
        }
    }

    /// Emits a placeholder word and returns a label to patch later.
    pub fn placeholder(&mut self) -> (PatchLabel, usize) {
        let label = PatchLabel(self.count);
        let size = self.word(0);
        (label, size)
    }

    /// Back-patches a placeholder. A no-op during the counting pass.
    pub fn patch(&mut self, label: PatchLabel, word: u32) {
        if !self.count_only {
            self.words[label.0] = word;
        }
    }

    /// Records the source line for the instruction about to be emitted.
    /// Consecutive instructions on the same line share one entry.
    pub fn record_line(&mut self, line: u32) {
        if line == self.last_recorded_line {
            return;
        }
        self.last_recorded_line = line;
        if !self.count_only {
            let entry = ((self.count as u32) << 16) | (line & 0xffff);
            self.line_numbers.push(entry);
        }
    }

    /// Consumes the emitter, yielding the instruction buffer and line
    /// table. Only meaningful on the writing pass.
    #[must_use]
    pub fn finish(self) -> (Vec<u32>, Vec<u32>) {
        (self.words, self.line_numbers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::VarType;

    #[test]
    fn count_pass_writes_nothing() {
        let mut emit = Emitter::counter();
        emit.op(Opcode::Nop);
        emit.word(7);
        assert_eq!(emit.offset(), 2);
        let (words, _) = emit.finish();
        assert!(words.is_empty());
    }

    #[test]
    fn write_pass_matches_count_pass() {
        let build = |emit: &mut Emitter| {
            let mut size = 0;
            size += emit.op(Opcode::Push);
            size += emit.word(VarType::Int as u32);
            size += emit.value_words(&Value::Int(42));
            size += emit.op(Opcode::Pop);
            size
        };

        let mut counter = Emitter::counter();
        let counted = build(&mut counter);

        let mut writer = Emitter::writer(counted);
        let written = build(&mut writer);
        assert_eq!(counted, written);

        let (words, _) = writer.finish();
        assert_eq!(words.len(), counted);
        assert_eq!(words[2], 42);
    }

    #[test]
    fn patching_fills_placeholder() {
        let mut emit = Emitter::writer(4);
        emit.op(Opcode::BranchFalse);
        let (label, _) = emit.placeholder();
        emit.op(Opcode::Nop);
        emit.op(Opcode::Nop);
        emit.patch(label, 2);
        let (words, _) = emit.finish();
        assert_eq!(words[1], 2);
    }

    #[test]
    fn line_entries_deduplicate() {
        let mut emit = Emitter::writer(4);
        emit.record_line(3);
        emit.op(Opcode::Nop);
        emit.record_line(3);
        emit.op(Opcode::Nop);
        emit.record_line(4);
        emit.op(Opcode::Nop);
        let (_, lines) = emit.finish();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0] & 0xffff, 3);
        assert_eq!(lines[1] >> 16, 2);
    }
}
