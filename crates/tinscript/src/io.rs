//! Output plumbing for the `Print` builtin and diagnostic dumps.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

/// Receives output from scripts and diagnostics.
///
/// Implement this to capture or redirect everything the context prints;
/// the default implementation writes lines to stdout.
pub trait PrintWriter {
    /// Called once per completed line, without a trailing newline.
    fn write_line(&mut self, line: &str);
}

/// Default writer: one line to stdout per call.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_line(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}

/// Collects printed lines into a shared buffer; the writer half is owned
/// by the context while the handle half stays with the test or embedder.
#[derive(Debug, Default, Clone)]
pub struct CollectPrint {
    lines: Rc<RefCell<Vec<String>>>,
}

impl CollectPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines printed so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Everything printed so far, joined with newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.borrow().join("\n")
    }

    pub fn clear(&self) {
        self.lines.borrow_mut().clear();
    }
}

impl PrintWriter for CollectPrint {
    fn write_line(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_print_shares_lines_across_clones() {
        let handle = CollectPrint::new();
        let mut writer = handle.clone();
        writer.write_line("one");
        writer.write_line("two");
        assert_eq!(handle.lines(), vec!["one", "two"]);
        assert_eq!(handle.text(), "one\ntwo");
    }
}
