// api.rs - Public Regex / RegexBuilder surface.
//
// Wraps the pipeline internals (translate, assemble, exec) with a compact
// owner type: the compiled program, its per-match state, and the registered
// code hooks live together, and matching borrows the instance exclusively.

use std::collections::HashMap;
use std::path::Path;

use crate::assemble::{assemble, Program};
use crate::cursor::Cursor;
use crate::error::{CompileError, RuntimeError};
use crate::exec::{run_match, run_match_all, run_match_from, HookFn, HookMap, MatchState};
use crate::instr::{load_instructions, Instr};
use crate::node::CaptureKind;
use crate::translate::translate;

const DEFAULT_MAX_NESTING_DEPTH: i32 = 100;

/// A compiled regular expression.
///
/// Matching mutates per-match state (captures, repeat counters, the
/// last-match-end position), so the match methods take `&mut self`. Share a
/// pattern across threads by compiling one instance per thread.
///
/// # Examples
///
/// ```
/// use evrex::api::Regex;
///
/// let mut re = Regex::new(r"^[Hh]ello!$").unwrap();
/// assert!(re.is_match("Hello!"));
/// assert!(!re.is_match("hello"));
/// ```
pub struct Regex {
    program: Program,
    state: MatchState,
    hooks: HookMap,
    instructions: Vec<Instr>,
}

impl std::fmt::Debug for Regex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regex")
            .field("program", &self.program)
            .field("state", &self.state)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("instructions", &self.instructions)
            .finish()
    }
}

impl Regex {
    /// Compiles a pattern with default settings.
    pub fn new(pattern: &str) -> Result<Regex, CompileError> {
        Regex::builder(pattern).build()
    }

    /// A [`RegexBuilder`] for fine-grained control: nesting depth, code
    /// hooks, a preset last-match-end.
    pub fn builder(pattern: &str) -> RegexBuilder {
        RegexBuilder::new(pattern)
    }

    /// Re-assembles an automaton from a previously produced instruction
    /// stream, skipping the translation phase.
    ///
    /// ```
    /// use evrex::api::Regex;
    ///
    /// let re = Regex::new(r"ab+").unwrap();
    /// let mut reloaded = Regex::from_instructions(re.instructions().to_vec()).unwrap();
    /// assert!(reloaded.is_match("abbb"));
    /// ```
    pub fn from_instructions(instructions: Vec<Instr>) -> Result<Regex, CompileError> {
        if instructions.is_empty() {
            return Err(CompileError::EmptyPattern);
        }
        let program = assemble(&instructions)?;
        let state = MatchState::new(&program);
        Ok(Regex { program, state, hooks: HashMap::new(), instructions })
    }

    /// Loads an instruction stream saved with
    /// [`crate::instr::save_instructions`] and re-assembles it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Regex, CompileError> {
        let instructions = load_instructions(path).map_err(|_| CompileError::EmptyPattern)?;
        Regex::from_instructions(instructions)
    }

    /// The postfix instruction stream this automaton was assembled from.
    pub fn instructions(&self) -> &[Instr] {
        &self.instructions
    }

    /// Registers a `(?{name})` hook after construction. This is how a
    /// stream-loaded automaton gets its hooks back.
    pub fn register_hook<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut Cursor<'_>) + 'static,
    {
        self.hooks.insert(name.to_string(), Box::new(func) as HookFn);
    }

    /// Whether the pattern matches `text` starting at its beginning.
    pub fn is_match(&mut self, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        run_match(&self.program, &mut self.state, &self.hooks, &chars)
    }

    /// Matches from `offset` onward; on success returns the matched
    /// substring.
    ///
    /// ```
    /// use evrex::api::Regex;
    ///
    /// let mut re = Regex::new(r"b+").unwrap();
    /// assert_eq!(re.match_from("abbbc", 1), Some("bbb".to_string()));
    /// assert_eq!(re.match_from("abbbc", 0), None);
    /// ```
    pub fn match_from(&mut self, text: &str, offset: usize) -> Option<String> {
        let chars: Vec<char> = text.chars().collect();
        run_match_from(&self.program, &mut self.state, &self.hooks, &chars, offset)
    }

    /// Every non-overlapping match across `text`, in order.
    ///
    /// ```
    /// use evrex::api::Regex;
    ///
    /// let mut re = Regex::new(r"[0-9]+").unwrap();
    /// assert_eq!(re.find_all("a12b345c6"), vec!["12", "345", "6"]);
    /// ```
    pub fn find_all(&mut self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        run_match_all(&self.program, &mut self.state, &self.hooks, &chars)
    }

    /// A numbered capture's text and success flag. Indices start at 1;
    /// returns `None` for an unknown index or a collection record.
    ///
    /// ```
    /// use evrex::api::Regex;
    ///
    /// let mut re = Regex::new(r"([a-z]+)\s+\1").unwrap();
    /// assert!(re.is_match("the the"));
    /// assert_eq!(re.capture(1), Some(("the", true)));
    /// ```
    pub fn capture(&self, index: usize) -> Option<(&str, bool)> {
        let id = self.numbered_id(index)?;
        self.capture_by_id(id)
    }

    /// A named capture's text and success flag.
    pub fn capture_named(&self, name: &str) -> Option<(&str, bool)> {
        let id = *self.program.names.get(name)?;
        self.capture_by_id(id)
    }

    /// A numbered capture collection's entries and success flag.
    pub fn capture_collection(&self, index: usize) -> Option<(&[String], bool)> {
        let id = self.numbered_id(index)?;
        self.collection_by_id(id)
    }

    /// A named capture collection's entries and success flag.
    pub fn capture_collection_named(&self, name: &str) -> Option<(&[String], bool)> {
        let id = *self.program.names.get(name)?;
        self.collection_by_id(id)
    }

    /// Sets a numbered capture ahead of a match. Pairs with the manual
    /// capture declarations (`(?$...)`), which the automatic pre-match
    /// reset leaves alone. Returns false for an unknown index.
    pub fn preset_capture(&mut self, index: usize, value: &str) -> bool {
        match self.numbered_id(index) {
            Some(id) => {
                let kind = self.program.caps[id].kind;
                self.state.caps[id].set(kind, value.to_string(), true);
                true
            }
            None => false,
        }
    }

    /// Sets a named capture ahead of a match.
    pub fn preset_capture_named(&mut self, name: &str, value: &str) -> bool {
        match self.program.names.get(name).copied() {
            Some(id) => {
                let kind = self.program.caps[id].kind;
                self.state.caps[id].set(kind, value.to_string(), true);
                true
            }
            None => false,
        }
    }

    /// Clears a numbered capture. Returns false for an unknown index.
    pub fn reset_capture(&mut self, index: usize) -> bool {
        match self.numbered_id(index) {
            Some(id) => {
                let initial = self.program.caps[id].initial;
                self.state.caps[id].reset(initial);
                true
            }
            None => false,
        }
    }

    /// Clears a named capture.
    pub fn reset_capture_named(&mut self, name: &str) -> bool {
        match self.program.names.get(name).copied() {
            Some(id) => {
                let initial = self.program.caps[id].initial;
                self.state.caps[id].reset(initial);
                true
            }
            None => false,
        }
    }

    /// Errors raised by the most recent match attempt.
    pub fn runtime_errors(&self) -> &[RuntimeError] {
        &self.state.runtime_errors
    }

    /// Offset of the final character of the previous find-all match, which
    /// is what a `\G` anchor gates on.
    pub fn last_match_end(&self) -> Option<usize> {
        match self.state.last_match_end {
            Some(pos) if pos >= 0 => Some(pos as usize),
            _ => None,
        }
    }

    pub fn set_last_match_end(&mut self, pos: usize) {
        self.state.last_match_end = Some(pos as isize);
    }

    fn numbered_id(&self, index: usize) -> Option<usize> {
        if index < 1 {
            return None;
        }
        self.program.numbered.get(index - 1).copied()
    }

    fn capture_by_id(&self, id: usize) -> Option<(&str, bool)> {
        if self.program.caps[id].kind != CaptureKind::Single {
            return None;
        }
        let slot = &self.state.caps[id];
        Some((slot.single.as_str(), slot.succeeded))
    }

    fn collection_by_id(&self, id: usize) -> Option<(&[String], bool)> {
        if self.program.caps[id].kind != CaptureKind::Collection {
            return None;
        }
        let slot = &self.state.caps[id];
        Some((slot.collection.as_slice(), slot.succeeded))
    }
}

/// Compilation options for [`Regex`].
///
/// ```
/// use evrex::api::Regex;
///
/// let mut re = Regex::builder(r"(a(?R)?b)")
///     .max_nesting_depth(32)
///     .build()
///     .unwrap();
/// assert!(re.is_match("aabb"));
/// ```
pub struct RegexBuilder {
    pattern: String,
    max_nesting_depth: i32,
    hooks: HookMap,
    preset_last_match_end: Option<usize>,
}

impl RegexBuilder {
    pub fn new(pattern: &str) -> RegexBuilder {
        RegexBuilder {
            pattern: pattern.to_string(),
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            hooks: HashMap::new(),
            preset_last_match_end: None,
        }
    }

    /// Caps class/group nesting at translation time and recursion or
    /// subroutine depth at match time. Defaults to 100.
    pub fn max_nesting_depth(mut self, depth: i32) -> RegexBuilder {
        self.max_nesting_depth = depth;
        self
    }

    /// Registers the function behind a `(?{name})` node. An unregistered
    /// name matches as a zero-width no-op.
    pub fn hook<F>(mut self, name: &str, func: F) -> RegexBuilder
    where
        F: Fn(&mut Cursor<'_>) + 'static,
    {
        self.hooks.insert(name.to_string(), Box::new(func) as HookFn);
        self
    }

    /// Seeds the last-match-end position consulted by `\G`.
    pub fn last_match_end(mut self, pos: usize) -> RegexBuilder {
        self.preset_last_match_end = Some(pos);
        self
    }

    pub fn build(self) -> Result<Regex, CompileError> {
        let instructions = translate(&self.pattern, self.max_nesting_depth)?;
        if instructions.is_empty() {
            return Err(CompileError::EmptyPattern);
        }
        let program = assemble(&instructions)?;
        let mut state = MatchState::new(&program);
        if let Some(pos) = self.preset_last_match_end {
            state.last_match_end = Some(pos as isize);
        }
        Ok(Regex { program, state, hooks: self.hooks, instructions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_is_compile_error() {
        assert_eq!(Regex::new("").unwrap_err(), CompileError::EmptyPattern);
    }

    #[test]
    fn capture_kind_mismatch_returns_none() {
        let mut re = Regex::new("(?@[a-z])+").unwrap();
        assert!(re.is_match("ab"));
        assert!(re.capture(1).is_none());
        assert!(re.capture_collection(1).is_some());
    }

    #[test]
    fn capture_index_bounds() {
        let mut re = Regex::new("(a)").unwrap();
        assert!(re.is_match("a"));
        assert!(re.capture(0).is_none());
        assert!(re.capture(2).is_none());
        assert_eq!(re.capture(1), Some(("a", true)));
    }

    #[test]
    fn preset_and_reset_manual_capture() {
        let mut re = Regex::new(r"(?$<pre>)\k<pre>").unwrap();
        assert!(re.preset_capture_named("pre", "abc"));
        assert!(re.is_match("abc"));
        assert_eq!(re.capture_named("pre"), Some(("abc", true)));

        assert!(re.reset_capture_named("pre"));
        assert!(!re.is_match("abc"));
    }

    #[test]
    fn manual_capture_survives_reset_between_matches() {
        let mut re = Regex::new(r"(?$<pre>)\k<pre>").unwrap();
        re.preset_capture_named("pre", "ab");
        assert!(re.is_match("ab"));
        // a second match still sees the user-set value
        assert!(re.is_match("ab"));
    }

    #[test]
    fn unknown_preset_targets() {
        let mut re = Regex::new("(a)").unwrap();
        assert!(!re.preset_capture(7, "x"));
        assert!(!re.preset_capture_named("nope", "x"));
        assert!(!re.reset_capture(0));
    }

    #[test]
    fn builder_hook_sees_cursor() {
        use std::cell::Cell;
        use std::rc::Rc;

        let positions = Rc::new(Cell::new(-100));
        let seen = positions.clone();
        let mut re = Regex::builder("ab(?{note})c")
            .hook("note", move |cursor| seen.set(cursor.pos()))
            .build()
            .unwrap();
        assert!(re.is_match("abc"));
        assert_eq!(positions.get(), 2);
    }

    #[test]
    fn hook_registered_after_reload() {
        use std::cell::Cell;
        use std::rc::Rc;

        let re = Regex::new("a(?{tap})b").unwrap();
        let mut reloaded = Regex::from_instructions(re.instructions().to_vec()).unwrap();

        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        reloaded.register_hook("tap", move |_cursor| seen.set(seen.get() + 1));

        assert!(reloaded.is_match("ab"));
        assert!(count.get() >= 1);
    }

    #[test]
    fn last_match_end_tracks_find_all() {
        let mut re = Regex::new("ab").unwrap();
        assert_eq!(re.find_all("abxab"), vec!["ab", "ab"]);
        assert_eq!(re.last_match_end(), Some(4));
    }
}
