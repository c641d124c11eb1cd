// translate.rs - Recursive-descent translation of infix patterns into the
// postfix instruction stream.
//
// The walk is imperative over a char slice with explicit positions, one
// munch function per construct. Two index tables de-duplicate class-symbol
// and class spellings so repeated expressions are emitted once and
// referenced by number. Modifier state is copied into sub-parses by value,
// which is what gives modifiers their lexical scoping; the capture-group
// counter, by contrast, is threaded through every descent so numbering is
// global and declaration-ordered.

use std::collections::HashMap;

use log::debug;

use crate::error::CompileError;
use crate::instr::{Instr, Opcode};

type TResult<T> = Result<T, CompileError>;

// ============================================================================
// Translation state
// ============================================================================

#[derive(Default)]
struct IndexTracker {
    next: usize,
    indices: HashMap<String, usize>,
}

impl IndexTracker {
    fn get(&self, key: &str) -> Option<usize> {
        self.indices.get(key).copied()
    }

    fn register(&mut self, key: String) -> usize {
        let ind = self.next;
        self.indices.insert(key, ind);
        self.next += 1;
        ind
    }
}

#[derive(Clone, Copy, Default)]
struct Modifiers {
    case_insensitive: bool, // (?i) / (?c)
    dot_all: bool,          // (?a)
    single_line: bool,      // (?s) / (?m)
    no_auto_cap: bool,      // (?n)
    unix_lines: bool,       // (?d)
    lazy_groups: bool,      // (?l)
}

impl Modifiers {
    fn lazy_arg(&self) -> &'static str {
        if self.lazy_groups {
            "t"
        } else {
            "f"
        }
    }

    fn ci_arg(&self) -> &'static str {
        if self.case_insensitive {
            "t"
        } else {
            "f"
        }
    }

    /// Applies one flag letter; `on` is false inside a `(?-...)` run.
    /// Returns false for an unknown letter.
    fn apply(&mut self, flag: char, on: bool) -> bool {
        match flag {
            'i' => self.case_insensitive = on,
            'c' => self.case_insensitive = !on,
            's' => self.single_line = on,
            'm' => self.single_line = !on,
            'n' => self.no_auto_cap = on,
            'd' => self.unix_lines = on,
            'l' => self.lazy_groups = on,
            'a' => self.dot_all = on,
            '^' => {
                self.case_insensitive = !on;
                self.single_line = !on;
                self.no_auto_cap = !on;
                self.unix_lines = !on;
                self.lazy_groups = !on;
                self.dot_all = !on;
            }
            _ => return false,
        }
        true
    }
}

struct Translator {
    symbols: IndexTracker,
    classes: IndexTracker,
    /// Capture groups declared so far; threaded through every descent.
    group_count: u32,
    /// Depth cap stamped into recursion and subroutine instructions.
    max_depth: i32,
    /// Index of the symbol-less always-true class, once one exists. Empty
    /// group bodies compile to a single node over it.
    empty_class: Option<String>,
}

// ============================================================================
// Entry point
// ============================================================================

/// Translates a pattern into postfix instructions for the assembler.
pub fn translate(pattern: &str, max_nesting_depth: i32) -> TResult<Vec<Instr>> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tr = Translator {
        symbols: IndexTracker::default(),
        classes: IndexTracker::default(),
        group_count: 0,
        max_depth: max_nesting_depth,
        empty_class: None,
    };
    let mut pos = 0;
    let out = tr.subpattern(&chars, &mut pos, chars.len(), Modifiers::default(), max_nesting_depth)?;
    debug!("translated {} chars into {} instructions", chars.len(), out.len());
    Ok(out)
}

// ============================================================================
// Helpers
// ============================================================================

/// Advances `pos` to the closing bracket matching the one it sits on,
/// honoring nesting and backslash escapes. Characters in between (nested
/// brackets included, the final close excluded) are appended to `output`.
/// Leaves `pos` on the close, or at `end` when unbalanced.
fn find_close(
    chars: &[char],
    pos: &mut usize,
    end: usize,
    open: char,
    close: char,
    mut output: Option<&mut String>,
) {
    let mut depth = 0;
    loop {
        *pos += 1;
        if *pos >= end {
            return;
        }
        let c = chars[*pos];
        let escaped = *pos > 0 && chars[*pos - 1] == '\\';
        if c == open && !escaped {
            depth += 1;
        } else if c == close && !escaped {
            if depth == 0 {
                return;
            }
            depth -= 1;
        }
        if let Some(out) = output.as_deref_mut() {
            out.push(c);
        }
    }
}

fn span(chars: &[char], start: usize, end: usize) -> String {
    chars[start..end.min(chars.len())].iter().collect()
}

/// The bracketed-class spelling behind a one-letter shorthand, or `None`
/// when the letter is not a shorthand. Upper-case letters negate.
fn expand_shorthand(c: char) -> Option<String> {
    let body = match c.to_ascii_lowercase() {
        'l' => "a-z",
        'u' => "A-Z",
        'd' => "0-9",
        'w' => "A-Za-z0-9_",
        's' => " \t\r\n\u{b}\u{c}",
        'h' => " \t",
        'v' => "\r\n\u{b}\u{c}",
        'n' => "\n",
        // line break: the CR-LF ligature plus the vertical-whitespace singles
        'r' => ".\r\n.\r\n\u{b}\u{c}",
        _ => return None,
    };
    let mut out = String::new();
    if c.is_ascii_uppercase() {
        out.push('^');
    }
    out.push_str(body);
    Some(out)
}

impl Translator {
    // ========================================================================
    // Symbols and classes
    // ========================================================================

    /// Emits (or re-uses) one class symbol starting at `pos` inside a class
    /// body: a dotted ligature run, a range, or a single character. Leaves
    /// `pos` on the symbol's final character and returns its index as text.
    fn munch_symbol(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
    ) -> TResult<String> {
        if chars[*pos] == '.' {
            // potential ligature: ".ch."
            let mut close = *pos + 1;
            while close < end && chars[close] != '.' {
                close += 1;
            }
            if close < end && close > *pos + 1 {
                let key = span(chars, *pos, close + 1);
                if let Some(found) = self.symbols.get(&key) {
                    *pos = close;
                    return Ok(found.to_string());
                }

                let pieces: Vec<String> =
                    chars[*pos + 1..close].iter().map(|c| c.to_string()).collect();
                *pos = close;
                out.push(Instr::with_args(Opcode::MakeClassLigatureSymbol, pieces));
                return Ok(self.symbols.register(key).to_string());
            }
        }

        let is_range = *pos + 2 < end
            && chars[*pos + 1] == '-'
            && chars[*pos + 2] != '['
            && chars[*pos + 2] != '\\';
        if is_range {
            let (lo, hi) = (chars[*pos], chars[*pos + 2]);
            let key = format!("{}-{}", lo, hi);
            if let Some(found) = self.symbols.get(&key) {
                *pos += 2;
                return Ok(found.to_string());
            }
            if lo >= hi {
                return Err(CompileError::InvalidRange { lo, hi });
            }
            *pos += 2;
            out.push(Instr::with_args(Opcode::MakeClassSymbol, [lo.to_string(), hi.to_string()]));
            return Ok(self.symbols.register(key).to_string());
        }

        let c = chars[*pos];
        let key = c.to_string();
        if let Some(found) = self.symbols.get(&key) {
            return Ok(found.to_string());
        }
        out.push(Instr::with_args(Opcode::MakeClassSymbol, [key.clone(), key.clone()]));
        Ok(self.symbols.register(key).to_string())
    }

    /// Emits a single-character literal atom: a one-symbol class plus a
    /// `Literal` instruction referencing it.
    fn munch_literal(&mut self, c: char, out: &mut Vec<Instr>, modifs: &Modifiers) {
        let class_key = c.to_string();
        if let Some(found) = self.classes.get(&class_key) {
            out.push(Instr::with_args(Opcode::Literal, [found.to_string()]));
            return;
        }

        let sym_ind = match self.symbols.get(&class_key) {
            Some(found) => found,
            None => {
                out.push(Instr::with_args(
                    Opcode::MakeClassSymbol,
                    [class_key.clone(), class_key.clone()],
                ));
                self.symbols.register(class_key.clone())
            }
        };

        out.push(Instr::with_args(
            Opcode::MakeLiteralClass,
            ["f".to_string(), modifs.ci_arg().to_string(), sym_ind.to_string()],
        ));
        let class_ind = self.classes.register(class_key);
        out.push(Instr::with_args(Opcode::Literal, [class_ind.to_string()]));
    }

    /// Translates a class body (the text between brackets) into class
    /// instructions and returns the resulting class index as text. Splits
    /// the body into union/subtract/intersect pieces first; a piece with no
    /// set operators is scanned symbol by symbol.
    fn munch_class(
        &mut self,
        chars: &[char],
        start: usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<String> {
        if depth <= 0 {
            return Err(CompileError::NestingLimit);
        }

        let full_name = span(chars, start, end);
        if let Some(found) = self.classes.get(&full_name) {
            return Ok(found.to_string());
        }

        let mut ops: Vec<Opcode> = Vec::new();
        let mut pieces: Vec<String> = Vec::new();
        let mut stragglers = String::new();

        // flushes pending loose symbols as a union piece
        fn flush(stragglers: &mut String, pieces: &mut Vec<String>, ops: &mut Vec<Opcode>) {
            if !stragglers.is_empty() {
                pieces.push(std::mem::take(stragglers));
                if pieces.len() > 1 {
                    ops.push(Opcode::MakeUnionClass);
                }
            }
        }

        let mut pos = start;
        while pos < end {
            match chars[pos] {
                '\\' => {
                    pos += 1;
                    if pos >= end {
                        break;
                    }
                    if chars[pos] == 'Q' {
                        // verbatim run until \E
                        loop {
                            pos += 1;
                            if pos >= end {
                                break;
                            }
                            if chars[pos] == '\\' && pos + 1 < end && chars[pos + 1] == 'E' {
                                pos += 1;
                                break;
                            }
                            if chars[pos] == '[' || chars[pos] == ']' {
                                stragglers.push('\\');
                            }
                            stragglers.push(chars[pos]);
                        }
                    } else if let Some(short) = expand_shorthand(chars[pos]) {
                        if stragglers.is_empty() && pieces.is_empty() {
                            stragglers = short;
                        } else {
                            flush(&mut stragglers, &mut pieces, &mut ops);
                            pieces.push(short);
                            ops.push(Opcode::MakeUnionClass);
                        }
                    } else {
                        stragglers.push('\\');
                        stragglers.push(chars[pos]);
                    }
                }
                '&' => {
                    if pos + 2 < end && chars[pos + 1] == '&' && chars[pos + 2] == '[' {
                        if stragglers.is_empty() && pieces.is_empty() {
                            return Err(CompileError::MalformedClassSet);
                        }
                        flush(&mut stragglers, &mut pieces, &mut ops);
                        pos += 2;
                        let mut sub = String::new();
                        find_close(chars, &mut pos, end, '[', ']', Some(&mut sub));
                        pieces.push(sub);
                        ops.push(Opcode::MakeIntersectClass);
                    } else if pos + 1 < end && chars[pos + 1] == '&' {
                        stragglers.push('&');
                        stragglers.push('&');
                        pos += 1;
                    } else {
                        stragglers.push('&');
                    }
                }
                '-' => {
                    if pos + 1 < end && chars[pos + 1] == '[' {
                        if stragglers.is_empty() && pieces.is_empty() {
                            return Err(CompileError::MalformedClassSet);
                        }
                        flush(&mut stragglers, &mut pieces, &mut ops);
                        pos += 1;
                        let mut sub = String::new();
                        find_close(chars, &mut pos, end, '[', ']', Some(&mut sub));
                        pieces.push(sub);
                        ops.push(Opcode::MakeSubtractClass);
                    } else {
                        stragglers.push('-');
                    }
                }
                '[' => {
                    if stragglers.is_empty() && pieces.is_empty() {
                        pieces.push(String::new());
                        let mut sub = String::new();
                        find_close(chars, &mut pos, end, '[', ']', Some(&mut sub));
                        pieces.push(sub);
                        ops.push(Opcode::MakeLiteralClass);
                    } else {
                        flush(&mut stragglers, &mut pieces, &mut ops);
                        let mut sub = String::new();
                        find_close(chars, &mut pos, end, '[', ']', Some(&mut sub));
                        pieces.push(sub);
                        ops.push(Opcode::MakeUnionClass);
                    }
                }
                c => stragglers.push(c),
            }
            pos += 1;
        }

        if !ops.is_empty() {
            // composite: resolve each piece recursively, then fold
            let mut rolling_ind: String;
            let mut rolling_name: String;
            if pieces[0].is_empty() {
                let sub: Vec<char> = pieces[1].chars().collect();
                rolling_ind = self.munch_class(&sub, 0, sub.len(), out, modifs, depth - 1)?;
                rolling_name = pieces[1].clone();
            } else {
                let lhs_chars: Vec<char> = pieces[0].chars().collect();
                let lhs = self.munch_class(&lhs_chars, 0, lhs_chars.len(), out, modifs, depth - 1)?;
                let rhs_chars: Vec<char> = pieces[1].chars().collect();
                let rhs = self.munch_class(&rhs_chars, 0, rhs_chars.len(), out, modifs, depth - 1)?;

                out.push(Instr::with_args(ops[0], [lhs, rhs]));
                rolling_name = format!("{}{}", pieces[0], pieces[1]);
                rolling_ind = self.classes.register(rolling_name.clone()).to_string();
            }

            for ind in 2..pieces.len() {
                let rhs_chars: Vec<char> = pieces[ind].chars().collect();
                let rhs = self.munch_class(&rhs_chars, 0, rhs_chars.len(), out, modifs, depth - 1)?;
                out.push(Instr::with_args(ops[ind - 1], [rolling_ind.clone(), rhs]));
                rolling_name.push_str(&pieces[ind]);
                rolling_ind = self.classes.register(rolling_name.clone()).to_string();
            }

            return Ok(rolling_ind);
        }

        if stragglers.is_empty() {
            return Err(CompileError::EmptyClass);
        }

        // plain symbol run, possibly negated
        let strag: Vec<char> = stragglers.chars().collect();
        let mut args: Vec<String> = Vec::new();
        let mut spos = 0;
        if strag[0] == '^' {
            args.push("t".to_string());
            spos = 1;
        } else {
            args.push("f".to_string());
        }
        args.push(modifs.ci_arg().to_string());

        while spos < strag.len() {
            if strag[spos] == '\\' {
                spos += 1;
                if spos >= strag.len() {
                    break;
                }
            }
            args.push(self.munch_symbol(&strag, &mut spos, strag.len(), out)?);
            spos += 1;
        }

        out.push(Instr::with_args(Opcode::MakeLiteralClass, args));
        Ok(self.classes.register(full_name).to_string())
    }

    /// Class from a fixed spelling (line delimiters, word characters, dot
    /// classes), re-using the table entry when one exists.
    fn class_from_text(
        &mut self,
        text: &str,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<String> {
        let chars: Vec<char> = text.chars().collect();
        self.munch_class(&chars, 0, chars.len(), out, modifs, depth)
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Numbered, named, relative (`-N`), and forward (`+N`) back-references.
    /// `pos` is left at the first character past the reference text.
    fn munch_backref(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
    ) -> TResult<()> {
        if *pos >= end {
            return Err(CompileError::MalformedBackref);
        }

        let mut sign = 0i32;
        let mut named = false;
        if !chars[*pos].is_ascii_digit() {
            match chars[*pos] {
                '-' => {
                    *pos += 1;
                    sign = -1;
                }
                '+' => {
                    *pos += 1;
                    sign = 1;
                }
                c if c.is_ascii_alphabetic() => named = true,
                _ => return Err(CompileError::MalformedBackref),
            }
            if sign != 0 && (*pos >= end || !chars[*pos].is_ascii_digit()) {
                return Err(CompileError::MalformedBackref);
            }
        }

        let start = *pos;
        while *pos < end && (named || chars[*pos].is_ascii_digit()) {
            *pos += 1;
        }
        let munch = span(chars, start, *pos);
        if munch.is_empty() {
            return Err(CompileError::MalformedBackref);
        }

        if named {
            out.push(Instr::with_args(Opcode::BackrefNamed, [munch]));
            return Ok(());
        }

        let n: i64 = munch.parse().map_err(|_| CompileError::MalformedBackref)?;
        let target = match sign {
            1 => n + self.group_count as i64,
            -1 => self.group_count as i64 + 1 - n,
            _ => n,
        };
        if target <= 0 {
            return Err(CompileError::UnknownGroup(target.to_string()));
        }
        out.push(Instr::with_args(Opcode::BackrefNumbered, [target.to_string()]));
        Ok(())
    }

    /// Numbered, named, relative, and forward subroutine calls, plus whole-
    /// pattern recursion (`R` / `0`).
    fn munch_subroutine(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
    ) -> TResult<()> {
        if *pos >= end {
            return Err(CompileError::MalformedSubroutine);
        }

        if chars[*pos] == 'R' || chars[*pos] == '0' {
            out.push(Instr::with_args(
                Opcode::Recursion,
                [self.max_depth.to_string(), modifs.lazy_arg().to_string()],
            ));
            *pos += 1;
            return Ok(());
        }

        let mut sign = 0i32;
        let mut named = false;
        if !chars[*pos].is_ascii_digit() {
            match chars[*pos] {
                '-' => {
                    *pos += 1;
                    sign = -1;
                }
                '+' => {
                    *pos += 1;
                    sign = 1;
                }
                c if c.is_ascii_alphabetic() => named = true,
                _ => return Err(CompileError::MalformedSubroutine),
            }
            if sign != 0 && (*pos >= end || !chars[*pos].is_ascii_digit()) {
                return Err(CompileError::MalformedSubroutine);
            }
        }

        let start = *pos;
        while *pos < end && (named || chars[*pos].is_ascii_digit()) {
            *pos += 1;
        }
        let munch = span(chars, start, *pos);
        if munch.is_empty() {
            return Err(CompileError::MalformedSubroutine);
        }

        if named {
            out.push(Instr::with_args(
                Opcode::SubroutineNamed,
                [munch, self.max_depth.to_string()],
            ));
            return Ok(());
        }

        let n: i64 = munch.parse().map_err(|_| CompileError::MalformedSubroutine)?;
        let target = match sign {
            1 => n + self.group_count as i64,
            -1 => self.group_count as i64 + 1 - n,
            _ => n,
        };
        if target <= 0 {
            return Err(CompileError::UnknownGroup(target.to_string()));
        }
        out.push(Instr::with_args(
            Opcode::SubroutineNumbered,
            [target.to_string(), self.max_depth.to_string()],
        ));
        Ok(())
    }

    // ========================================================================
    // Escapes
    // ========================================================================

    /// Everything introduced by a backslash: anchors, word boundaries,
    /// verbatim runs, references, shorthands, escaped metacharacters.
    /// On entry `pos` sits on the backslash; on exit it sits on the last
    /// consumed character.
    fn munch_escaped(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<()> {
        *pos += 1;
        if *pos >= end {
            return Err(CompileError::MalformedBackref);
        }

        match chars[*pos] {
            'A' => {
                let ind = self.class_from_text("\r\n\u{b}\u{c}", out, modifs, depth - 1)?;
                out.push(Instr::with_args(Opcode::StartCheck, ["t".to_string(), "f".to_string(), ind]));
            }
            'z' => {
                let ind = self.class_from_text("\r\n\u{b}\u{c}", out, modifs, depth - 1)?;
                out.push(Instr::with_args(Opcode::EndCheck, ["t".to_string(), "f".to_string(), ind]));
            }
            'Z' => {
                let ind = self.class_from_text("\r\n\u{b}\u{c}", out, modifs, depth - 1)?;
                out.push(Instr::with_args(Opcode::EndCheck, ["t".to_string(), "t".to_string(), ind]));
            }
            'G' => {
                let ind = self.class_from_text("\r\n\u{b}\u{c}", out, modifs, depth - 1)?;
                out.push(Instr::with_args(Opcode::StartCheck, ["t".to_string(), "t".to_string(), ind]));
            }
            'b' => {
                let ind = self.class_from_text("A-Za-z0-9_", out, modifs, depth - 1)?;
                out.push(Instr::with_args(Opcode::WordBoundary, ["f".to_string(), ind]));
            }
            'B' => {
                let ind = self.class_from_text("A-Za-z0-9_", out, modifs, depth - 1)?;
                out.push(Instr::with_args(Opcode::WordBoundary, ["t".to_string(), ind]));
            }
            'Q' => {
                // verbatim run: every character a literal until \E
                let mut lits = 0;
                loop {
                    *pos += 1;
                    if *pos >= end {
                        break;
                    }
                    if chars[*pos] == '\\' && *pos + 1 < end && chars[*pos + 1] == 'E' {
                        *pos += 1;
                        break;
                    }
                    self.munch_literal(chars[*pos], out, modifs);
                    lits += 1;
                    if lits > 1 {
                        out.push(Instr::new(Opcode::Concat));
                    }
                }
            }
            'k' | 'g' => {
                let is_backref = chars[*pos] == 'k';
                if *pos + 1 < end && matches!(chars[*pos + 1], '<' | '\'' | '{') {
                    *pos += 1;
                    let close = match chars[*pos] {
                        '<' => '>',
                        '\'' => '\'',
                        _ => '}',
                    };
                    let mut scan = *pos;
                    loop {
                        scan += 1;
                        if scan >= end || chars[scan] == close {
                            break;
                        }
                    }
                    if scan >= end {
                        return Err(if is_backref {
                            CompileError::MalformedBackref
                        } else {
                            CompileError::MalformedSubroutine
                        });
                    }
                    *pos += 1;
                    if is_backref {
                        self.munch_backref(chars, pos, scan, out)?;
                    } else {
                        self.munch_subroutine(chars, pos, scan, out, modifs)?;
                    }
                    *pos = scan;
                } else {
                    self.munch_literal(chars[*pos], out, modifs);
                }
            }
            c if c.is_ascii_digit() => {
                self.munch_backref(chars, pos, end, out)?;
                *pos -= 1;
            }
            c => {
                if let Some(short) = expand_shorthand(c) {
                    let ind = match self.classes.get(&short) {
                        Some(found) => found.to_string(),
                        None => self.class_from_text(&short, out, modifs, depth)?,
                    };
                    out.push(Instr::with_args(Opcode::Literal, [ind]));
                } else {
                    self.munch_literal(c, out, modifs);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Reverses the atoms of a group body so a look-behind can be matched
    /// with a backwards-walking cursor. Escape pairs, classes, and whole
    /// sub-groups travel as units.
    fn reverse_group(chars: &[char], pos: &mut usize, end: usize) -> Vec<char> {
        let mut munch: Vec<char> = Vec::new();
        loop {
            *pos += 1;
            if *pos >= end {
                break;
            }
            let c = chars[*pos];
            if c == '\\' {
                if *pos + 1 < end {
                    munch.insert(0, c);
                    munch.insert(1, chars[*pos + 1]);
                    *pos += 1;
                } else {
                    munch.insert(0, c);
                }
                continue;
            }
            if c == '[' || c == '(' {
                let close = if c == '[' { ']' } else { ')' };
                let mut sub = vec![c];
                let mut scan = *pos;
                loop {
                    scan += 1;
                    if scan >= end {
                        break;
                    }
                    if chars[scan] == close && chars[scan - 1] != '\\' {
                        break;
                    }
                    sub.push(chars[scan]);
                }
                if scan < end {
                    sub.push(chars[scan]);
                }
                munch.splice(0..0, sub);
                *pos = scan;
                continue;
            }
            munch.insert(0, c);
        }
        munch
    }

    /// Splits conditional arm text at the top-level `|`, stripping the
    /// parentheses around each arm the way the assembler expects bare arm
    /// bodies. Errs when more than two arms appear.
    fn split_conditional_arms(
        chars: &[char],
        pos: &mut usize,
        end: usize,
    ) -> TResult<(String, String)> {
        let mut first = String::new();
        let mut second = String::new();
        let mut depth = 0;
        loop {
            *pos += 1;
            if *pos >= end {
                break;
            }
            match chars[*pos] {
                '|' if depth == 0 => {
                    if !first.is_empty() {
                        return Err(CompileError::TooManyBranches);
                    }
                    first = std::mem::take(&mut second);
                }
                '(' => depth += 1,
                ')' => depth -= 1,
                c => second.push(c),
            }
        }
        if first.is_empty() {
            first = std::mem::take(&mut second);
        }
        Ok((first, second))
    }

    /// Emits the then/else arms plus the final `Conditional` instruction.
    /// The condition instruction(s) must already be on the stream.
    fn finish_conditional(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<()> {
        let (then_text, else_text) = Self::split_conditional_arms(chars, pos, end)?;

        let then_chars: Vec<char> = then_text.chars().collect();
        let then_set = self.subparse_atom(&then_chars, *modifs, depth - 1)?;
        out.extend(then_set);
        out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));

        if !else_text.is_empty() {
            let else_chars: Vec<char> = else_text.chars().collect();
            let else_set = self.subparse_atom(&else_chars, *modifs, depth - 1)?;
            out.extend(else_set);
            out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));
            out.push(Instr::with_args(
                Opcode::Conditional,
                ["2".to_string(), modifs.lazy_arg().to_string()],
            ));
        } else {
            out.push(Instr::with_args(
                Opcode::Conditional,
                ["1".to_string(), modifs.lazy_arg().to_string()],
            ));
        }
        Ok(())
    }

    /// Translates a sub-parse over owned text, starting at its beginning.
    fn subparse(&mut self, text: &[char], modifs: Modifiers, depth: i32) -> TResult<Vec<Instr>> {
        let mut pos = 0;
        self.subpattern(text, &mut pos, text.len(), modifs, depth)
    }

    /// Like `subparse`, but an empty result becomes a single always-true
    /// atom so the group instruction that follows has a body to pop.
    fn subparse_atom(&mut self, text: &[char], modifs: Modifiers, depth: i32) -> TResult<Vec<Instr>> {
        let mut set = self.subparse(text, modifs, depth)?;
        if set.is_empty() {
            self.push_empty_atom(&mut set);
        }
        Ok(set)
    }

    /// A negated class over no symbols matches at every position.
    fn push_empty_atom(&mut self, out: &mut Vec<Instr>) {
        let ind = match &self.empty_class {
            Some(ind) => ind.clone(),
            None => {
                out.push(Instr::with_args(Opcode::MakeLiteralClass, ["t", "f"]));
                let ind = self.classes.register("\u{0}<empty>".to_string()).to_string();
                self.empty_class = Some(ind.clone());
                ind
            }
        };
        out.push(Instr::with_args(Opcode::Literal, [ind]));
    }

    /// A group's content: `pos` sits on the first character after `(`, and
    /// `end` is the position of the matching `)`. Modifier mutations made by
    /// bare inline modifier groups propagate to the caller's remainder
    /// through `modifs`.
    fn munch_group(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &mut Modifiers,
        depth: i32,
    ) -> TResult<()> {
        if depth <= 0 {
            return Err(CompileError::NestingLimit);
        }

        if *pos >= end || chars[*pos] != '?' {
            // plain capture group ("()" included: its body is the empty atom)
            let body = chars[(*pos).min(end)..end].to_vec();
            if !modifs.no_auto_cap {
                self.group_count += 1;
                let num = self.group_count;
                out.push(Instr::with_args(Opcode::MakeCapture, ["f"]));
                let body_set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(body_set);
                out.push(Instr::with_args(
                    Opcode::CaptureGroupNumbered,
                    [num.to_string(), modifs.lazy_arg().to_string()],
                ));
            } else {
                let body_set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(body_set);
                out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));
            }
            *pos = end;
            return Ok(());
        }

        *pos += 1;
        if *pos >= end {
            return Err(CompileError::UnterminatedGroup);
        }

        match chars[*pos] {
            '|' => self.munch_branch_reset(chars, pos, end, out, modifs, depth),
            '=' => {
                let body = chars[*pos + 1..end].to_vec();
                *pos = end;
                let set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(set);
                out.push(Instr::with_args(
                    Opcode::LookAhead,
                    ["f".to_string(), modifs.lazy_arg().to_string()],
                ));
                Ok(())
            }
            '!' => {
                let body = chars[*pos + 1..end].to_vec();
                *pos = end;
                let set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(set);
                out.push(Instr::with_args(
                    Opcode::LookAhead,
                    ["t".to_string(), modifs.lazy_arg().to_string()],
                ));
                Ok(())
            }
            ':' => {
                let body = chars[*pos + 1..end].to_vec();
                *pos = end;
                let set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(set);
                out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));
                Ok(())
            }
            '<' => self.munch_angle_group(chars, pos, end, out, modifs, depth),
            '\'' => self.munch_quoted_capture(chars, pos, end, out, modifs, depth),
            '(' => self.munch_conditional(chars, pos, end, out, modifs, depth),
            '@' => self.munch_collection_group(chars, pos, end, out, modifs, depth),
            '{' => {
                // code hook
                let mut name = String::new();
                loop {
                    *pos += 1;
                    if *pos >= end || chars[*pos] == '}' {
                        break;
                    }
                    name.push(chars[*pos]);
                }
                if *pos >= end {
                    return Err(CompileError::UnterminatedGroup);
                }
                out.push(Instr::with_args(Opcode::CodeHook, [name]));
                Ok(())
            }
            '$' => self.munch_manual_capture(chars, pos, end, out),
            _ => self.munch_modifiers_or_call(chars, pos, end, out, modifs, depth),
        }
    }

    /// `(?<=...)`, `(?<!...)`, `(?<name>...)`, and the `(?<name>)` call form.
    fn munch_angle_group(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<()> {
        *pos += 1;
        if *pos >= end {
            return Err(CompileError::UnterminatedGroup);
        }
        match chars[*pos] {
            '=' | '!' => {
                let negated = chars[*pos] == '!';
                let body = Self::reverse_group(chars, pos, end);
                let set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(set);
                out.push(Instr::with_args(
                    Opcode::LookBehind,
                    [if negated { "t" } else { "f" }.to_string(), modifs.lazy_arg().to_string()],
                ));
                Ok(())
            }
            _ => {
                let mut name = String::new();
                while *pos < end && chars[*pos] != '>' {
                    name.push(chars[*pos]);
                    *pos += 1;
                }
                if *pos >= end {
                    return Err(CompileError::UnterminatedGroup);
                }
                if *pos + 1 == end {
                    // "(?<name>)" - a named subroutine call
                    out.push(Instr::with_args(
                        Opcode::SubroutineNamed,
                        [name, self.max_depth.to_string()],
                    ));
                    *pos = end;
                    return Ok(());
                }

                self.group_count += 1;
                out.push(Instr::with_args(Opcode::MakeCapture, ["f".to_string(), name.clone()]));
                let body = chars[*pos + 1..end].to_vec();
                *pos = end;
                let set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(set);
                out.push(Instr::with_args(
                    Opcode::CaptureGroupNamed,
                    [name, modifs.lazy_arg().to_string()],
                ));
                Ok(())
            }
        }
    }

    /// `(?'name'...)` and the `(?'name')` call form.
    fn munch_quoted_capture(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<()> {
        *pos += 1;
        let mut name = String::new();
        while *pos < end && chars[*pos] != '\'' {
            name.push(chars[*pos]);
            *pos += 1;
        }
        if *pos >= end {
            return Err(CompileError::UnterminatedGroup);
        }
        if *pos + 1 == end {
            out.push(Instr::with_args(
                Opcode::SubroutineNamed,
                [name, self.max_depth.to_string()],
            ));
            *pos = end;
            return Ok(());
        }

        self.group_count += 1;
        out.push(Instr::with_args(Opcode::MakeCapture, ["f".to_string(), name.clone()]));
        let body = chars[*pos + 1..end].to_vec();
        *pos = end;
        let set = self.subparse_atom(&body, *modifs, depth - 1)?;
        out.extend(set);
        out.push(Instr::with_args(Opcode::CaptureGroupNamed, [name, modifs.lazy_arg().to_string()]));
        Ok(())
    }

    /// `(?@...)`, `(?@<name>...)`, `(?@'name'...)` - capture collections.
    fn munch_collection_group(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<()> {
        *pos += 1;
        if *pos < end && matches!(chars[*pos], '<' | '\'') {
            let close = if chars[*pos] == '<' { '>' } else { '\'' };
            let mut name = String::new();
            loop {
                *pos += 1;
                if *pos >= end || chars[*pos] == close {
                    break;
                }
                name.push(chars[*pos]);
            }
            if *pos >= end {
                return Err(CompileError::UnterminatedGroup);
            }

            self.group_count += 1;
            out.push(Instr::with_args(
                Opcode::MakeCaptureCollection,
                ["f".to_string(), name.clone()],
            ));
            let body = chars[*pos + 1..end].to_vec();
            *pos = end;
            let set = self.subparse_atom(&body, *modifs, depth - 1)?;
            out.extend(set);
            out.push(Instr::with_args(
                Opcode::CaptureGroupNamed,
                [name, modifs.lazy_arg().to_string()],
            ));
            return Ok(());
        }

        let body = chars[*pos..end].to_vec();
        *pos = end;
        if !modifs.no_auto_cap {
            self.group_count += 1;
            let num = self.group_count;
            out.push(Instr::with_args(Opcode::MakeCaptureCollection, ["f"]));
            let set = self.subparse_atom(&body, *modifs, depth - 1)?;
            out.extend(set);
            out.push(Instr::with_args(
                Opcode::CaptureGroupNumbered,
                [num.to_string(), modifs.lazy_arg().to_string()],
            ));
        } else {
            let set = self.subparse_atom(&body, *modifs, depth - 1)?;
            out.extend(set);
            out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));
        }
        Ok(())
    }

    /// `(?$)`, `(?$@)`, `(?$<name>)`, `(?$'name')`, `(?$@<name>)` - manual
    /// capture declarations, set by the caller rather than by matching.
    fn munch_manual_capture(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
    ) -> TResult<()> {
        *pos += 1;
        let op = if *pos < end && chars[*pos] == '@' {
            *pos += 1;
            Opcode::MakeCaptureCollection
        } else {
            Opcode::MakeCapture
        };

        if *pos < end && matches!(chars[*pos], '<' | '\'') {
            let close = if chars[*pos] == '<' { '>' } else { '\'' };
            let mut name = String::new();
            loop {
                *pos += 1;
                if *pos >= end || chars[*pos] == close {
                    break;
                }
                name.push(chars[*pos]);
            }
            if *pos >= end {
                return Err(CompileError::UnterminatedGroup);
            }
            self.group_count += 1;
            out.push(Instr::with_args(op, ["t".to_string(), name]));
            *pos = end;
        } else {
            self.group_count += 1;
            out.push(Instr::with_args(op, ["t"]));
            *pos = end;
        }
        Ok(())
    }

    /// `(?|...)` - branch reset: every branch numbers its captures from the
    /// same base, and branches share capture records positionally.
    fn munch_branch_reset(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<()> {
        let mut branches: Vec<Vec<char>> = vec![Vec::new()];
        let mut nest = 0;
        loop {
            *pos += 1;
            if *pos >= end {
                break;
            }
            match chars[*pos] {
                '|' if nest == 0 => branches.push(Vec::new()),
                c => {
                    if c == '(' {
                        nest += 1;
                    } else if c == ')' {
                        nest -= 1;
                    }
                    if let Some(branch) = branches.last_mut() {
                        branch.push(c);
                    }
                }
            }
        }

        let base = self.group_count;
        let mut max_count = base;
        let mut alt_count = branches.len() as i32 - 1;
        // positions in `out` of the shared capture declarations
        let mut shared: Vec<usize> = Vec::new();

        for branch in branches {
            self.group_count = base;
            let set = self.subparse(&branch, *modifs, depth - 1)?;
            if set.is_empty() {
                alt_count -= 1;
                continue;
            }

            let mut curr_cap = 0;
            for instr in set {
                if matches!(instr.op, Opcode::MakeCapture | Opcode::MakeCaptureCollection) {
                    if curr_cap >= shared.len() {
                        out.push(instr);
                        shared.push(out.len() - 1);
                    } else {
                        let slot = shared[curr_cap];
                        if instr.op == Opcode::MakeCaptureCollection {
                            out[slot].op = Opcode::MakeCaptureCollection;
                        }
                        let names = instr.args.into_iter().skip(1);
                        out[slot].args.extend(names);
                    }
                    curr_cap += 1;
                } else {
                    out.push(instr);
                }
            }
            max_count = max_count.max(self.group_count);
        }

        self.group_count = max_count;
        while alt_count > 0 {
            out.push(Instr::new(Opcode::Alternate));
            alt_count -= 1;
        }
        out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));
        Ok(())
    }

    /// `(?(cond)...)` - conditionals in all four condition spellings, plus
    /// `(?(DEFINE)...)` subroutine definitions.
    fn munch_conditional(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &mut Modifiers,
        depth: i32,
    ) -> TResult<()> {
        *pos += 1;
        if *pos >= end {
            return Err(CompileError::MalformedConditional);
        }

        match chars[*pos] {
            '<' | '\'' | '{' => {
                let close = match chars[*pos] {
                    '<' => '>',
                    '\'' => '\'',
                    _ => '}',
                };
                let mut name = String::new();
                loop {
                    *pos += 1;
                    if *pos >= end || chars[*pos] == close {
                        break;
                    }
                    name.push(chars[*pos]);
                }
                if *pos >= end {
                    return Err(CompileError::MalformedConditional);
                }
                *pos += 1;
                if *pos >= end || chars[*pos] != ')' {
                    return Err(CompileError::MalformedConditional);
                }

                let name_chars: Vec<char> = name.chars().collect();
                let mut npos = 0;
                self.munch_backref(&name_chars, &mut npos, name_chars.len(), out)?;
                self.finish_conditional(chars, pos, end, out, modifs, depth)
            }
            '-' | '+' => {
                let mut edge = *pos;
                while edge < end && chars[edge] != ')' {
                    edge += 1;
                }
                if edge >= end {
                    return Err(CompileError::MalformedConditional);
                }
                self.munch_backref(chars, pos, edge, out)?;
                *pos = edge;
                self.finish_conditional(chars, pos, end, out, modifs, depth)
            }
            c if c.is_ascii_digit() => {
                let mut edge = *pos;
                while edge < end && chars[edge] != ')' {
                    edge += 1;
                }
                if edge >= end {
                    return Err(CompileError::MalformedConditional);
                }
                self.munch_backref(chars, pos, edge, out)?;
                *pos = edge;
                self.finish_conditional(chars, pos, end, out, modifs, depth)
            }
            _ => {
                let mut cond = String::new();
                cond.push(chars[*pos]);
                find_close(chars, pos, end, '(', ')', Some(&mut cond));

                if cond == "DEFINE" {
                    self.munch_define(chars, pos, end, out, modifs, depth)
                } else {
                    let cond_full = if cond.starts_with('(') || cond.starts_with('?') {
                        cond
                    } else {
                        format!("?:{}", cond)
                    };
                    let cond_chars: Vec<char> = cond_full.chars().collect();
                    let mut cpos = 0;
                    let mut inner_modifs = *modifs;
                    self.munch_group(
                        &cond_chars,
                        &mut cpos,
                        cond_chars.len(),
                        out,
                        &mut inner_modifs,
                        depth - 1,
                    )?;
                    self.finish_conditional(chars, pos, end, out, modifs, depth)
                }
            }
        }
    }

    /// `(?(DEFINE)(?<name>...))` - a body reachable only via subroutine.
    fn munch_define(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &Modifiers,
        depth: i32,
    ) -> TResult<()> {
        *pos += 1;
        if *pos >= end || chars[*pos] != '(' {
            return Err(CompileError::MalformedSubroutine);
        }
        *pos += 1;
        if *pos >= end || chars[*pos] != '?' {
            return Err(CompileError::MalformedSubroutine);
        }
        *pos += 1;
        if *pos >= end || !matches!(chars[*pos], '<' | '\'' | '{') {
            return Err(CompileError::MalformedSubroutine);
        }
        let close = match chars[*pos] {
            '<' => '>',
            '\'' => '\'',
            _ => '}',
        };
        let mut name = String::new();
        loop {
            *pos += 1;
            if *pos >= end || chars[*pos] == close {
                break;
            }
            name.push(chars[*pos]);
        }
        if *pos >= end {
            return Err(CompileError::MalformedSubroutine);
        }

        let mut body = String::new();
        find_close(chars, pos, end, '(', ')', Some(&mut body));
        if *pos >= end {
            return Err(CompileError::MalformedSubroutine);
        }
        *pos += 1;

        let body_chars: Vec<char> = body.chars().collect();
        let set = self.subparse_atom(&body_chars, *modifs, depth - 1)?;
        out.extend(set);
        out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));
        out.push(Instr::with_args(Opcode::DefineAsSubroutine, [name]));
        Ok(())
    }

    /// The `(?...` tail cases: inline modifier runs (bare or scoped with
    /// `:`), subroutine calls, and recursion.
    fn munch_modifiers_or_call(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
        modifs: &mut Modifiers,
        depth: i32,
    ) -> TResult<()> {
        let c = chars[*pos];

        let modifier_run = (c.is_ascii_alphabetic() && c != 'R') || c == '^';
        let removal_run = c == '-' && !(*pos + 1 < end && chars[*pos + 1].is_ascii_digit());

        if modifier_run || removal_run {
            let on = !removal_run;
            let mut scan = *pos;
            if removal_run {
                scan += 1;
            }
            let saved = *modifs;
            let mut stopped = false;
            while scan < end {
                if !modifs.apply(chars[scan], on) {
                    stopped = true;
                    break;
                }
                scan += 1;
            }

            if stopped && scan != *pos && chars[scan] == ':' {
                // scoped modifier group
                let body = chars[scan + 1..end].to_vec();
                *pos = end;
                let set = self.subparse_atom(&body, *modifs, depth - 1)?;
                out.extend(set);
                out.push(Instr::with_args(Opcode::NonCaptureGroup, [modifs.lazy_arg()]));
                *modifs = saved;
                return Ok(());
            }
            if stopped {
                return Err(CompileError::InvalidModifier(chars[scan]));
            }
            // bare inline modifiers apply to the remainder of the enclosing
            // subpattern
            *pos = end;
            return Ok(());
        }

        self.munch_subroutine(chars, pos, end, out, modifs)
    }

    // ========================================================================
    // Quantifiers
    // ========================================================================

    /// `?`, `*`, `+`, `{N}`, `{N,}`, `{N,M}`, each with an optional trailing
    /// `?` for laziness. `pos` sits on the operator; on exit it sits on the
    /// last consumed character.
    fn munch_op(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        out: &mut Vec<Instr>,
    ) -> TResult<()> {
        let op = chars[*pos];

        let mut lazy = false;
        if op != '{' {
            if *pos + 1 < end && chars[*pos + 1] == '?' {
                lazy = true;
                *pos += 1;
            }
        }

        match op {
            '?' => {
                out.push(Instr::new(if lazy { Opcode::NoneOrOnceLazy } else { Opcode::NoneOrOnce }));
            }
            '*' => {
                out.push(Instr::new(if lazy { Opcode::NoneOrMoreLazy } else { Opcode::NoneOrMore }));
            }
            '+' => {
                out.push(Instr::new(if lazy { Opcode::OncePlusLazy } else { Opcode::OncePlus }));
            }
            '{' => {
                let digits = |chars: &[char], pos: &mut usize| -> String {
                    let start = *pos;
                    while *pos < end && chars[*pos].is_ascii_digit() {
                        *pos += 1;
                    }
                    span(chars, start, *pos)
                };

                let mut scan = *pos + 1;
                if scan >= end || !chars[scan].is_ascii_digit() {
                    return Err(CompileError::InvalidRepeat);
                }

                let min = digits(chars, &mut scan);
                let (kind, max) = if scan < end && chars[scan] == ',' {
                    scan += 1;
                    if scan < end && chars[scan].is_ascii_digit() {
                        let max = digits(chars, &mut scan);
                        ("MinMax", max)
                    } else {
                        ("Min", min.clone())
                    }
                } else {
                    ("Exact", min.clone())
                };

                if scan >= end || chars[scan] != '}' {
                    return Err(CompileError::InvalidRepeat);
                }
                *pos = scan;
                if *pos + 1 < end && chars[*pos + 1] == '?' {
                    lazy = true;
                    *pos += 1;
                }

                out.push(Instr::with_args(
                    if lazy { Opcode::RepeatLazy } else { Opcode::Repeat },
                    [kind.to_string(), min, max],
                ));
            }
            _ => return Err(CompileError::InvalidRepeat),
        }
        Ok(())
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Translates `chars[*pos..end]`, emitting explicit `Concat` between
    /// consecutive atoms (but never before a quantifier, which binds to the
    /// preceding atom) and recursing at `|` so a single `Alternate` joins
    /// the halves.
    fn subpattern(
        &mut self,
        chars: &[char],
        pos: &mut usize,
        end: usize,
        mut modifs: Modifiers,
        depth: i32,
    ) -> TResult<Vec<Instr>> {
        let mut out: Vec<Instr> = Vec::new();
        let mut num_nodes = 0;
        let mut prev_num_nodes = 0;

        while *pos < end {
            match chars[*pos] {
                '[' => {
                    let mut close = *pos;
                    find_close(chars, &mut close, end, '[', ']', None);
                    if close >= end {
                        return Err(CompileError::UnterminatedClass);
                    }
                    let ind = self.munch_class(chars, *pos + 1, close, &mut out, &modifs, depth)?;
                    out.push(Instr::with_args(Opcode::Literal, [ind]));
                    *pos = close;
                    num_nodes += 1;
                }
                '\\' => {
                    self.munch_escaped(chars, pos, end, &mut out, &modifs, depth)?;
                    num_nodes += 1;
                }
                '^' => {
                    if !out.is_empty() && *pos != 0 {
                        self.munch_literal('^', &mut out, &modifs);
                    } else {
                        let line = if modifs.unix_lines { "\n" } else { "\r\n\u{b}\u{c}" };
                        let ind = self.class_from_text(line, &mut out, &modifs, depth)?;
                        let exclusive = if modifs.single_line { "t" } else { "f" };
                        out.push(Instr::with_args(
                            Opcode::StartCheck,
                            [exclusive.to_string(), "f".to_string(), ind],
                        ));
                    }
                    num_nodes += 1;
                }
                '$' => {
                    if *pos + 1 != end {
                        self.munch_literal('$', &mut out, &modifs);
                    } else {
                        let line = if modifs.unix_lines { "\n" } else { "\r\n\u{b}\u{c}" };
                        let ind = self.class_from_text(line, &mut out, &modifs, depth)?;
                        let exclusive = if modifs.single_line { "t" } else { "f" };
                        out.push(Instr::with_args(
                            Opcode::EndCheck,
                            [exclusive.to_string(), "f".to_string(), ind],
                        ));
                    }
                    num_nodes += 1;
                }
                '.' => {
                    let ind = if modifs.dot_all {
                        let all = format!("\u{0}-{}", char::MAX);
                        self.class_from_text(&all, &mut out, &modifs, depth)?
                    } else if modifs.unix_lines {
                        self.class_from_text("^\n", &mut out, &modifs, depth)?
                    } else {
                        self.class_from_text("^\r\n\u{b}\u{c}", &mut out, &modifs, depth)?
                    };
                    out.push(Instr::with_args(Opcode::Literal, [ind]));
                    num_nodes += 1;
                }
                '|' => {
                    *pos += 1;
                    let second = self.subpattern(chars, pos, end, modifs, depth)?;
                    if !out.is_empty() && !second.is_empty() {
                        out.extend(second);
                        out.push(Instr::new(Opcode::Alternate));
                    } else {
                        out.extend(second);
                    }
                    return Ok(out);
                }
                '?' | '*' | '+' => {
                    self.munch_op(chars, pos, end, &mut out)?;
                }
                '{' => {
                    // a repeat only when digits follow; otherwise a literal
                    if *pos + 1 < end && chars[*pos + 1].is_ascii_digit() {
                        self.munch_op(chars, pos, end, &mut out)?;
                    } else {
                        self.munch_literal('{', &mut out, &modifs);
                        num_nodes += 1;
                    }
                }
                '(' => {
                    let mut close = *pos;
                    find_close(chars, &mut close, end, '(', ')', None);
                    if close >= end {
                        return Err(CompileError::UnterminatedGroup);
                    }
                    let prior = out.len();
                    *pos += 1;
                    self.munch_group(chars, pos, close, &mut out, &mut modifs, depth)?;
                    *pos = close;
                    let last_makes_node = out.len() > prior
                        && !matches!(
                            out.last().map(|i| i.op),
                            Some(Opcode::MakeCapture)
                                | Some(Opcode::MakeCaptureCollection)
                                | Some(Opcode::DefineAsSubroutine)
                        );
                    if last_makes_node {
                        num_nodes += 1;
                    }
                }
                c => {
                    self.munch_literal(c, &mut out, &modifs);
                    num_nodes += 1;
                }
            }

            let should_concat = {
                let next = *pos + 1;
                if next >= end {
                    true
                } else {
                    let c = chars[next];
                    c != '?'
                        && c != '*'
                        && c != '+'
                        && !(c == '{' && next + 1 < end && chars[next + 1].is_ascii_digit())
                }
            };

            if num_nodes > 1 && num_nodes > prev_num_nodes && should_concat {
                out.push(Instr::new(Opcode::Concat));
                prev_num_nodes = num_nodes;
            }

            *pos += 1;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(pattern: &str) -> Vec<Opcode> {
        translate(pattern, 100).unwrap().iter().map(|i| i.op).collect()
    }

    #[test]
    fn single_literal() {
        assert_eq!(
            ops("a"),
            vec![Opcode::MakeClassSymbol, Opcode::MakeLiteralClass, Opcode::Literal]
        );
    }

    #[test]
    fn two_literals_concat() {
        let o = ops("ab");
        assert_eq!(o.last(), Some(&Opcode::Concat));
        assert_eq!(o.iter().filter(|&&x| x == Opcode::Literal).count(), 2);
    }

    #[test]
    fn duplicate_atoms_reuse_tables() {
        let instrs = translate("aa", 100).unwrap();
        let symbol_makes =
            instrs.iter().filter(|i| i.op == Opcode::MakeClassSymbol).count();
        let class_makes =
            instrs.iter().filter(|i| i.op == Opcode::MakeLiteralClass).count();
        assert_eq!(symbol_makes, 1);
        assert_eq!(class_makes, 1);
    }

    #[test]
    fn quantifier_binds_before_concat() {
        assert_eq!(
            ops("ab*"),
            vec![
                Opcode::MakeClassSymbol,
                Opcode::MakeLiteralClass,
                Opcode::Literal,
                Opcode::MakeClassSymbol,
                Opcode::MakeLiteralClass,
                Opcode::Literal,
                Opcode::NoneOrMore,
                Opcode::Concat,
            ]
        );
    }

    #[test]
    fn lazy_quantifiers() {
        assert_eq!(ops("a??").last(), Some(&Opcode::NoneOrOnceLazy));
        assert_eq!(ops("a*?").last(), Some(&Opcode::NoneOrMoreLazy));
        assert_eq!(ops("a+?").last(), Some(&Opcode::OncePlusLazy));
    }

    #[test]
    fn repeat_forms() {
        let instrs = translate("a{2,4}", 100).unwrap();
        let rep = instrs.iter().find(|i| i.op == Opcode::Repeat).unwrap();
        assert_eq!(rep.args, vec!["MinMax", "2", "4"]);

        let instrs = translate("a{12}", 100).unwrap();
        let rep = instrs.iter().find(|i| i.op == Opcode::Repeat).unwrap();
        assert_eq!(rep.args, vec!["Exact", "12", "12"]);

        let instrs = translate("a{3,}?", 100).unwrap();
        let rep = instrs.iter().find(|i| i.op == Opcode::RepeatLazy).unwrap();
        assert_eq!(rep.args, vec!["Min", "3", "3"]);
    }

    #[test]
    fn alternation_emits_single_alternate() {
        let o = ops("a|b");
        assert_eq!(o.iter().filter(|&&x| x == Opcode::Alternate).count(), 1);
        assert_eq!(o.last(), Some(&Opcode::Alternate));
    }

    #[test]
    fn anchors_positional() {
        let o = ops("^a$");
        assert!(o.contains(&Opcode::StartCheck));
        assert!(o.contains(&Opcode::EndCheck));

        // '^' not first and '$' not last are plain literals
        let o = ops("a^b");
        assert!(!o.contains(&Opcode::StartCheck));
        let o = ops("a$b");
        assert!(!o.contains(&Opcode::EndCheck));
    }

    #[test]
    fn caret_after_alternation_is_anchor() {
        let o = ops("a|^b");
        assert!(o.contains(&Opcode::StartCheck));
    }

    #[test]
    fn capture_groups_number_in_declaration_order() {
        let instrs = translate("((a)b)(c)", 100).unwrap();
        let nums: Vec<&str> = instrs
            .iter()
            .filter(|i| i.op == Opcode::CaptureGroupNumbered)
            .map(|i| i.args[0].as_str())
            .collect();
        // postfix order: innermost closes first
        assert_eq!(nums, vec!["2", "1", "3"]);
        let makes = instrs.iter().filter(|i| i.op == Opcode::MakeCapture).count();
        assert_eq!(makes, 3);
    }

    #[test]
    fn named_group_and_subroutine_call() {
        let instrs = translate(r"(?<word>\w+)\s+\g<word>", 100).unwrap();
        assert!(instrs
            .iter()
            .any(|i| i.op == Opcode::CaptureGroupNamed && i.args[0] == "word"));
        assert!(instrs
            .iter()
            .any(|i| i.op == Opcode::SubroutineNamed && i.args[0] == "word"));
    }

    #[test]
    fn numbered_backref() {
        let instrs = translate(r"(a)\1", 100).unwrap();
        assert!(instrs
            .iter()
            .any(|i| i.op == Opcode::BackrefNumbered && i.args[0] == "1"));
    }

    #[test]
    fn relative_backref_resolves_against_count() {
        let instrs = translate(r"(a)(b)\k<-1>", 100).unwrap();
        assert!(instrs
            .iter()
            .any(|i| i.op == Opcode::BackrefNumbered && i.args[0] == "2"));
    }

    #[test]
    fn relative_backref_past_front_is_error() {
        assert_eq!(
            translate(r"(a)\k<-5>", 100),
            Err(CompileError::UnknownGroup("-3".to_string()))
        );
    }

    #[test]
    fn recursion_emits() {
        let instrs = translate(r"(a(?R)?b)", 64).unwrap();
        let rec = instrs.iter().find(|i| i.op == Opcode::Recursion).unwrap();
        assert_eq!(rec.args[0], "64");
    }

    #[test]
    fn conditional_with_else() {
        let instrs = translate("(?(1)y|n)(x)?", 100).unwrap();
        let cond = instrs.iter().find(|i| i.op == Opcode::Conditional).unwrap();
        assert_eq!(cond.args[0], "2");
        assert!(instrs.iter().any(|i| i.op == Opcode::BackrefNumbered));
    }

    #[test]
    fn conditional_three_branches_rejected() {
        assert_eq!(translate("(?(1)a|b|c)", 100), Err(CompileError::TooManyBranches));
    }

    #[test]
    fn define_block() {
        let instrs = translate("(?(DEFINE)(?<w>abc))x", 100).unwrap();
        let def = instrs.iter().find(|i| i.op == Opcode::DefineAsSubroutine).unwrap();
        assert_eq!(def.args[0], "w");
        // DEFINE consumes no capture number
        assert!(!instrs.iter().any(|i| i.op == Opcode::MakeCapture));
    }

    #[test]
    fn branch_reset_shares_numbers() {
        let instrs = translate("(?|(a)|(b))", 100).unwrap();
        let makes = instrs.iter().filter(|i| i.op == Opcode::MakeCapture).count();
        assert_eq!(makes, 1);
        let nums: Vec<&str> = instrs
            .iter()
            .filter(|i| i.op == Opcode::CaptureGroupNumbered)
            .map(|i| i.args[0].as_str())
            .collect();
        assert_eq!(nums, vec!["1", "1"]);
    }

    #[test]
    fn lookarounds() {
        assert!(ops("(?=a)").contains(&Opcode::LookAhead));
        assert!(ops("(?!a)").contains(&Opcode::LookAhead));
        assert!(ops("(?<=a)").contains(&Opcode::LookBehind));
        assert!(ops("(?<!a)").contains(&Opcode::LookBehind));
    }

    #[test]
    fn lookbehind_body_is_reversed() {
        let instrs = translate("(?<=ab)", 100).unwrap();
        // atoms must come out b-first
        let syms: Vec<&str> = instrs
            .iter()
            .filter(|i| i.op == Opcode::MakeClassSymbol)
            .map(|i| i.args[0].as_str())
            .collect();
        assert_eq!(syms, vec!["b", "a"]);
    }

    #[test]
    fn modifier_scoping_is_lexical() {
        // case-insensitivity from the scoped group must not leak out
        let instrs = translate("(?i:a)a", 100).unwrap();
        let ci_flags: Vec<&str> = instrs
            .iter()
            .filter(|i| i.op == Opcode::MakeLiteralClass)
            .map(|i| i.args[1].as_str())
            .collect();
        assert_eq!(ci_flags, vec!["t", "f"]);
    }

    #[test]
    fn inline_modifier_applies_to_remainder() {
        let instrs = translate("a(?i)b", 100).unwrap();
        let ci_flags: Vec<&str> = instrs
            .iter()
            .filter(|i| i.op == Opcode::MakeLiteralClass)
            .map(|i| i.args[1].as_str())
            .collect();
        assert_eq!(ci_flags, vec!["f", "t"]);
    }

    #[test]
    fn no_auto_cap_modifier() {
        let instrs = translate("(?n)(a)", 100).unwrap();
        assert!(!instrs.iter().any(|i| i.op == Opcode::MakeCapture));
        assert!(instrs.iter().any(|i| i.op == Opcode::NonCaptureGroup));
    }

    #[test]
    fn invalid_modifier_letter() {
        assert_eq!(translate("(?q)a", 100), Err(CompileError::InvalidModifier('q')));
    }

    #[test]
    fn class_errors() {
        assert_eq!(translate("[abc", 100), Err(CompileError::UnterminatedClass));
        assert_eq!(translate("[]", 100), Err(CompileError::EmptyClass));
        assert_eq!(
            translate("[z-a]", 100),
            Err(CompileError::InvalidRange { lo: 'z', hi: 'a' })
        );
    }

    #[test]
    fn group_errors() {
        assert_eq!(translate("(abc", 100), Err(CompileError::UnterminatedGroup));
    }

    #[test]
    fn nesting_limit_honored() {
        assert_eq!(translate("((((a))))", 3), Err(CompileError::NestingLimit));
        assert!(translate("((((a))))", 10).is_ok());
    }

    #[test]
    fn class_set_operations_emit() {
        let o = ops("[a-z-[m]]");
        assert!(o.contains(&Opcode::MakeSubtractClass));
        let o = ops("[a-z&&[aeiou]]");
        assert!(o.contains(&Opcode::MakeIntersectClass));
        let o = ops(r"[a-z\d]");
        assert!(o.contains(&Opcode::MakeUnionClass));
    }

    #[test]
    fn ligature_symbol_in_class() {
        let instrs = translate("[x.ch.y]", 100).unwrap();
        let lig = instrs
            .iter()
            .find(|i| i.op == Opcode::MakeClassLigatureSymbol)
            .unwrap();
        assert_eq!(lig.args, vec!["c", "h"]);
    }

    #[test]
    fn manual_capture_declares_without_matching() {
        let instrs = translate("(?$<pre>)x", 100).unwrap();
        let cap = instrs.iter().find(|i| i.op == Opcode::MakeCapture).unwrap();
        assert_eq!(cap.args, vec!["t", "pre"]);
        assert!(!instrs.iter().any(|i| matches!(
            i.op,
            Opcode::CaptureGroupNumbered | Opcode::CaptureGroupNamed
        )));
    }

    #[test]
    fn code_hook() {
        let instrs = translate("a(?{tap})b", 100).unwrap();
        let hook = instrs.iter().find(|i| i.op == Opcode::CodeHook).unwrap();
        assert_eq!(hook.args[0], "tap");
    }

    #[test]
    fn empty_pattern_translates_to_nothing() {
        assert_eq!(translate("", 100).unwrap(), vec![]);
    }
}
