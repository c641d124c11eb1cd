// charclass.rs - Class symbols and composite character classes.
//
// A symbol is either an inclusive character range (a single character is the
// degenerate range [c, c]) or a ligature: an ordered run of characters that
// must all appear starting at the current position. Classes compose symbols
// with Boolean structure; negation lives on the literal layer only.

use smallvec::SmallVec;

use crate::cursor::Cursor;

pub type SymbolId = usize;
pub type ClassId = usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassSymbol {
    chars: SmallVec<[char; 2]>,
    ligature: bool,
}

impl ClassSymbol {
    pub fn single(c: char) -> ClassSymbol {
        ClassSymbol { chars: SmallVec::from_slice(&[c, c]), ligature: false }
    }

    pub fn range(lo: char, hi: char) -> ClassSymbol {
        ClassSymbol { chars: SmallVec::from_slice(&[lo, hi]), ligature: false }
    }

    pub fn ligature(chars: &[char]) -> ClassSymbol {
        ClassSymbol { chars: SmallVec::from_slice(chars), ligature: true }
    }

    /// Range symbols test the character under the cursor without moving it.
    /// A ligature walks forward over its full run; on success the cursor is
    /// left on the run's final character, on failure it is untouched.
    pub fn matches(&self, input: &mut Cursor<'_>, fold_case: bool) -> bool {
        let fold = |c: char| if fold_case { c.to_ascii_lowercase() } else { c };

        if !self.ligature {
            let Some(c) = input.get() else { return false };
            return fold(self.chars[0]) <= fold(c) && fold(c) <= fold(self.chars[1]);
        }

        let mut next = *input;
        let mut ind = 0;
        while !next.is_end() && ind < self.chars.len() {
            let Some(c) = next.get() else { return false };
            if fold(c) != fold(self.chars[ind]) {
                return false;
            }
            next.advance();
            ind += 1;
        }

        if ind < self.chars.len() {
            return false;
        }

        next.retreat();
        *input = next;
        true
    }
}

#[derive(Clone, Debug)]
pub enum CharClass {
    Literal { symbols: Vec<SymbolId>, negate: bool, fold_case: bool },
    Union { lhs: ClassId, rhs: ClassId },
    Subtract { lhs: ClassId, rhs: ClassId },
    Intersect { lhs: ClassId, rhs: ClassId },
}

/// The automaton's symbol and class tables. Classes reference symbols and
/// other classes by index, which is how the translator de-duplicates
/// repeated spellings across the pattern.
#[derive(Clone, Debug, Default)]
pub struct ClassSet {
    pub symbols: Vec<ClassSymbol>,
    pub classes: Vec<CharClass>,
}

impl ClassSet {
    pub fn matches(&self, id: ClassId, input: &mut Cursor<'_>) -> bool {
        match &self.classes[id] {
            CharClass::Literal { symbols, negate, fold_case } => {
                let mut hit = false;
                for &sym in symbols {
                    if self.symbols[sym].matches(input, *fold_case) {
                        hit = true;
                        break;
                    }
                }
                hit != *negate
            }
            CharClass::Union { lhs, rhs } => {
                self.matches(*lhs, input) || self.matches(*rhs, input)
            }
            CharClass::Subtract { lhs, rhs } => {
                self.matches(*lhs, input) && !self.matches(*rhs, input)
            }
            CharClass::Intersect { lhs, rhs } => {
                self.matches(*lhs, input) && self.matches(*rhs, input)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_over(text: &[char]) -> Cursor<'_> {
        Cursor::new(text)
    }

    #[test]
    fn single_and_range() {
        let text: Vec<char> = "m".chars().collect();
        let mut c = cursor_over(&text);
        assert!(ClassSymbol::single('m').matches(&mut c, false));
        assert!(!ClassSymbol::single('n').matches(&mut c, false));
        assert!(ClassSymbol::range('a', 'z').matches(&mut c, false));
        assert!(!ClassSymbol::range('A', 'Z').matches(&mut c, false));
        assert_eq!(c.pos(), 0);
    }

    #[test]
    fn range_case_folded() {
        let text: Vec<char> = "M".chars().collect();
        let mut c = cursor_over(&text);
        assert!(!ClassSymbol::range('a', 'z').matches(&mut c, false));
        assert!(ClassSymbol::range('a', 'z').matches(&mut c, true));
    }

    #[test]
    fn ligature_advances_on_success_only() {
        let text: Vec<char> = "chat".chars().collect();
        let lig = ClassSymbol::ligature(&['c', 'h']);

        let mut c = cursor_over(&text);
        assert!(lig.matches(&mut c, false));
        // left on the final matched character
        assert_eq!(c.get(), Some('h'));

        let text2: Vec<char> = "cat".chars().collect();
        let mut c2 = cursor_over(&text2);
        assert!(!lig.matches(&mut c2, false));
        assert_eq!(c2.pos(), 0);
    }

    #[test]
    fn ligature_truncated_by_end() {
        let text: Vec<char> = "c".chars().collect();
        let lig = ClassSymbol::ligature(&['c', 'h']);
        let mut c = cursor_over(&text);
        assert!(!lig.matches(&mut c, false));
    }

    fn set_with(symbols: Vec<ClassSymbol>, classes: Vec<CharClass>) -> ClassSet {
        ClassSet { symbols, classes }
    }

    #[test]
    fn literal_class_negation() {
        let set = set_with(
            vec![ClassSymbol::range('0', '9')],
            vec![
                CharClass::Literal { symbols: vec![0], negate: false, fold_case: false },
                CharClass::Literal { symbols: vec![0], negate: true, fold_case: false },
            ],
        );
        let text: Vec<char> = "7".chars().collect();
        let mut c = cursor_over(&text);
        assert!(set.matches(0, &mut c));
        assert!(!set.matches(1, &mut c));
    }

    #[test]
    fn boolean_composition() {
        // lhs = [a-z], rhs = [m], union/subtract/intersect over them
        let set = set_with(
            vec![ClassSymbol::range('a', 'z'), ClassSymbol::single('m')],
            vec![
                CharClass::Literal { symbols: vec![0], negate: false, fold_case: false },
                CharClass::Literal { symbols: vec![1], negate: false, fold_case: false },
                CharClass::Union { lhs: 0, rhs: 1 },
                CharClass::Subtract { lhs: 0, rhs: 1 },
                CharClass::Intersect { lhs: 0, rhs: 1 },
            ],
        );
        let m: Vec<char> = "m".chars().collect();
        let k: Vec<char> = "k".chars().collect();

        let mut cm = cursor_over(&m);
        let mut ck = cursor_over(&k);

        assert!(set.matches(2, &mut cm));
        assert!(set.matches(2, &mut ck));

        assert!(!set.matches(3, &mut cm)); // m subtracted away
        assert!(set.matches(3, &mut ck));

        assert!(set.matches(4, &mut cm));
        assert!(!set.matches(4, &mut ck));
    }
}
