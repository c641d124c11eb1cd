// syntax_test.rs - Surface-syntax coverage, construct by construct.

use evrex::api::Regex;
use evrex::error::CompileError;

fn accepts(pattern: &str, text: &str) {
    let mut re = Regex::new(pattern)
        .unwrap_or_else(|e| panic!("compile failed for {:?}: {}", pattern, e));
    assert!(
        re.is_match(text),
        "expected {:?} to match {:?}",
        pattern,
        text
    );
}

fn rejects(pattern: &str, text: &str) {
    let mut re = Regex::new(pattern)
        .unwrap_or_else(|e| panic!("compile failed for {:?}: {}", pattern, e));
    assert!(
        !re.is_match(text),
        "expected {:?} not to match {:?}",
        pattern,
        text
    );
}

// === Literals and escapes ===

#[test]
fn plain_literals() {
    accepts("abc", "abc");
    rejects("abc", "abd");
}

#[test]
fn escaped_metacharacters() {
    accepts(r"a\.b", "a.b");
    rejects(r"a\.b", "axb");
    accepts(r"a\*b", "a*b");
    accepts(r"\(x\)", "(x)");
}

#[test]
fn verbatim_run() {
    accepts(r"\Qa+b?\E", "a+b?");
    rejects(r"\Qa+b?\E", "aab");
}

// === Shorthand classes ===

#[test]
fn digit_shorthands() {
    accepts(r"\d\d", "42");
    rejects(r"\d", "x");
    accepts(r"\D", "x");
    rejects(r"\D", "4");
}

#[test]
fn word_and_space_shorthands() {
    accepts(r"\w", "a");
    accepts(r"\w", "_");
    rejects(r"\w", "-");
    accepts(r"\s", " ");
    accepts(r"\s", "\t");
    rejects(r"\S", " ");
    accepts(r"\h", "\t");
    rejects(r"\h", "\n");
    accepts(r"\v", "\n");
    rejects(r"\v", " ");
}

#[test]
fn case_shorthands() {
    accepts(r"\l", "q");
    rejects(r"\l", "Q");
    accepts(r"\u", "Q");
    rejects(r"\u", "q");
}

#[test]
fn line_break_shorthand_spans_crlf() {
    // \R consumes a CR-LF pair as one unit
    accepts(r"a\Rb", "a\r\nb");
    accepts(r"a\Rb", "a\nb");
    rejects(r"a\Rb", "a b");
}

// === Character classes ===

#[test]
fn ranges_and_negation() {
    accepts("[a-f]", "c");
    rejects("[a-f]", "g");
    accepts("[^a-f]", "g");
    rejects("[^a-f]", "c");
}

#[test]
fn multi_symbol_class() {
    accepts("[A-Za-z0-9_]", "Z");
    accepts("[A-Za-z0-9_]", "_");
    rejects("[A-Za-z0-9_]", "-");
}

#[test]
fn class_union_subtract_intersect() {
    accepts(r"[a-c\d]", "2");
    accepts(r"[a-c\d]", "b");
    rejects(r"[a-c\d]", "z");

    accepts("[a-z-[aeiou]]", "t");
    rejects("[a-z-[aeiou]]", "e");

    accepts("[a-z&&[aeiou]]", "e");
    rejects("[a-z&&[aeiou]]", "t");
}

#[test]
fn class_with_shorthand_inside() {
    accepts(r"[\dx]", "7");
    accepts(r"[\dx]", "x");
    rejects(r"[\dx]", "y");
}

#[test]
fn ligature_inside_class() {
    accepts("[.ch.]ip", "chip");
    rejects("[.ch.]ip", "cip");
    accepts("[x.ch.]ip", "xip");
}

#[test]
fn escaped_bracket_inside_class() {
    accepts(r"[\]]", "]");
    accepts(r"[\[]", "[");
}

// === Anchors and boundaries ===

#[test]
fn exclusive_anchors() {
    accepts(r"\Aab\z", "ab");
    rejects(r"\Aab\z", "abc");
}

#[test]
fn end_before_final_break() {
    accepts("abc\\Z", "abc\n");
    accepts("abc\\Z", "abc");
    rejects("abc\\Z", "abcx");
}

#[test]
fn word_boundaries() {
    accepts(r"cat\b", "cat");
    accepts(r"cat\b", "cat! x");
    rejects(r"cat\b", "catss");
    accepts(r"cat\B", "catss");
}

#[test]
fn mid_pattern_caret_and_dollar_are_literals() {
    accepts("a^b", "a^b");
    accepts("a$b", "a$b");
}

// === Dot and modifiers ===

#[test]
fn dot_excludes_line_breaks_by_default() {
    accepts("a.b", "axb");
    rejects("a.b", "a\nb");
    rejects("a.b", "a\rb");
}

#[test]
fn dot_all_modifier() {
    accepts("(?a)a.b", "a\nb");
}

#[test]
fn unix_lines_modifier() {
    // only \n counts as a line break, so . accepts \r
    accepts("(?d)a.b", "a\rb");
    rejects("(?d)a.b", "a\nb");
}

#[test]
fn case_modifier_on_off() {
    accepts("(?i)abc", "ABC");
    accepts("(?i)a(?-i)bc", "Abc");
    rejects("(?i)a(?-i)bc", "ABC");
}

#[test]
fn scoped_modifier_group() {
    accepts("(?i:ab)c", "ABc");
    rejects("(?i:ab)c", "abC");
}

#[test]
fn unknown_modifier_is_rejected() {
    assert_eq!(Regex::new("(?x)a").unwrap_err(), CompileError::InvalidModifier('x'));
}

// === Groups ===

#[test]
fn non_capturing_group() {
    accepts("(?:ab)+c", "ababc");
    let mut re = Regex::new("(?:ab)+c").unwrap();
    assert!(re.is_match("abc"));
    assert!(re.capture(1).is_none());
}

#[test]
fn no_auto_capture_modifier() {
    let mut re = Regex::new("(?n)(ab)c").unwrap();
    assert!(re.is_match("abc"));
    assert!(re.capture(1).is_none());
}

#[test]
fn quoted_named_group() {
    let mut re = Regex::new(r"(?'tag'[a-z]+)=\k'tag'").unwrap();
    assert!(re.is_match("key=key"));
    assert!(!re.is_match("key=val"));
    assert_eq!(re.capture_named("tag"), Some(("key", true)));
}

#[test]
fn branch_reset_shares_capture_slots() {
    let mut re = Regex::new("(?|a(x)|b(y))z").unwrap();
    assert!(re.is_match("byz"));
    assert_eq!(re.capture(1), Some(("y", true)));
    assert!(re.is_match("axz"));
    assert_eq!(re.capture(1), Some(("x", true)));
}

// === Alternation ===

#[test]
fn alternation_and_nesting() {
    accepts("cat|dog|cow", "cow");
    rejects("cat|dog|cow", "hen");
    accepts("(?:aa|ab)c", "abc");
}

#[test]
fn shared_prefix_branches_collapse_cleanly() {
    accepts("abc|abd", "abc");
    accepts("abc|abd", "abd");
    rejects("abc|abd", "abe");
}

// === Quantifiers ===

#[test]
fn quantifier_matrix() {
    accepts("ab?c", "ac");
    accepts("ab?c", "abc");
    rejects("ab?c", "abbc");

    accepts("ab*c", "ac");
    accepts("ab*c", "abbbc");

    accepts("ab+c", "abc");
    rejects("ab+c", "ac");

    accepts("a{3}", "aaa");
    accepts("a{2,}", "aaaaa");
    rejects("a{2,}", "a");
}

#[test]
fn repeat_errors() {
    assert_eq!(Regex::new("a{2").unwrap_err(), CompileError::InvalidRepeat);
    assert_eq!(Regex::new("a{2,").unwrap_err(), CompileError::InvalidRepeat);
}

#[test]
fn brace_without_digits_is_a_literal() {
    accepts("a{x", "a{x");
}

// === Look-around ===

#[test]
fn lookahead_holds_at_a_position() {
    accepts("(?=h)ello", "hello");
    rejects("(?=x)ello", "hello");
    accepts("(?!x)ello", "hello");
    rejects("(?!h)ello", "hello");
}

#[test]
fn lookbehind_walks_backwards() {
    let mut re = Regex::new("(?<=ab)c").unwrap();
    assert_eq!(re.match_from("abc", 2), Some("c".to_string()));
    assert_eq!(re.match_from("xbc", 2), None);

    let mut neg = Regex::new("(?<!a)c").unwrap();
    assert_eq!(neg.match_from("xc", 1), Some("c".to_string()));
    assert_eq!(neg.match_from("ac", 1), None);
}

// === References ===

#[test]
fn backref_spellings() {
    accepts(r"(ab)\1", "abab");
    accepts(r"(ab)\k<1>", "abab");
    accepts(r"(ab)\k{1}", "abab");
    rejects(r"(ab)\1", "abxy");
}

#[test]
fn relative_and_forward_references() {
    accepts(r"(a)(b)\k<-1>", "abb");
    rejects(r"(a)(b)\k<-1>", "aba");
    accepts(r"(a)(b)\k<-2>", "aba");
}

#[test]
fn malformed_references() {
    assert_eq!(Regex::new(r"(a)\k<*>").unwrap_err(), CompileError::MalformedBackref);
    assert!(matches!(
        Regex::new(r"\k<-1>").unwrap_err(),
        CompileError::UnknownGroup(_)
    ));
}

// === Conditionals ===

#[test]
fn conditional_condition_spellings() {
    accepts("(x)(?({1})y|n)", "xy");
    accepts("(x)(?('1')y|n)", "xy");
    accepts("(?<f>x)(?(<f>)y|n)", "xy");
}

#[test]
fn conditional_without_else() {
    accepts("(x)(?(1)y)", "xy");
    rejects("(x)(?(1)y)", "xz");
}

#[test]
fn conditional_branch_limit() {
    assert_eq!(
        Regex::new("(?(1)a|b|c)").unwrap_err(),
        CompileError::TooManyBranches
    );
}

// === Nesting cap ===

#[test]
fn nesting_limit_applies_to_groups_and_classes() {
    assert_eq!(
        Regex::builder("((((a))))").max_nesting_depth(3).build().unwrap_err(),
        CompileError::NestingLimit
    );
    assert!(Regex::builder("((((a))))").max_nesting_depth(12).build().is_ok());
}
