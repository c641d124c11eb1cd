// evrex - regex engine built on a collapsing graph automaton
//
// Pipeline, in compilation order:
//   cursor.rs     - bidirectional bounds-aware position over the input text
//   charclass.rs  - class symbols (single, range, ligature) and composite classes
//   node.rs       - typed automaton nodes, capture records, repeat tickers
//   chunk.rs      - chunks of nodes joined through ghost connectors; graph arena
//   instr.rs      - postfix instruction stream and its text wire format
//   translate.rs  - infix pattern -> postfix instruction stream
//   assemble.rs   - postfix instruction stream -> graph automaton
//   exec.rs       - graph traversal against input; per-match state
//   error.rs      - compile-time and match-time error types
//   api.rs        - Regex / RegexBuilder public surface

pub mod api;
pub mod assemble;
pub mod charclass;
pub mod chunk;
pub mod cursor;
pub mod error;
pub mod exec;
pub mod instr;
pub mod node;
pub mod prelude;
pub mod translate;
