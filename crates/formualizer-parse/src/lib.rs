mod hasher;
pub mod parser;
pub mod tokenizer;
pub mod types;

pub use parser::{
    ASTNode, ASTNodeType, BatchParser, ParserError, ReferenceType, TableReference, TableSpecifier,
    normalise_reference, parse, parse_with_dialect,
};
pub use tokenizer::{Token, TokenSubType, TokenType, Tokenizer, TokenizerError};
pub use types::{FormulaDialect, ParsingError};

// Re-export common types
pub use formualizer_common::{ArgKind, CalcError, ErrorKind, Value};
