//! Command text analysis
//!
//! Only what the cache needs from SQL: which known tables a command touches and
//! whether it writes. See [`extractor`] for the rules.

pub mod extractor;
pub mod lexer;

pub use extractor::{
    classify, extract_table_names, is_write_command, StatementKind, TableNameExtractor,
};
