pub mod analysis;
pub mod classifier;
pub mod config;
pub mod datasource;
pub mod error;
pub mod features;
pub mod normalize;
pub mod observability;
pub mod report;
pub mod rule_document;
pub mod rule_tree;
pub mod session;
pub mod table;
pub mod troubleshooting;

pub use classifier::{classify, Classification, Row, Verdict};
pub use error::{RcaError, Result};
pub use rule_document::RuleDocument;
pub use rule_tree::{RuleNode, RuleParseOptions};
