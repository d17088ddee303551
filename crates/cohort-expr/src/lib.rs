//! # cohort-expr
//!
//! Boolean composition expressions over named cohort searches.
//!
//! A composition names previously registered sub-cohorts ("searches") and
//! combines them with `AND`, `OR`, `NOT` and parentheses:
//!
//! ```rust
//! use cohort_expr::{parse, CompositionExpression};
//!
//! let expr = parse("onArt AND NOT pregnant").unwrap();
//! assert!(expr.uses_complement());
//!
//! let names: Vec<&str> = expr.identifiers().into_iter().collect();
//! assert_eq!(names, vec!["onArt", "pregnant"]);
//! ```
//!
//! This crate only parses and renders expressions. Evaluating them against
//! entity sets (including the universe that `NOT` is relative to) lives in
//! `cohort-engine`.
//!
//! ## Syntax Quick Reference
//!
//! | Operator | Meaning | Example |
//! |----------|---------|---------|
//! | (none) | Named search | `onArt` |
//! | `AND` | Intersection | `onArt AND pregnant` |
//! | `OR` | Union | `onArt OR pregnant` |
//! | `NOT` | Complement within the universe | `NOT pregnant` |
//! | `( )` | Grouping | `(a OR b) AND c` |

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod ast;
mod error;
mod parser;

pub use ast::CompositionExpression;
pub use error::{ExprError, ExprResult};
pub use parser::{parse, MAX_NESTING};
