//! Abstract Syntax Tree types for composition expressions.

use std::collections::BTreeSet;
use std::fmt;

/// A boolean composition over named searches.
///
/// Leaves name sub-cohorts that the caller registers at evaluation time.
/// The tree is built once per composition definition and evaluated fresh
/// against every new set of searches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompositionExpression {
    /// Reference to a named search: `onArt`
    Search(String),
    /// Intersection: `A AND B`
    And(Box<CompositionExpression>, Box<CompositionExpression>),
    /// Union: `A OR B`
    Or(Box<CompositionExpression>, Box<CompositionExpression>),
    /// Complement within the universe: `NOT A`
    Not(Box<CompositionExpression>),
}

impl CompositionExpression {
    /// Creates a search reference leaf.
    pub fn search(name: impl Into<String>) -> Self {
        CompositionExpression::Search(name.into())
    }

    /// Creates `left AND right`.
    pub fn and(left: CompositionExpression, right: CompositionExpression) -> Self {
        CompositionExpression::And(Box::new(left), Box::new(right))
    }

    /// Creates `left OR right`.
    pub fn or(left: CompositionExpression, right: CompositionExpression) -> Self {
        CompositionExpression::Or(Box::new(left), Box::new(right))
    }

    /// Creates `NOT inner`.
    pub fn not(inner: CompositionExpression) -> Self {
        CompositionExpression::Not(Box::new(inner))
    }

    /// Returns every search name referenced by the expression, deduplicated.
    pub fn identifiers(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_identifiers(&mut names);
        names
    }

    fn collect_identifiers<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            CompositionExpression::Search(name) => {
                names.insert(name.as_str());
            }
            CompositionExpression::And(left, right) | CompositionExpression::Or(left, right) => {
                left.collect_identifiers(names);
                right.collect_identifiers(names);
            }
            CompositionExpression::Not(inner) => inner.collect_identifiers(names),
        }
    }

    /// Returns true if the expression contains a `NOT` anywhere.
    ///
    /// Such expressions depend on the universe they are evaluated against.
    pub fn uses_complement(&self) -> bool {
        match self {
            CompositionExpression::Search(_) => false,
            CompositionExpression::And(left, right) | CompositionExpression::Or(left, right) => {
                left.uses_complement() || right.uses_complement()
            }
            CompositionExpression::Not(_) => true,
        }
    }

    /// Nesting depth of the tree (a single leaf has depth 1).
    pub fn depth(&self) -> usize {
        match self {
            CompositionExpression::Search(_) => 1,
            CompositionExpression::And(left, right) | CompositionExpression::Or(left, right) => {
                1 + left.depth().max(right.depth())
            }
            CompositionExpression::Not(inner) => 1 + inner.depth(),
        }
    }

    /// Binding strength used when rendering; higher binds tighter.
    fn precedence(&self) -> u8 {
        match self {
            CompositionExpression::Or(..) => 1,
            CompositionExpression::And(..) => 2,
            CompositionExpression::Not(_) => 3,
            CompositionExpression::Search(_) => 4,
        }
    }

    fn fmt_operand(
        &self,
        f: &mut fmt::Formatter<'_>,
        parenthesize: bool,
    ) -> fmt::Result {
        if parenthesize {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

/// Renders the canonical form: upper-case operators, single spaces and only
/// the parentheses needed to re-parse into the same tree.
impl fmt::Display for CompositionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let own = self.precedence();
        match self {
            CompositionExpression::Search(name) => write!(f, "{}", name),
            CompositionExpression::And(left, right) => {
                left.fmt_operand(f, left.precedence() < own)?;
                write!(f, " AND ")?;
                // Operators are left-associative, so an equal-precedence right
                // operand needs parentheses to keep its shape.
                right.fmt_operand(f, right.precedence() <= own)
            }
            CompositionExpression::Or(left, right) => {
                left.fmt_operand(f, left.precedence() < own)?;
                write!(f, " OR ")?;
                right.fmt_operand(f, right.precedence() <= own)
            }
            CompositionExpression::Not(inner) => {
                write!(f, "NOT ")?;
                inner.fmt_operand(f, inner.precedence() < own)
            }
        }
    }
}
