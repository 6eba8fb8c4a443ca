// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Immutable statement construction.
//!
//! Statements are either raw text ([`Statement::raw`]) or built from typed
//! expression nodes with the `select(..).from(..).filter(..)` combinators.
//! Every combinator returns a new value, so partially built statements can
//! be shared and reused. A built statement resolves to a deterministic
//! canonical text which doubles as the plan-cache key.

mod expression;

use std::fmt::Write;

pub use expression::{BinaryOperator, Expression, Placeholder, ident, lit, named, positional, wildcard};

use crate::error::StatementError;

/// An immutable select statement under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
	projection: Vec<Expression>,
	keyspace: Option<String>,
	predicate: Option<Expression>,
}

/// Begin a select statement with the given projection list.
pub fn select<I>(projection: I) -> Select
where
	I: IntoIterator<Item = Expression>,
{
	Select {
		projection: projection.into_iter().collect(),
		keyspace: None,
		predicate: None,
	}
}

impl Select {
	/// Set the keyspace to select from. Returns a new value.
	pub fn from(&self, keyspace: impl Into<String>) -> Select {
		Select {
			keyspace: Some(keyspace.into()),
			..self.clone()
		}
	}

	/// Set the where predicate. Returns a new value.
	///
	/// Fails immediately if the predicate is a definitely-non-boolean
	/// expression, e.g. a string literal.
	pub fn filter(&self, predicate: Expression) -> Result<Select, StatementError> {
		check_predicate(&predicate)?;
		Ok(Select {
			predicate: Some(predicate),
			..self.clone()
		})
	}

	/// Finish composition, validating the clause structure.
	pub fn build(&self) -> Result<Statement, StatementError> {
		if self.projection.is_empty() {
			return Err(StatementError::EmptyProjection);
		}
		if let Some(keyspace) = &self.keyspace {
			if keyspace.is_empty() {
				return Err(StatementError::EmptyKeyspace);
			}
		}
		if let Some(predicate) = &self.predicate {
			check_predicate(predicate)?;
		}
		for placeholder in self.placeholders() {
			if placeholder == Placeholder::Positional(0) {
				return Err(StatementError::ZeroPositionalPlaceholder);
			}
		}
		Ok(Statement::Select(self.clone()))
	}

	fn render(&self) -> String {
		let mut out = String::from("SELECT ");
		for (i, expression) in self.projection.iter().enumerate() {
			if i > 0 {
				out.push_str(", ");
			}
			let _ = write!(out, "{}", expression);
		}
		if let Some(keyspace) = &self.keyspace {
			out.push_str(" FROM ");
			out.push_str(&expression::escape_identifier(keyspace));
		}
		if let Some(predicate) = &self.predicate {
			let _ = write!(out, " WHERE {}", predicate);
		}
		out
	}

	fn placeholders(&self) -> Vec<Placeholder> {
		let mut out = Vec::new();
		for expression in &self.projection {
			expression.collect_placeholders(&mut out);
		}
		if let Some(predicate) = &self.predicate {
			predicate.collect_placeholders(&mut out);
		}
		out
	}
}

fn check_predicate(predicate: &Expression) -> Result<(), StatementError> {
	use expression::ExpressionKind;

	if predicate.kind() == ExpressionKind::Scalar {
		return Err(StatementError::NonBooleanPredicate {
			found: predicate.kind_name().to_string(),
		});
	}
	if let Expression::Binary {
		op: BinaryOperator::And | BinaryOperator::Or,
		left,
		right,
	} = predicate
	{
		check_predicate(left)?;
		check_predicate(right)?;
	}
	Ok(())
}

/// An abstract query statement, ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
	/// Raw statement text, passed through verbatim (trimmed).
	Raw(String),
	/// A statement built from the expression DSL.
	Select(Select),
}

impl Statement {
	/// Wrap raw statement text.
	pub fn raw(text: impl Into<String>) -> Statement {
		Statement::Raw(text.into())
	}

	/// The deterministic canonical text of this statement.
	///
	/// Two structurally equal statements always canonicalise to the same
	/// text, which makes it usable as an exact-match plan-cache key.
	pub fn canonical_text(&self) -> String {
		match self {
			Statement::Raw(text) => text.trim().to_string(),
			Statement::Select(select) => select.render(),
		}
	}

	/// All placeholders referenced by this statement, in order of first
	/// appearance.
	pub fn placeholders(&self) -> Vec<Placeholder> {
		match self {
			Statement::Raw(text) => scan_placeholders(text),
			Statement::Select(select) => select.placeholders(),
		}
	}
}

/// Scan raw statement text for `$` parameter markers, skipping string
/// literals and backtick-quoted identifiers.
pub(crate) fn scan_placeholders(text: &str) -> Vec<Placeholder> {
	let bytes = text.as_bytes();
	let mut out: Vec<Placeholder> = Vec::new();
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			quote @ (b'\'' | b'"') => {
				i += 1;
				while i < bytes.len() {
					if bytes[i] == b'\\' {
						i += 2;
						continue;
					}
					if bytes[i] == quote {
						i += 1;
						break;
					}
					i += 1;
				}
			}
			b'`' => {
				i += 1;
				while i < bytes.len() && bytes[i] != b'`' {
					i += 1;
				}
				i += 1;
			}
			b'$' => {
				let start = i + 1;
				let mut end = start;
				while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
					end += 1;
				}
				if end > start {
					let name = &text[start..end];
					let placeholder = if name.bytes().all(|b| b.is_ascii_digit()) {
						name.parse().map(Placeholder::Positional).unwrap_or_else(|_| Placeholder::Named(name.to_string()))
					} else {
						Placeholder::Named(name.to_string())
					};
					if !out.contains(&placeholder) {
						out.push(placeholder);
					}
				}
				i = end.max(start);
			}
			_ => i += 1,
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_select_renders_canonical_text() {
		let statement = select([wildcard()]).from("default").filter(ident("item").eq(positional(1))).unwrap().build().unwrap();
		assert_eq!(statement.canonical_text(), "SELECT * FROM default WHERE (item = $1)");
	}

	#[test]
	fn test_canonical_text_is_deterministic() {
		let build = || {
			select([ident("a"), ident("b")])
				.from("odd name")
				.filter(ident("a").gt(lit(10)).and(ident("b").eq(named("x"))))
				.unwrap()
				.build()
				.unwrap()
		};
		assert_eq!(build().canonical_text(), build().canonical_text());
		assert_eq!(build().canonical_text(), "SELECT a, b FROM `odd name` WHERE ((a > 10) AND (b = $x))");
	}

	#[test]
	fn test_partial_select_is_reusable() {
		let base = select([wildcard()]).from("default");
		let first = base.filter(ident("a").eq(lit(1))).unwrap().build().unwrap();
		let second = base.filter(ident("b").eq(lit(2))).unwrap().build().unwrap();
		assert_eq!(first.canonical_text(), "SELECT * FROM default WHERE (a = 1)");
		assert_eq!(second.canonical_text(), "SELECT * FROM default WHERE (b = 2)");
	}

	#[test]
	fn test_filter_rejects_non_boolean_predicate() {
		let err = select([wildcard()]).from("default").filter(lit("not a predicate")).unwrap_err();
		assert_eq!(
			err,
			StatementError::NonBooleanPredicate {
				found: "string literal".to_string()
			}
		);
	}

	#[test]
	fn test_filter_rejects_scalar_logical_operand() {
		let err = select([wildcard()]).from("default").filter(ident("a").eq(lit(1)).and(lit(5))).unwrap_err();
		assert!(matches!(err, StatementError::NonBooleanPredicate { .. }));
	}

	#[test]
	fn test_build_rejects_empty_projection() {
		assert_eq!(select([]).from("default").build().unwrap_err(), StatementError::EmptyProjection);
	}

	#[test]
	fn test_build_rejects_empty_keyspace() {
		assert_eq!(select([wildcard()]).from("").build().unwrap_err(), StatementError::EmptyKeyspace);
	}

	#[test]
	fn test_build_rejects_zero_positional_placeholder() {
		let err = select([wildcard()]).from("default").filter(ident("a").eq(positional(0))).unwrap().build().unwrap_err();
		assert_eq!(err, StatementError::ZeroPositionalPlaceholder);
	}

	#[test]
	fn test_raw_placeholder_scan() {
		let statement = Statement::raw("SELECT * FROM `default` WHERE item = $1 AND name = $name AND tag = '$not_one'");
		assert_eq!(
			statement.placeholders(),
			vec![Placeholder::Positional(1), Placeholder::Named("name".to_string())]
		);
	}

	#[test]
	fn test_raw_placeholder_scan_skips_strings_and_dedups() {
		let statement = Statement::raw(r#"SELECT "$3", a FROM t WHERE a = $2 OR b = $2 OR c = "\" $4""#);
		assert_eq!(statement.placeholders(), vec![Placeholder::Positional(2)]);
	}

	#[test]
	fn test_raw_canonical_text_trims() {
		assert_eq!(Statement::raw("  SELECT 1  ").canonical_text(), "SELECT 1");
	}
}
