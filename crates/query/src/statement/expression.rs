// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

use std::fmt::{self, Display, Formatter};

use serde_json::Value;

/// A node in the query expression tree.
///
/// Expressions are immutable: combinator methods never mutate their
/// receiver, they return a new composite node. A partially built expression
/// can therefore be reused across statements and threads.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
	/// A column or keyspace reference.
	Identifier(String),
	/// The `*` projection.
	Wildcard,
	/// A literal JSON value, rendered inline.
	Literal(Value),
	/// A parameter marker bound at execution time.
	Placeholder(Placeholder),
	/// A binary comparison or logical connective.
	Binary {
		op: BinaryOperator,
		left: Box<Expression>,
		right: Box<Expression>,
	},
	/// A function call.
	Call {
		name: String,
		args: Vec<Expression>,
	},
}

/// A positional (`$1`) or named (`$name`) parameter marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
	/// 1-based argument index.
	Positional(usize),
	/// Parameter name, without the leading `$`.
	Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
	Eq,
	Ne,
	Gt,
	Gte,
	Lt,
	Lte,
	And,
	Or,
}

impl BinaryOperator {
	fn symbol(&self) -> &'static str {
		match self {
			BinaryOperator::Eq => "=",
			BinaryOperator::Ne => "!=",
			BinaryOperator::Gt => ">",
			BinaryOperator::Gte => ">=",
			BinaryOperator::Lt => "<",
			BinaryOperator::Lte => "<=",
			BinaryOperator::And => "AND",
			BinaryOperator::Or => "OR",
		}
	}
}

/// Create an identifier expression.
pub fn ident(name: impl Into<String>) -> Expression {
	Expression::Identifier(name.into())
}

/// Create the `*` projection expression.
pub fn wildcard() -> Expression {
	Expression::Wildcard
}

/// Create a literal expression from any JSON-convertible value.
pub fn lit(value: impl Into<Value>) -> Expression {
	Expression::Literal(value.into())
}

/// Create a positional placeholder (`$1`, `$2`, ...). Indices are 1-based.
pub fn positional(index: usize) -> Expression {
	Expression::Placeholder(Placeholder::Positional(index))
}

/// Create a named placeholder (`$name`). A leading `$` is accepted and
/// stripped.
pub fn named(name: impl Into<String>) -> Expression {
	let name = name.into();
	let name = name.strip_prefix('$').map(str::to_string).unwrap_or(name);
	Expression::Placeholder(Placeholder::Named(name))
}

impl Expression {
	pub fn eq(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::Eq, other)
	}

	pub fn ne(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::Ne, other)
	}

	pub fn gt(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::Gt, other)
	}

	pub fn gte(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::Gte, other)
	}

	pub fn lt(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::Lt, other)
	}

	pub fn lte(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::Lte, other)
	}

	pub fn and(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::And, other)
	}

	pub fn or(&self, other: Expression) -> Expression {
		self.binary(BinaryOperator::Or, other)
	}

	/// Create a function call expression, e.g. `call("meta", vec![ident("b")])`.
	pub fn call(name: impl Into<String>, args: Vec<Expression>) -> Expression {
		Expression::Call {
			name: name.into(),
			args,
		}
	}

	fn binary(&self, op: BinaryOperator, right: Expression) -> Expression {
		Expression::Binary {
			op,
			left: Box::new(self.clone()),
			right: Box::new(right),
		}
	}

	/// Statically known value category, used for composition-time checks.
	pub(crate) fn kind(&self) -> ExpressionKind {
		match self {
			Expression::Literal(Value::Bool(_)) => ExpressionKind::Boolean,
			Expression::Literal(_) | Expression::Wildcard => ExpressionKind::Scalar,
			Expression::Binary {
				..
			} => ExpressionKind::Boolean,
			// Identifiers, placeholders and calls resolve server-side.
			_ => ExpressionKind::Unknown,
		}
	}

	pub(crate) fn kind_name(&self) -> &'static str {
		match self {
			Expression::Identifier(_) => "identifier",
			Expression::Wildcard => "wildcard",
			Expression::Literal(Value::String(_)) => "string literal",
			Expression::Literal(Value::Number(_)) => "number literal",
			Expression::Literal(_) => "literal",
			Expression::Placeholder(_) => "placeholder",
			Expression::Binary {
				..
			} => "comparison",
			Expression::Call {
				..
			} => "function call",
		}
	}

	pub(crate) fn collect_placeholders(&self, out: &mut Vec<Placeholder>) {
		match self {
			Expression::Placeholder(placeholder) => {
				if !out.contains(placeholder) {
					out.push(placeholder.clone());
				}
			}
			Expression::Binary {
				left,
				right,
				..
			} => {
				left.collect_placeholders(out);
				right.collect_placeholders(out);
			}
			Expression::Call {
				args,
				..
			} => {
				for arg in args {
					arg.collect_placeholders(out);
				}
			}
			_ => {}
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpressionKind {
	Boolean,
	Scalar,
	Unknown,
}

impl Display for Expression {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Expression::Identifier(name) => f.write_str(&escape_identifier(name)),
			Expression::Wildcard => f.write_str("*"),
			Expression::Literal(value) => match serde_json::to_string(value) {
				Ok(rendered) => f.write_str(&rendered),
				Err(_) => Err(fmt::Error),
			},
			Expression::Placeholder(placeholder) => write!(f, "{}", placeholder),
			Expression::Binary {
				op,
				left,
				right,
			} => {
				write!(f, "({} {} {})", left, op.symbol(), right)
			}
			Expression::Call {
				name,
				args,
			} => {
				write!(f, "{}(", name)?;
				for (i, arg) in args.iter().enumerate() {
					if i > 0 {
						f.write_str(", ")?;
					}
					write!(f, "{}", arg)?;
				}
				f.write_str(")")
			}
		}
	}
}

impl Display for Placeholder {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Placeholder::Positional(index) => write!(f, "${}", index),
			Placeholder::Named(name) => write!(f, "${}", name),
		}
	}
}

/// Render an identifier, backtick-escaping it unless it is a plain name.
pub(crate) fn escape_identifier(name: &str) -> String {
	let plain = !name.is_empty()
		&& name.chars().enumerate().all(|(i, c)| {
			c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())
		});
	if plain {
		name.to_string()
	} else {
		format!("`{}`", name.replace('`', "``"))
	}
}
