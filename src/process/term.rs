//! Runtime-native values.
//!
//! A [`Term`] is what a process finds in its mailbox after the codec has
//! converted a bus message. The shape follows what actor runtimes typically
//! carry: scalars, strings, lists, tuples and maps.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Bool(bool),
    /// Wide enough for every bus integer type, signed or not.
    Int(i128),
    Float(f64),
    String(String),
    List(Vec<Term>),
    Tuple(Vec<Term>),
    Map(Vec<(Term, Term)>),
}

impl Term {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Term::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Term::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Term], close: &str) -> fmt::Result {
            f.write_str(open)?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{item}")?;
            }
            f.write_str(close)
        }

        match self {
            Term::Bool(b) => write!(f, "{b}"),
            Term::Int(i) => write!(f, "{i}"),
            Term::Float(x) => write!(f, "{x}"),
            Term::String(s) => write!(f, "{s:?}"),
            Term::List(items) => seq(f, "[", items, "]"),
            Term::Tuple(items) => seq(f, "{", items, "}"),
            Term::Map(entries) => {
                f.write_str("#{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k} => {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::String(value.to_string())
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Term::String(value)
    }
}

impl From<bool> for Term {
    fn from(value: bool) -> Self {
        Term::Bool(value)
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Int(value.into())
    }
}

impl From<i32> for Term {
    fn from(value: i32) -> Self {
        Term::Int(value.into())
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Term::Float(value)
    }
}

impl<T: Into<Term>> From<Vec<T>> for Term {
    fn from(value: Vec<T>) -> Self {
        Term::List(value.into_iter().map(Into::into).collect())
    }
}
