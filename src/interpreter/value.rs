use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Static type of an IR expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// `BOOL`
    Bool,
    /// `INT`
    Integer,
    /// `REAL`
    Float,
    /// `TIME`: absolute instant.
    Time,
    /// `RTIME`: relative time.
    Duration,
    /// `STRING`
    String,
    /// `IP`
    Ip,
    /// `BACKEND`
    Backend,
}

impl ValueType {
    /// Resolve a `var` type keyword.
    pub fn from_keyword(keyword: &str) -> Option<ValueType> {
        match keyword.to_ascii_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => Some(ValueType::Bool),
            "INT" | "INTEGER" => Some(ValueType::Integer),
            "REAL" | "FLOAT" => Some(ValueType::Float),
            "TIME" => Some(ValueType::Time),
            "RTIME" | "DURATION" => Some(ValueType::Duration),
            "STRING" => Some(ValueType::String),
            _ => None,
        }
    }

    /// Whether values of this type take part in arithmetic.
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Float)
    }

    /// Type keyword as written in source.
    pub fn keyword(self) -> &'static str {
        match self {
            ValueType::Bool => "BOOL",
            ValueType::Integer => "INT",
            ValueType::Float => "REAL",
            ValueType::Time => "TIME",
            ValueType::Duration => "RTIME",
            ValueType::String => "STRING",
            ValueType::Ip => "IP",
            ValueType::Backend => "BACKEND",
        }
    }

    /// Default value given to freshly declared variables.
    pub fn zero(self) -> Value {
        match self {
            ValueType::Bool => Value::Bool(false),
            ValueType::Integer => Value::Integer(0),
            ValueType::Float => Value::Float(0.0),
            ValueType::Time => Value::Time(DateTime::<Utc>::UNIX_EPOCH),
            ValueType::Duration => Value::Duration(Duration::zero()),
            ValueType::String => Value::String(String::new()),
            ValueType::Ip => Value::Ip(IpAddr::from([0, 0, 0, 0])),
            ValueType::Backend => Value::Backend(String::new()),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Runtime value produced by evaluating an IR expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point.
    Float(f64),
    /// Absolute instant.
    Time(DateTime<Utc>),
    /// Relative time.
    Duration(Duration),
    /// UTF-8 text.
    String(String),
    /// IP address.
    Ip(IpAddr),
    /// Backend reference by name.
    Backend(String),
}

impl Value {
    /// Type of this value.
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Time(_) => ValueType::Time,
            Value::Duration(_) => ValueType::Duration,
            Value::String(_) => ValueType::String,
            Value::Ip(_) => ValueType::Ip,
            Value::Backend(_) => ValueType::Backend,
        }
    }

    /// Condition semantics: non-zero numbers and non-blank strings are true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(flag) => *flag,
            Value::Integer(num) => *num != 0,
            Value::Float(num) => *num != 0.0,
            Value::Duration(d) => !d.is_zero(),
            Value::String(text) => !text.trim().is_empty(),
            Value::Backend(name) => !name.is_empty(),
            Value::Time(_) | Value::Ip(_) => true,
        }
    }

    /// Numeric view used by arithmetic and comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(num) => Some(*num as f64),
            Value::Float(num) => Some(*num),
            _ => None,
        }
    }
}

/// Stringification used for `STRING` conversion, headers and hashing.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(flag) => write!(f, "{flag}"),
            Value::Integer(num) => write!(f, "{num}"),
            Value::Float(num) => write!(f, "{num:.3}"),
            Value::Time(at) => write!(f, "{}", at.format("%a, %d %b %Y %H:%M:%S GMT")),
            Value::Duration(d) => write!(f, "{:.3}", d.num_milliseconds() as f64 / 1000.0),
            Value::String(text) => f.write_str(text),
            Value::Ip(addr) => write!(f, "{addr}"),
            Value::Backend(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_conversion_rules() {
        assert!(Value::Integer(-3).truthy());
        assert!(!Value::Integer(0).truthy());
        assert!(!Value::String("   ".into()).truthy());
        assert!(Value::String("x".into()).truthy());
    }

    #[test]
    fn stringification_formats() {
        assert_eq!(Value::Float(1.5).to_string(), "1.500");
        assert_eq!(Value::Duration(Duration::seconds(60)).to_string(), "60.000");
        assert_eq!(
            Value::Time(DateTime::<Utc>::UNIX_EPOCH).to_string(),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );
    }

    #[test]
    fn var_type_keywords() {
        assert_eq!(ValueType::from_keyword("rtime"), Some(ValueType::Duration));
        assert_eq!(ValueType::from_keyword("BOOLEAN"), Some(ValueType::Bool));
        assert_eq!(ValueType::from_keyword("IP"), None);
    }
}
