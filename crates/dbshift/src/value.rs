//! Driver-neutral values.
//!
//! Every backend decodes its rows into [`Value`]s, and destinations are
//! filled through [`FromValue`], which spells out the allowed coercions:
//! integers widen (or narrow when the value fits), integers become floats
//! and booleans (`0`/`1`), text and bytes interconvert when UTF-8, and unix
//! seconds become timestamps.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{MigrateError, Result};

/// A single column value, or a tuple of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL / Lua nil.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point.
    Float(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Timestamp.
    Time(DateTime<Utc>),
    /// Nested values (Tarantool tuples, ClickHouse arrays, fake rows).
    Tuple(Vec<Value>),
}

impl Value {
    /// Short name of the variant, used in conversion errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Time(_) => "time",
            Self::Tuple(_) => "tuple",
        }
    }

    /// Whether this is NULL.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts into a destination type.
    pub fn get<T: FromValue>(&self) -> Result<T> {
        T::from_value(self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Self::Time(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
            Self::Tuple(values) => {
                f.write_str("(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
        }
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_value! {
    bool => Bool,
    i8 => Int, i16 => Int, i32 => Int, i64 => Int,
    u8 => UInt, u16 => UInt, u32 => UInt, u64 => UInt,
    f32 => Float, f64 => Float,
    String => Text, &str => Text,
    Vec<u8> => Bytes,
    DateTime<Utc> => Time,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Conversion from a [`Value`] into a scan destination.
pub trait FromValue: Sized {
    /// Destination type name, used in errors.
    const NAME: &'static str;

    /// Converts a value.
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T: FromValue>(value: &Value) -> MigrateError {
    match value {
        Value::Null => MigrateError::NilValue(T::NAME),
        Value::Tuple(_) => MigrateError::NotScalar(T::NAME),
        other => MigrateError::ScanConversion {
            from: other.kind(),
            to: T::NAME,
        },
    }
}

macro_rules! impl_from_value_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromValue for $ty {
                const NAME: &'static str = stringify!($ty);

                fn from_value(value: &Value) -> Result<Self> {
                    let converted = match value {
                        Value::Int(v) => <$ty>::try_from(*v).ok(),
                        Value::UInt(v) => <$ty>::try_from(*v).ok(),
                        Value::Bool(v) => Some(<$ty>::from(*v)),
                        Value::Text(s) => s.trim().parse().ok(),
                        _ => return Err(mismatch::<Self>(value)),
                    };
                    converted.ok_or(MigrateError::ScanConversion {
                        from: value.kind(),
                        to: Self::NAME,
                    })
                }
            }
        )*
    };
}

impl_from_value_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromValue for usize {
    const NAME: &'static str = "usize";

    fn from_value(value: &Value) -> Result<Self> {
        let wide = u64::from_value(value)?;
        Self::try_from(wide).map_err(|_| MigrateError::ScanConversion {
            from: value.kind(),
            to: Self::NAME,
        })
    }
}

impl FromValue for f64 {
    const NAME: &'static str = "f64";

    #[allow(clippy::cast_precision_loss)]
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as Self),
            Value::UInt(v) => Ok(*v as Self),
            Value::Text(s) => s.trim().parse().map_err(|_| MigrateError::ScanConversion {
                from: "text",
                to: Self::NAME,
            }),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromValue for f32 {
    const NAME: &'static str = "f32";

    #[allow(clippy::cast_possible_truncation)]
    fn from_value(value: &Value) -> Result<Self> {
        f64::from_value(value)
            .map(|v| v as Self)
            .map_err(|_| mismatch::<Self>(value))
    }
}

impl FromValue for bool {
    const NAME: &'static str = "bool";

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(*v),
            Value::Int(0) | Value::UInt(0) => Ok(false),
            Value::Int(1) | Value::UInt(1) => Ok(true),
            Value::Text(s) => match s.as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(mismatch::<Self>(value)),
            },
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromValue for String {
    const NAME: &'static str = "String";

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Bytes(b) => Self::from_utf8(b.clone()).map_err(|_| mismatch::<Self>(value)),
            Value::Int(_) | Value::UInt(_) | Value::Float(_) | Value::Bool(_) | Value::Time(_) => {
                Ok(value.to_string())
            }
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromValue for Vec<u8> {
    const NAME: &'static str = "Vec<u8>";

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.clone().into_bytes()),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    const NAME: &'static str = "DateTime<Utc>";

    fn from_value(value: &Value) -> Result<Self> {
        let seconds = match value {
            Value::Time(t) => return Ok(*t),
            Value::Int(v) => *v,
            Value::UInt(v) => i64::try_from(*v).map_err(|_| mismatch::<Self>(value))?,
            Value::Text(s) => {
                return NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .map(|dt| dt.and_utc())
                    .map_err(|_| mismatch::<Self>(value));
            }
            _ => return Err(mismatch::<Self>(value)),
        };
        DateTime::from_timestamp(seconds, 0).ok_or_else(|| mismatch::<Self>(value))
    }
}

impl FromValue for Value {
    const NAME: &'static str = "Value";

    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const NAME: &'static str = T::NAME;

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening() {
        assert_eq!(Value::Int(7).get::<i64>().unwrap(), 7);
        assert_eq!(Value::Int(7).get::<u8>().unwrap(), 7);
        assert_eq!(Value::UInt(42).get::<i32>().unwrap(), 42);
        assert_eq!(Value::Int(300).get::<i16>().unwrap(), 300);
        assert_eq!(Value::Text("12".into()).get::<u32>().unwrap(), 12);
    }

    #[test]
    fn test_integer_overflow_fails() {
        assert!(matches!(
            Value::Int(300).get::<u8>(),
            Err(MigrateError::ScanConversion { to: "u8", .. })
        ));
        assert!(Value::Int(-1).get::<u64>().is_err());
        assert!(Value::UInt(u64::MAX).get::<i64>().is_err());
    }

    #[test]
    fn test_float_and_bool() {
        assert!((Value::Int(3).get::<f64>().unwrap() - 3.0).abs() < f64::EPSILON);
        assert!((Value::Float(1.5).get::<f32>().unwrap() - 1.5).abs() < f32::EPSILON);
        assert!(Value::UInt(1).get::<bool>().unwrap());
        assert!(!Value::Int(0).get::<bool>().unwrap());
        assert!(Value::Int(2).get::<bool>().is_err());
    }

    #[test]
    fn test_strings() {
        assert_eq!(Value::Text("v1".into()).get::<String>().unwrap(), "v1");
        assert_eq!(Value::Bytes(b"v2".to_vec()).get::<String>().unwrap(), "v2");
        assert_eq!(Value::UInt(5).get::<String>().unwrap(), "5");
    }

    #[test]
    fn test_time() {
        let t = Value::UInt(1_616_969_760).get::<DateTime<Utc>>().unwrap();
        assert_eq!(t.timestamp(), 1_616_969_760);
        let t = Value::Text("2021-03-28 22:16:00".into())
            .get::<DateTime<Utc>>()
            .unwrap();
        assert_eq!(t.timestamp(), 1_616_969_760);
    }

    #[test]
    fn test_null_handling() {
        assert!(matches!(
            Value::Null.get::<i64>(),
            Err(MigrateError::NilValue("i64"))
        ));
        assert_eq!(Value::Null.get::<Option<i64>>().unwrap(), None);
        assert_eq!(Value::Int(1).get::<Option<i64>>().unwrap(), Some(1));
    }

    #[test]
    fn test_non_scalar_fails() {
        let tuple = Value::Tuple(vec![Value::Int(1)]);
        assert!(matches!(
            tuple.get::<i64>(),
            Err(MigrateError::NotScalar("i64"))
        ));
        assert_eq!(tuple.get::<Value>().unwrap(), tuple);
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from("a"), Value::Text("a".into()));
        assert_eq!(Value::from(3_u32), Value::UInt(3));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(
            Value::Tuple(vec![Value::from(1_i64), Value::from("x")]).to_string(),
            "(1, x)"
        );
    }
}
