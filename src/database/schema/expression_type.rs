use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// SQL type family of a column or projected expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    SmallInt,
    Int,
    BigInt,
    Numeric,
    Real,
    Double,
    Boolean,
    Char,
    Varchar,
    Text,
    Date,
    Time,
    Timestamp,
}

/// Declared type of an expression: family plus optional length / precision / scale.
///
/// Temp-table DDL is rendered from this, and hash routing uses it to normalize
/// values so every node hashes the same logical value to the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpressionType {
    pub sql_type: SqlType,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

impl ExpressionType {
    pub fn new(sql_type: SqlType) -> Self {
        Self { sql_type, length: None, precision: None, scale: None }
    }

    pub fn int() -> Self { Self::new(SqlType::Int) }
    pub fn bigint() -> Self { Self::new(SqlType::BigInt) }
    pub fn double() -> Self { Self::new(SqlType::Double) }
    pub fn text() -> Self { Self::new(SqlType::Text) }
    pub fn boolean() -> Self { Self::new(SqlType::Boolean) }
    pub fn date() -> Self { Self::new(SqlType::Date) }

    pub fn varchar(length: u32) -> Self {
        Self { length: Some(length), ..Self::new(SqlType::Varchar) }
    }

    pub fn char(length: u32) -> Self {
        Self { length: Some(length), ..Self::new(SqlType::Char) }
    }

    pub fn numeric(precision: u32, scale: u32) -> Self {
        Self { precision: Some(precision), scale: Some(scale), ..Self::new(SqlType::Numeric) }
    }

    /// Numeric types are substituted into statements without quotes.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.sql_type,
            SqlType::SmallInt | SqlType::Int | SqlType::BigInt | SqlType::Numeric | SqlType::Real | SqlType::Double
        )
    }

    pub fn is_character(&self) -> bool {
        matches!(self.sql_type, SqlType::Char | SqlType::Varchar | SqlType::Text)
    }

    /// Column type as written in a CREATE TABLE statement.
    pub fn to_ddl(&self) -> String {
        match self.sql_type {
            SqlType::SmallInt => "SMALLINT".into(),
            SqlType::Int => "INT".into(),
            SqlType::BigInt => "BIGINT".into(),
            SqlType::Numeric => match (self.precision, self.scale) {
                (Some(p), Some(s)) => format!("NUMERIC({p},{s})"),
                (Some(p), None) => format!("NUMERIC({p})"),
                _ => "NUMERIC".into(),
            },
            SqlType::Real => "REAL".into(),
            SqlType::Double => "DOUBLE PRECISION".into(),
            SqlType::Boolean => "BOOLEAN".into(),
            SqlType::Char => format!("CHAR({})", self.length.unwrap_or(1)),
            SqlType::Varchar => match self.length {
                Some(l) => format!("VARCHAR({l})"),
                None => "VARCHAR".into(),
            },
            SqlType::Text => "TEXT".into(),
            SqlType::Date => "DATE".into(),
            SqlType::Time => "TIME".into(),
            SqlType::Timestamp => "TIMESTAMP".into(),
        }
    }

    /// Canonical textual form of `value` for hashing.
    ///
    /// Numerics drop sign noise, leading zeros and trailing fractional zeros;
    /// CHAR values drop trailing blanks. Other types hash verbatim.
    pub fn normalize_value(&self, value: &str) -> String {
        if self.is_numeric() {
            return Self::normalize_number(value.trim());
        }
        match self.sql_type {
            SqlType::Char => value.trim_end_matches(' ').to_string(),
            SqlType::Boolean => match value.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "y" | "yes" => "true".into(),
                "f" | "false" | "0" | "n" | "no" => "false".into(),
                other => other.to_string(),
            },
            _ => value.to_string(),
        }
    }

    fn normalize_number(value: &str) -> String {
        let (negative, digits) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.strip_prefix('+').unwrap_or(value)),
        };
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return value.to_string();
        }
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        let int_part = int_part.trim_start_matches('0');
        let frac_part = frac_part.trim_end_matches('0');
        let int_part = if int_part.is_empty() { "0" } else { int_part };

        let mut out = String::with_capacity(digits.len() + 1);
        let is_zero = int_part == "0" && frac_part.is_empty();
        if negative && !is_zero {
            out.push('-');
        }
        out.push_str(int_part);
        if !frac_part.is_empty() {
            out.push('.');
            out.push_str(frac_part);
        }
        out
    }
}

impl Display for ExpressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_ddl())
    }
}
