use std::fmt;
use std::str::FromStr;

use pg_escape::quote_identifier;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A fully qualified Postgres table name consisting of a schema and table name.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TableName {
    /// The schema name containing the table.
    pub schema: String,
    /// The name of the table within the schema.
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the table name as a properly quoted Postgres identifier.
    pub fn as_quoted_identifier(&self) -> String {
        let quoted_schema = quote_identifier(&self.schema);
        let quoted_name = quote_identifier(&self.name);

        format!("{quoted_schema}.{quoted_name}")
    }

    /// Returns the table in the notation of the wal2json `add-tables` option.
    ///
    /// Spaces, quotes, commas, periods and asterisks inside either part are escaped with a
    /// backslash so that they are not taken as separators or wildcards.
    pub fn as_wal2json_filter(&self) -> String {
        format!(
            "{}.{}",
            escape_wal2json_name(&self.schema),
            escape_wal2json_name(&self.name)
        )
    }

    /// Returns the stream identifier used for output records, `schema-table`.
    pub fn stream_name(&self) -> String {
        format!("{}-{}", self.schema, self.name)
    }
}

fn escape_wal2json_name(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if matches!(c, ' ' | '\'' | ',' | '.' | '*' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{0}.{1}", self.schema, self.name))
    }
}

/// Error returned when a string is not a `schema.table` pair.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid table name '{0}', expected `schema.table`")]
pub struct ParseTableNameError(String);

impl FromStr for TableName {
    type Err = ParseTableNameError;

    /// Parses `schema.table`, defaulting to the `public` schema when no schema is given.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();

        match second {
            Some(name) if !first.is_empty() && !name.is_empty() => Ok(TableName::new(first, name)),
            None if !first.is_empty() => Ok(TableName::new("public", first)),
            _ => Err(ParseTableNameError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_and_unqualified_names() {
        assert_eq!(
            "sales.orders".parse::<TableName>(),
            Ok(TableName::new("sales", "orders"))
        );
        assert_eq!(
            "users".parse::<TableName>(),
            Ok(TableName::new("public", "users"))
        );
        assert!("".parse::<TableName>().is_err());
        assert!("public.".parse::<TableName>().is_err());
    }

    #[test]
    fn wal2json_filter_escapes_separators() {
        let table = TableName::new("my schema", "odd.name*");
        assert_eq!(table.as_wal2json_filter(), "my\\ schema.odd\\.name\\*");
    }

    #[test]
    fn stream_name_joins_with_dash() {
        assert_eq!(TableName::new("public", "users").stream_name(), "public-users");
    }

    #[test]
    fn quoted_identifier_quotes_when_needed() {
        assert_eq!(
            TableName::new("sales", "Users").as_quoted_identifier(),
            "sales.\"Users\""
        );
    }
}
