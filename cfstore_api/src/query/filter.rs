//! Horizontal filters in PostgREST operator syntax (`col=eq.5`, `col=in.(1,2)`).

/// A single column predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    Gt(String, String),
    In(String, Vec<String>),
    IsNull(String),
    NotNull(String),
}

impl Filter {
    pub fn eq(column: &str, value: impl ToString) -> Self {
        Self::Eq(column.to_string(), value.to_string())
    }

    pub fn gt(column: &str, value: impl ToString) -> Self {
        Self::Gt(column.to_string(), value.to_string())
    }

    pub fn in_list<T: ToString>(column: &str, values: &[T]) -> Self {
        Self::In(
            column.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        )
    }

    pub fn is_null(column: &str) -> Self {
        Self::IsNull(column.to_string())
    }

    pub fn not_null(column: &str) -> Self {
        Self::NotNull(column.to_string())
    }

    /// The column this predicate applies to.
    pub fn column(&self) -> &str {
        match self {
            Self::Eq(c, _)
            | Self::Gt(c, _)
            | Self::In(c, _)
            | Self::IsNull(c)
            | Self::NotNull(c) => c,
        }
    }

    /// Serializes into a `(column, operator.value)` query pair.
    pub fn to_param(&self) -> (String, String) {
        let value = match self {
            Self::Eq(_, v) => format!("eq.{}", v),
            Self::Gt(_, v) => format!("gt.{}", v),
            Self::In(_, values) => format!(
                "in.({})",
                values
                    .iter()
                    .map(|v| quote_list_item(v))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            Self::IsNull(_) => "is.null".to_string(),
            Self::NotNull(_) => "not.is.null".to_string(),
        };
        (self.column().to_string(), value)
    }
}

/// List items containing reserved characters must be double-quoted.
fn quote_list_item(value: &str) -> String {
    if value.contains([',', '(', ')', '"']) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}
