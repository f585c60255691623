//! SQL identifier quoting.

/// Quote a SQL identifier using ANSI double quotes.
///
/// Embedded double quotes are doubled, so any input is safe to splice into
/// a statement.
///
/// ```
/// use assyria_core::quote_ident;
///
/// assert_eq!(quote_ident("offices"), "\"offices\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote and join a list of column names with `, `.
pub fn quote_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}
