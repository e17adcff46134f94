// ABOUTME: Column naming for survey fields - turns free-form field names into identifiers
// ABOUTME: Transliterates non-Latin names and handles reserved words, leading digits, empty names

/// Columns every survey table carries besides its fields.
pub const ACTION_ID_COLUMN: &str = "action_id";
pub const CREATED_AT_COLUMN: &str = "created_at";

const RESERVED_KEYWORDS: &[&str] = &[
    "union",
    "permissions",
    "select",
    "else",
    "when",
    "where",
    "order",
    "primary",
    "identity",
    "join",
    ACTION_ID_COLUMN,
    CREATED_AT_COLUMN,
];

const MAX_IDENTIFIER_LEN: usize = 63;

/// Slugify a field name: transliterated to ASCII, lower-case, every run of
/// non-alphanumeric characters collapsed to a single underscore.
pub fn slugify(name: &str) -> String {
    let ascii = deunicode::deunicode(name);
    let mut slug = String::with_capacity(ascii.len());
    let mut pending_separator = false;
    for ch in ascii.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug
}

/// Destination column name for a source field name.
///
/// The mapping depends on the name alone, so the same field lands in the same
/// column in every batch.
pub fn column_name(field_name: &str) -> String {
    let mut column = slugify(field_name);
    if column.is_empty() {
        column = "unnamed_field".to_string();
    }
    if RESERVED_KEYWORDS.contains(&column.as_str()) {
        column.push_str("_q");
    }
    if column.starts_with(|c: char| c.is_ascii_digit()) {
        column.insert_str(0, "q_");
    }
    column.truncate(MAX_IDENTIFIER_LEN);
    column
}
