// ABOUTME: PostgreSQL connection management and privilege checks
// ABOUTME: Shared by the source reader, destination writer, and page registry

pub mod connection;
pub mod privileges;

pub use connection::{apply_statement_timeout, connect, connect_with_retry, init_tls_policy};
pub use privileges::{check_schema_create_privilege, check_table_select_permissions};
