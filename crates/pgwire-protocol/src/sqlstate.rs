//! SQLSTATE codes the client reacts to.

/// `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";
/// `foreign_key_violation`
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// `not_null_violation`
pub const NOT_NULL_VIOLATION: &str = "23502";
/// `duplicate_prepared_statement`
pub const DUPLICATE_PREPARED_STATEMENT: &str = "42P05";
/// `invalid_sql_statement_name`, raised for unknown prepared statements.
pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
/// `query_canceled`
pub const QUERY_CANCELED: &str = "57014";
/// `admin_shutdown`
pub const ADMIN_SHUTDOWN: &str = "57P01";
/// `invalid_password`
pub const INVALID_PASSWORD: &str = "28P01";
