//! Unit tests for rmq2db-rdbc error module

use rmq2db_rdbc::error::{Error, ErrorCategory};

#[test]
fn test_error_connection() {
    let err = Error::connection("Failed to connect");

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.to_string().contains("Failed to connect"));
    assert!(err.is_retriable());
}

#[test]
fn test_error_config() {
    let err = Error::config("Invalid URL format");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("Invalid URL format"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_query_keeps_sql() {
    let err = Error::query_with_sql("relation \"nope\" does not exist", "TRUNCATE \"nope\"");

    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(err.sql(), Some("TRUNCATE \"nope\""));
    assert!(!err.is_retriable());
    assert!(!err.is_batch_conflict());
}

#[test]
fn test_error_batch_conflict() {
    let err = Error::batch_conflict(
        "ON CONFLICT DO UPDATE command cannot affect row a second time",
        "INSERT INTO \"roomtemp\" ...",
    );

    assert_eq!(err.category(), ErrorCategory::BatchConflict);
    assert!(err.is_batch_conflict());
    assert!(!err.is_retriable());
    assert!(err.to_string().contains("second time"));
}

#[test]
fn test_error_constraint() {
    let err = Error::Constraint {
        constraint_name: "strom_pkey".into(),
        message: "duplicate key value violates unique constraint".into(),
    };

    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert!(err.to_string().contains("strom_pkey"));
    assert!(!err.is_batch_conflict());
}

#[test]
fn test_error_transaction_and_timeout() {
    assert_eq!(
        Error::transaction("COMMIT failed").category(),
        ErrorCategory::Transaction
    );

    let err = Error::timeout("connect timed out");
    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert!(err.is_retriable());
}

#[test]
fn test_error_with_source() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
    let err = Error::connection_with_source("lost connection", io);

    let source = std::error::Error::source(&err).map(|s| s.to_string());
    assert_eq!(source.as_deref(), Some("reset by peer"));
}

#[test]
fn test_category_display() {
    assert_eq!(ErrorCategory::BatchConflict.to_string(), "batch_conflict");
    assert_eq!(ErrorCategory::TypeConversion.to_string(), "type_conversion");
}
