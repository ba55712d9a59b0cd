//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format and level parsing from environment values.

use alert_control::observability::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_json() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("JSON"), LogFormat::Json));
}

#[test]
fn test_log_format_parse_pretty() {
    assert!(matches!(LogFormat::parse("pretty"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Pretty"), LogFormat::Pretty));
}

#[test]
fn test_log_format_parse_compact() {
    assert!(matches!(LogFormat::parse("compact"), LogFormat::Compact));
    assert!(matches!(LogFormat::parse("COMPACT"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert!(matches!(LogFormat::parse("invalid"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("xml"), LogFormat::Json));
}

#[test]
fn test_parse_level_is_case_insensitive() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("Debug"), Level::DEBUG);
    assert_eq!(parse_level("trace"), Level::TRACE);
}

#[test]
fn test_parse_level_defaults_to_info() {
    assert_eq!(parse_level("INFO"), Level::INFO);
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level(""), Level::INFO);
}
