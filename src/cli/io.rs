//! JSON output
//!
//! Results are written to stdout as one JSON document; failures go to
//! stderr so that stdout stays machine readable.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::{json, Value};

use super::errors::{CliError, CliResult};

/// Serialize `value` to `out` followed by a newline
pub fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> CliResult<()> {
    serde_json::to_writer_pretty(&mut *out, value)
        .map_err(|e| CliError::Output(io::Error::new(io::ErrorKind::Other, e)))?;
    writeln!(out).map_err(CliError::Output)?;
    out.flush().map_err(CliError::Output)
}

/// Success envelope
pub fn response(data: Value) -> Value {
    json!({ "status": "ok", "data": data })
}

/// Failure envelope
pub fn error_response(err: &CliError, verbose: bool) -> Value {
    let mut body = json!({
        "status": "error",
        "error": {
            "kind": err.code(),
            "message": err.to_string(),
        }
    });
    if verbose {
        if let Some(details) = err.details() {
            body["error"]["details"] = json!(details);
        }
    }
    body
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_json(&mut io::stdout().lock(), &response(data))
}

/// Write an error to stderr
pub fn write_error(err: &CliError, verbose: bool) -> CliResult<()> {
    write_json(&mut io::stderr().lock(), &error_response(err, verbose))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::MigrationError;

    #[test]
    fn test_write_json_line() {
        let mut out = Vec::new();
        write_json(&mut out, &response(json!({"applied": 2}))).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"]["applied"], 2);
    }

    #[test]
    fn test_error_response() {
        let err = CliError::from(MigrationError::Interrupted);
        let quiet = error_response(&err, false);
        assert_eq!(quiet["error"]["kind"], err.code());
        assert!(quiet["error"].get("details").is_none());

        let verbose = error_response(&err, true);
        assert_eq!(verbose["error"]["details"]["message"], "Deployment interrupted");
    }
}
