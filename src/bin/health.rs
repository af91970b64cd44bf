use std::env;
use std::error;

use reqwest::{StatusCode, Url};
use serde_json::Value;

/// Exits non-zero unless the given health endpoint answers `{"status": "ok"}`
fn main() -> Result<(), Box<dyn error::Error>> {
    let Some(url) = env::args().nth(1) else {
        return Err("Missing URL argument".into());
    };
    let url = Url::parse(&url)?;

    let response = reqwest::blocking::get(url)?;
    let status = response.status();
    let body: Value = if status.is_success() {
        response.json()?
    } else {
        Value::Null
    };
    check_health(status, &body)?;

    Ok(())
}

fn check_health(status: StatusCode, body: &Value) -> Result<(), String> {
    if !status.is_success() {
        return Err(format!("Request failed with status {status}"));
    }
    if body["status"] != "ok" {
        return Err(format!("Unhealthy response: {body}"));
    }
    Ok(())
}
