//! The form POST that reports a decoded code back to the page.

use serde::{Deserialize, Serialize};

use crate::ScanError;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const CSRF_HEADER: &str = "X-CSRFToken";

#[derive(Serialize)]
struct ScanForm<'a> {
    scan_data: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPost {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl FormPost {
    pub fn scan(url: &str, csrf_token: &str, text: &str) -> Result<Self, ScanError> {
        let body = serde_urlencoded::to_string(ScanForm { scan_data: text })
            .map_err(|e| ScanError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.to_owned(),
            headers: vec![
                ("Content-Type", FORM_CONTENT_TYPE.to_owned()),
                (CSRF_HEADER, csrf_token.to_owned()),
            ],
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

/// Error replies from the attendance view look like
/// `{"status": "error", "message": "Member not found"}`.
#[derive(Deserialize)]
struct ServerReply {
    message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected { status: u16, message: Option<String> },
}

impl Response {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn outcome(&self) -> Outcome {
        if self.ok() {
            return Outcome::Accepted;
        }
        let message = serde_json::from_str::<ServerReply>(&self.body)
            .ok()
            .and_then(|reply| reply.message)
            .or_else(|| {
                let text = self.body.trim();
                (!text.is_empty() && !text.starts_with('<')).then(|| text.to_owned())
            });
        Outcome::Rejected {
            status: self.status,
            message,
        }
    }
}
