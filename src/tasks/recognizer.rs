use std::io::Cursor;
use std::time::Duration;

use image::{ImageFormat, RgbImage};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecognizeError {
    #[error("failed to encode plate image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("recognition request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognition {
    Text(String),
    Unreadable,
}

/// Reads the text off a plate image.
pub trait Recognizer: Send {
    fn recognize(&mut self, plate: &RgbImage) -> Result<Recognition, RecognizeError>;
}

const FALLBACK_DIGITS: usize = 4;

/// Upper-cases and keeps ASCII alphanumerics. A result shorter than
/// `min_len` falls back to its last four digits; with fewer digits than
/// that, or on an explicit "UNREADABLE" answer, the plate is unreadable.
pub fn clean_plate_text(raw: &str, min_len: usize) -> Recognition {
    let upper = raw.trim().to_uppercase();
    if upper.contains("UNREADABLE") {
        return Recognition::Unreadable;
    }

    let cleaned: String = upper.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if !cleaned.is_empty() && cleaned.len() >= min_len {
        return Recognition::Text(cleaned);
    }

    let digits: Vec<char> = cleaned.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < FALLBACK_DIGITS {
        return Recognition::Unreadable;
    }
    Recognition::Text(digits[digits.len() - FALLBACK_DIGITS..].iter().collect())
}

#[derive(Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    text: Option<String>,
}

/// Posts the plate as JPEG to an OCR endpoint answering `{"text": "..."}`.
///
/// Uses the blocking client: it runs on the worker thread, never on the
/// async runtime.
pub struct HttpRecognizer {
    client: reqwest::blocking::Client,
    endpoint: String,
    min_text_len: usize,
}

impl HttpRecognizer {
    pub fn new(
        endpoint: impl Into<String>,
        min_text_len: usize,
        timeout: Duration,
    ) -> Result<Self, RecognizeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(format!("parkwatch/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            min_text_len,
        })
    }
}

impl Recognizer for HttpRecognizer {
    fn recognize(&mut self, plate: &RgbImage) -> Result<Recognition, RecognizeError> {
        let mut body = Vec::new();
        plate.write_to(&mut Cursor::new(&mut body), ImageFormat::Jpeg)?;

        let response: RecognizeResponse = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()?
            .error_for_status()?
            .json()?;

        Ok(match response.text {
            Some(text) => clean_plate_text(&text, self.min_text_len),
            None => Recognition::Unreadable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_plate_text() {
        assert_eq!(
            clean_plate_text(" ab-12 cd ", 4),
            Recognition::Text("AB12CD".to_string())
        );
        assert_eq!(clean_plate_text("a1", 4), Recognition::Unreadable);
        assert_eq!(clean_plate_text("", 4), Recognition::Unreadable);
        assert_eq!(clean_plate_text("Unreadable", 4), Recognition::Unreadable);
        assert_eq!(clean_plate_text("1234", 4), Recognition::Text("1234".to_string()));
    }

    #[test]
    fn test_short_read_keeps_last_four_digits() {
        assert_eq!(
            clean_plate_text("x 12-345", 7),
            Recognition::Text("2345".to_string())
        );
        assert_eq!(clean_plate_text("AB123", 7), Recognition::Unreadable);
    }

    #[test]
    fn test_non_ascii_is_dropped() {
        assert_eq!(
            clean_plate_text("ÄB 1234", 4),
            Recognition::Text("B1234".to_string())
        );
    }
}
