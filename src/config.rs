//! Scanner settings rendered into the page by the server template.

use serde::Deserialize;

use crate::ScanError;

/// Id of the `<script type="application/json">` element holding the config.
pub const CONFIG_ELEMENT_ID: &str = "scanner-config";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Element the component is mounted into.
    pub root_id: String,
    pub button_id: String,
    pub container_id: String,
    pub video_id: String,
    pub csrf_token: String,
    /// Submission URL; the current page when unset.
    pub endpoint: Option<String>,
    /// Analyse every Nth video frame.
    pub scan_period: u32,
    /// A repeat of the last decoded code is ignored for this long.
    pub refractory_period_ms: u32,
    pub mirror: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            root_id: "scanner-root".into(),
            button_id: "startScanner".into(),
            container_id: "scanner-container".into(),
            video_id: "scanner".into(),
            csrf_token: String::new(),
            endpoint: None,
            scan_period: 5,
            refractory_period_ms: 5000,
            mirror: false,
        }
    }
}

impl ScannerConfig {
    pub fn from_json(text: &str) -> Result<Self, ScanError> {
        let mut config: Self = serde_json::from_str(text)?;
        config.scan_period = config.scan_period.max(1);
        Ok(config)
    }

    /// Reads the config element from `document`. A page without one gets the
    /// defaults.
    pub fn from_document(document: &web_sys::Document) -> Result<Self, ScanError> {
        match document
            .get_element_by_id(CONFIG_ELEMENT_ID)
            .and_then(|el| el.text_content())
        {
            Some(text) if !text.trim().is_empty() => Self::from_json(&text),
            _ => Ok(Self::default()),
        }
    }

    pub fn scanner_options(&self) -> ScannerOptions {
        ScannerOptions {
            video_id: self.video_id.clone(),
            scan_period: self.scan_period.max(1),
            refractory_period_ms: self.refractory_period_ms,
            mirror: self.mirror,
        }
    }
}

/// What a scanner instance is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerOptions {
    pub video_id: String,
    pub scan_period: u32,
    pub refractory_period_ms: u32,
    pub mirror: bool,
}
