//! External navigation (opening install/help pages)

use std::sync::RwLock;

/// Opens external URLs on behalf of the session manager
pub trait Navigator: Send + Sync {
    fn open(&self, url: &str);
}

/// Navigator that only logs the URL
#[derive(Debug, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn open(&self, url: &str) {
        tracing::info!(url = %url, "Opening external page");
    }
}

/// Navigator that records every URL it was asked to open
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    opened: RwLock<Vec<String>>,
}

impl RecordingNavigator {
    pub fn opened(&self) -> Vec<String> {
        self.opened.read().map(|o| o.clone()).unwrap_or_default()
    }
}

impl Navigator for RecordingNavigator {
    fn open(&self, url: &str) {
        if let Ok(mut opened) = self.opened.write() {
            opened.push(url.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_navigator() {
        let nav = RecordingNavigator::default();
        nav.open("https://plugwallet.ooo/");
        nav.open("https://example.com/help");
        assert_eq!(
            nav.opened(),
            vec!["https://plugwallet.ooo/", "https://example.com/help"]
        );
    }
}
