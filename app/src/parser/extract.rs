use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<label>Total progress:\s*)?\b(?P<percent>\d{1,3}(?:\.\d+)?)%")
        .expect("progress regex")
});

/// Printed by the engine after a checkpoint finished loading.
const LOAD_SUCCESS_MARKERS: &[&str] = &["Model loaded in", "Weights loaded in"];

/// Printed when a checkpoint could not be loaded.
const LOAD_FAILURE_MARKERS: &[&str] = &[
    "Failed to load checkpoint",
    "changing setting sd_model_checkpoint to",
    "Error verifying pickled file",
];

/// Default URL announcements, highest priority first.
pub const DEFAULT_URL_PATTERNS: &[(&str, &str)] = &[
    (
        r"Running on local URL:\s*(?P<url>https?://\S+)",
        "Running on local URL",
    ),
    (r"Running on (?P<url>https?://\S+)", "Running on"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
pub enum LoadOutcome {
    Success,
    Failure,
}

/// One way the engine announces its HTTP endpoint.
///
/// The regex is only tried when `required_substring` occurs in the text. The
/// URL is taken from the `url` capture group, or the first group if there is
/// no group with that name.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    regex: Regex,
    required_substring: String,
}

impl UrlPattern {
    pub fn new(regex: &str, required_substring: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(regex)?,
            required_substring: required_substring.to_string(),
        })
    }

    pub fn defaults() -> Vec<Self> {
        Self::compile_all(DEFAULT_URL_PATTERNS.iter().copied())
    }

    /// Compiles the given `(regex, required_substring)` pairs, dropping
    /// invalid ones with a warning.
    pub fn compile_all<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<Self> {
        pairs
            .into_iter()
            .filter_map(|(regex, required)| match Self::new(regex, required) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring invalid service URL pattern '{}': {}", regex, e);
                    None
                }
            })
            .collect()
    }

    fn capture<'t>(&self, text: &'t str) -> Option<&'t str> {
        if !text.contains(&self.required_substring) {
            return None;
        }
        let captures = self.regex.captures(text)?;
        captures
            .name("url")
            .or_else(|| captures.get(1))
            .or_else(|| captures.get(0))
            .map(|m| m.as_str())
    }
}

/// A percentage found in console output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReading {
    pub fraction: f64,
    /// Taken from a `Total progress:` bar rather than a per-step bar.
    pub labelled: bool,
}

/// Last percentage in `text` as a fraction. A `Total progress:` label wins
/// over per-step bars printed in the same text.
pub fn extract_progress(text: &str) -> Option<f64> {
    read_progress(text).map(|reading| reading.fraction)
}

/// Like [`extract_progress`], but also says whether the value was labelled.
pub fn read_progress(text: &str) -> Option<ProgressReading> {
    let mut last = None;
    let mut last_labelled = None;

    for captures in PROGRESS_RE.captures_iter(text) {
        let Some(value) = captures
            .name("percent")
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|v| (0.0..=100.0).contains(v))
        else {
            continue;
        };
        let fraction = value / 100.0;
        if captures.name("label").is_some() {
            last_labelled = Some(fraction);
        }
        last = Some(fraction);
    }

    last_labelled
        .map(|fraction| ProgressReading {
            fraction,
            labelled: true,
        })
        .or(last.map(|fraction| ProgressReading {
            fraction,
            labelled: false,
        }))
}

/// First valid URL found by the first matching pattern, in priority order.
pub fn extract_service_url(text: &str, patterns: &[UrlPattern]) -> Option<Url> {
    patterns
        .iter()
        .filter_map(|pattern| pattern.capture(text))
        .find_map(validate_url)
}

/// The later of any success or failure marker decides.
pub fn detect_load_outcome(text: &str) -> Option<LoadOutcome> {
    let last_position = |markers: &[&str]| markers.iter().filter_map(|m| text.rfind(m)).max();

    match (
        last_position(LOAD_SUCCESS_MARKERS),
        last_position(LOAD_FAILURE_MARKERS),
    ) {
        (None, None) => None,
        (Some(_), None) => Some(LoadOutcome::Success),
        (None, Some(_)) => Some(LoadOutcome::Failure),
        (Some(success), Some(failure)) if success > failure => Some(LoadOutcome::Success),
        (Some(_), Some(_)) => Some(LoadOutcome::Failure),
    }
}

fn validate_url(candidate: &str) -> Option<Url> {
    let trimmed = candidate.trim_end_matches(['.', ',', ';', ')', '"', '\'']);
    let url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Some(url),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_progress() {
        let test_cases = vec![
            ("plain", "10%", Some(0.10)),
            ("last match wins", "10% then 45%", Some(0.45)),
            (
                "label wins over step bar",
                "Total progress:  40%|####| 8/20\n 90%|#########| 18/20",
                Some(0.40),
            ),
            ("decimal", "Downloading 12.5%", Some(0.125)),
            ("out of range", "999%", None),
            ("no percentage", "Loading weights", None),
            ("embedded in word", "x10%", None),
        ];

        for (description, text, expected) in test_cases {
            assert_eq!(extract_progress(text), expected, "{}", description);
        }
    }

    #[test]
    fn test_progress_sequence() {
        let values: Vec<f64> = ["10%", "45%", "100%"]
            .iter()
            .filter_map(|chunk| extract_progress(chunk))
            .collect();
        assert_eq!(values, vec![0.10, 0.45, 1.00]);
    }

    #[test]
    fn test_read_progress_reports_label() {
        let labelled = read_progress("Total progress:  50%|#####     | 10/20").unwrap();
        assert_eq!(labelled.fraction, 0.50);
        assert!(labelled.labelled);

        let step = read_progress("100%|##########| 20/20").unwrap();
        assert_eq!(step.fraction, 1.00);
        assert!(!step.labelled);
    }

    #[test]
    fn test_service_url_priority() {
        let patterns = UrlPattern::defaults();
        let text = "Running on local URL:  http://127.0.0.1:7860\nRunning on http://0.0.0.0:9999";
        let url = extract_service_url(text, &patterns).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:7860/");
    }

    #[test]
    fn test_service_url_generic_fallback() {
        let patterns = UrlPattern::defaults();
        let url = extract_service_url("Running on http://127.0.0.1:7860", &patterns).unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(7860));
    }

    #[test]
    fn test_required_substring_gates_regex() {
        let patterns = vec![UrlPattern::new(r"(https?://\S+)", "API listening").unwrap()];
        assert!(extract_service_url("see http://example.com", &patterns).is_none());
        assert!(extract_service_url("API listening at http://example.com", &patterns).is_some());
    }

    #[test]
    fn test_invalid_capture_falls_through_to_next_pattern() {
        let patterns = vec![
            UrlPattern::new(r"endpoint=(\S+)", "endpoint=").unwrap(),
            UrlPattern::new(r"Running on (https?://\S+)", "Running on").unwrap(),
        ];
        let text = "endpoint=not-a-url\nRunning on http://localhost:7860";
        let url = extract_service_url(text, &patterns).unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
    }

    #[test]
    fn test_trailing_punctuation_is_trimmed() {
        let patterns = UrlPattern::defaults();
        let url = extract_service_url("Running on http://127.0.0.1:7860.", &patterns).unwrap();
        assert_eq!(url.port(), Some(7860));
    }

    #[test]
    fn test_invalid_patterns_are_dropped() {
        let patterns = UrlPattern::compile_all([("(unclosed", "x"), (r"(\S+)", "y")]);
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn test_detect_load_outcome() {
        let test_cases = vec![
            ("success", "Model loaded in 3.1s (load weights: 1.2s)", Some(LoadOutcome::Success)),
            ("failure", "Failed to load checkpoint, restoring previous", Some(LoadOutcome::Failure)),
            (
                "later marker wins",
                "Failed to load checkpoint\nWeights loaded in 2.0s",
                Some(LoadOutcome::Success),
            ),
            ("nothing", "Applying attention optimization", None),
        ];

        for (description, text, expected) in test_cases {
            assert_eq!(detect_load_outcome(text), expected, "{}", description);
        }
    }
}
