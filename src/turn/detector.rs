//! Input-request detection
//!
//! The backend does not flag a response that asks the user something, so the
//! decision is a heuristic over the response text. It sits behind
//! [`InputRequestDetector`] so a structured signal can replace it.

use regex::{Regex, RegexBuilder};
use std::fmt;

/// Decides whether agent text is asking the user for input
pub trait InputRequestDetector: Send + Sync {
    fn is_input_request(&self, text: &str) -> bool;
}

/// Phrases the backend emits when it needs something from the user
pub const DEFAULT_TRIGGER_PHRASES: &[&str] = &[
    "please provide",
    "please select",
    "please confirm",
    "please choose",
    "please specify",
    "please tell me",
    "could you provide",
    "请提供",
    "请选择",
    "请确认",
    "请告诉我",
    "请输入",
    "请补充",
];

/// Phrases marking a reply as a stand-in for a result still being produced.
///
/// Only explicit requests to wait: words like "processing" also appear in
/// final answers.
pub const DEFAULT_PLACEHOLDER_PHRASES: &[&str] = &["please wait", "请稍候", "请稍等", "正在处理"];

/// Case-insensitive literal phrase matcher
#[derive(Clone)]
pub struct PhraseMatcher {
    phrases: Vec<String>,
    pattern: Option<Regex>,
}

impl fmt::Debug for PhraseMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhraseMatcher")
            .field("phrases", &self.phrases)
            .finish()
    }
}

impl PhraseMatcher {
    pub fn new<I, S>(phrases: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let pattern = if phrases.is_empty() {
            None
        } else {
            let alternation = phrases
                .iter()
                .map(|p| regex::escape(p))
                .collect::<Vec<_>>()
                .join("|");
            Some(RegexBuilder::new(&alternation).case_insensitive(true).build()?)
        };
        Ok(Self { phrases, pattern })
    }

    pub fn trigger_phrases() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_TRIGGER_PHRASES)
    }

    pub fn placeholder_phrases() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_PLACEHOLDER_PHRASES)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(text))
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

impl InputRequestDetector for PhraseMatcher {
    fn is_input_request(&self, text: &str) -> bool {
        self.matches(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_triggers() {
        let matcher = PhraseMatcher::trigger_phrases().unwrap();
        assert!(matcher.is_input_request("Please provide your destination"));
        assert!(matcher.is_input_request("To continue, PLEASE SELECT a hotel."));
        assert!(matcher.is_input_request("请选择您的出发日期"));
        assert!(!matcher.is_input_request("Hi"));
        assert!(!matcher.is_input_request("Here is your itinerary for Paris."));
    }

    #[test]
    fn test_phrases_are_literal() {
        let matcher = PhraseMatcher::new(["a.b", "(x)"]).unwrap();
        assert!(matcher.matches("see a.b here"));
        assert!(!matcher.matches("see axb here"));
        assert!(matcher.matches("call (x)"));
    }

    #[test]
    fn test_empty_matcher_never_matches() {
        let matcher = PhraseMatcher::new(["  ", ""]).unwrap();
        assert!(matcher.phrases().is_empty());
        assert!(!matcher.matches("please provide"));
    }

    #[test]
    fn test_placeholders() {
        let matcher = PhraseMatcher::placeholder_phrases().unwrap();
        assert!(matcher.matches("Your plan is being generated, please wait..."));
        assert!(matcher.matches("正在处理您的请求"));
        assert!(!matcher.matches("Your plan is ready."));
        assert!(!matcher.matches("I finished processing your flights."));
        assert!(!matcher.matches("Booking in progress was confirmed: seat 12A."));
    }
}
