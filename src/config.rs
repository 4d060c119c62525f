//! Configuration helpers and protocol constants

use std::env;
use std::time::Duration;

/// Backend used when neither the environment nor the caller provides one
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:9000";

/// Model used for chat requests when none is configured
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Model used for live sessions when none is configured
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.0-flash-live-001";

/// Image generation model, sent without a system instruction or tools
pub const IMAGE_GENERATION_MODEL: &str = "gemini-2.0-flash-preview-image-generation";

/// Voice requested for audio modalities when none is configured
pub const DEFAULT_VOICE: &str = "Puck";

/// Fixed lifetime of a live session, counted from `setupComplete`
pub const LIVE_SESSION_DURATION: Duration = Duration::from_secs(30 * 60);

/// Functions whose calls render as an image placeholder instead of a call part
pub const IMAGE_FUNCTIONS: &[&str] = &["generateImage", "editImage"];

/// Title given to a conversation before its first exchange completes
pub const NEW_CHAT_TITLE: &str = "New Chat";

/// Maximum characters kept when deriving a title from the first prompt
pub const TITLE_MAX_CHARS: usize = 30;

/// Environment variable overriding the backend base URL
pub const ENV_BACKEND_URL: &str = "APSARA_BACKEND_URL";

/// Environment variable overriding the model
pub const ENV_MODEL: &str = "APSARA_MODEL";

/// Returns true when `name` is one of the image-producing functions
pub fn is_image_function(name: &str) -> bool {
    IMAGE_FUNCTIONS.contains(&name)
}

/// Get the backend base URL from environment variable or fallback
///
/// Priority:
/// 1. `APSARA_BACKEND_URL` environment variable
/// 2. fallback parameter
/// 3. [`DEFAULT_BACKEND_URL`]
///
/// # Examples
///
/// ```rust,no_run
/// use apsara_stream::get_backend_url;
///
/// let url = get_backend_url(None);
/// let url = get_backend_url(Some("http://chat.internal:9000"));
/// ```
pub fn get_backend_url(fallback: Option<&str>) -> String {
    if let Ok(url) = env::var(ENV_BACKEND_URL) {
        return url;
    }

    fallback.unwrap_or(DEFAULT_BACKEND_URL).to_string()
}

/// Get the model name from environment variable or fallback
///
/// Priority:
/// 1. `APSARA_MODEL` environment variable (if prefer_env is true)
/// 2. fallback parameter
///
/// # Examples
///
/// ```rust,no_run
/// use apsara_stream::get_model;
///
/// let model = get_model(Some("gemini-2.5-pro"), true);
/// let model = get_model(Some("gemini-2.5-flash"), false);
/// ```
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    if prefer_env {
        if let Ok(model) = env::var(ENV_MODEL) {
            return Some(model);
        }
    }

    fallback.map(|s| s.to_string())
}

/// Derive a conversation title from the first user prompt
pub fn title_from_prompt(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_functions() {
        assert!(is_image_function("generateImage"));
        assert!(is_image_function("editImage"));
        assert!(!is_image_function("getWeather"));
        assert!(!is_image_function("GenerateImage"));
    }

    #[test]
    fn test_get_backend_url_with_fallback() {
        if env::var(ENV_BACKEND_URL).is_ok() {
            return;
        }
        assert_eq!(get_backend_url(Some("http://custom:8080")), "http://custom:8080");
        assert_eq!(get_backend_url(None), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn test_get_model_ignores_env_when_not_preferred() {
        assert_eq!(
            get_model(Some("gemini-2.5-pro"), false),
            Some("gemini-2.5-pro".to_string())
        );
        assert_eq!(get_model(None, false), None);
    }

    #[test]
    fn test_title_from_prompt() {
        assert_eq!(title_from_prompt("  Hello there  "), "Hello there");
        let long = "Explain the borrow checker in terms a beginner understands";
        let title = title_from_prompt(long);
        assert_eq!(title, "Explain the borrow checker in ...");
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn test_live_session_duration() {
        assert_eq!(LIVE_SESSION_DURATION.as_secs(), 1800);
    }
}
