//! URL utilities for consistent URL handling
//!
//! Normalizes base URLs so endpoint construction never produces double
//! slashes regardless of how the backend URL was configured.

/// Normalize a base URL by removing trailing slashes.
///
/// # Examples
///
/// ```
/// use tandem::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://chat.example.com/api"), "https://chat.example.com/api");
/// assert_eq!(normalize_base_url("https://chat.example.com/api/"), "https://chat.example.com/api");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path.
///
/// # Examples
///
/// ```
/// use tandem::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://chat.example.com/api/", "chat"),
///     "https://chat.example.com/api/chat"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_any_number_of_trailing_slashes() {
        assert_eq!(
            normalize_base_url("https://chat.example.com/api///"),
            "https://chat.example.com/api"
        );
        assert_eq!(normalize_base_url("https://chat.example.com"), "https://chat.example.com");
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn construct_joins_without_double_slashes() {
        assert_eq!(
            construct_api_url("https://chat.example.com/api", "/chat/stop"),
            "https://chat.example.com/api/chat/stop"
        );
        assert_eq!(
            construct_api_url("https://chat.example.com/api/", "conversations"),
            "https://chat.example.com/api/conversations"
        );
    }
}
