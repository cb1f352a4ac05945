use url::Url;

/// Clean up what the user typed into the URL field.
///
/// Surrounding whitespace and trailing prose punctuation are dropped and
/// http(s) URLs are normalized. Anything else (e.g. `ytsearch:` queries) is
/// passed through trimmed, since yt-dlp decides what it accepts.
pub fn clean_input_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let candidate = trim_trailing_punct(trimmed);
    normalize_http_url(candidate).unwrap_or_else(|| trimmed.to_string())
}

/// Normalize a presumed http(s) URL.
///
/// - Only accepts http/https
/// - Lowercases scheme and host, removes default ports (done by `Url::parse`)
/// - Removes fragments (`#...`); they mean nothing to the downloader
pub fn normalize_http_url(input: &str) -> Option<String> {
    let mut url = Url::parse(input.trim()).ok()?;

    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.host_str()?;

    url.set_fragment(None);
    Some(url.to_string())
}

/// Example: `https://example.com/foo),` -> `https://example.com/foo`
fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end_matches(|ch: char| {
        matches!(
            ch,
            ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '"' | '\''
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_whitespace() {
        assert_eq!(
            clean_input_url("  https://example.com/watch?v=1 \n"),
            "https://example.com/watch?v=1"
        );
        assert_eq!(clean_input_url("   "), "");
    }

    #[test]
    fn trims_trailing_punct() {
        assert_eq!(
            clean_input_url("https://example.com/foo),"),
            "https://example.com/foo"
        );
    }

    #[test]
    fn strips_fragment() {
        assert_eq!(
            clean_input_url("https://example.com/watch?v=1#t=10"),
            "https://example.com/watch?v=1"
        );
    }

    #[test]
    fn lowercases_host_and_removes_default_ports() {
        assert_eq!(
            clean_input_url("HTTPS://Example.COM:443/Path"),
            "https://example.com/Path"
        );
        assert_eq!(
            clean_input_url("http://example.com:80/x"),
            "http://example.com/x"
        );
    }

    #[test]
    fn passes_through_non_http_input() {
        assert_eq!(clean_input_url(" ytsearch:rust talk "), "ytsearch:rust talk");
        assert_eq!(normalize_http_url("ftp://example.com/x"), None);
    }
}
