//! Substitute responses shown in place of blocked content

use crate::accountability::BlockType;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use url::Url;

/// 1x1 transparent PNG served in place of blocked images
pub const TRANSPARENT_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

const BLOCK_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{{TITLE}}</title>
</head>
<body>
<h1>{{TITLE}}</h1>
<p>{{REASON}}</p>
<p>Address: <code>{{URL}}</code></p>
{{CATEGORIES}}
{{UNBLOCK}}
{{RELAXED}}
</body>
</html>
"#;

const CERTIFICATE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Untrusted certificate</title>
</head>
<body>
<h1>Untrusted certificate</h1>
<p>The certificate presented by <code>{{HOST}}</code> could not be verified.</p>
<p>Thumbprint: <code>{{THUMBPRINT}}</code></p>
<ul>{{ERRORS}}</ul>
<p>If you trust this site, approve the certificate from the netveil tray application.</p>
</body>
</html>
"#;

/// Everything a URL, text, image or schedule block page can show
#[derive(Debug, Clone, Default)]
pub struct BlockPage<'a> {
    pub block_type: Option<BlockType>,
    pub url: &'a str,
    pub category: Option<&'a str>,
    pub applied_categories: &'a [String],
    pub trigger: Option<&'a str>,
    pub device_name: Option<&'a str>,
    pub token: Option<&'a str>,
    /// Management server base URL; the unblock link is omitted without it
    pub unblock_base: Option<&'a str>,
    /// Offer a relaxed policy (category relaxable and bypasses remain)
    pub relaxed_available: bool,
}

impl BlockPage<'_> {
    pub fn render(&self) -> String {
        let (title, reason) = match self.block_type {
            Some(BlockType::TimeRestriction) => (
                "Access restricted",
                "Internet access is not allowed at this time.".to_string(),
            ),
            Some(BlockType::TextTrigger) => (
                "Page blocked",
                format!(
                    "This page contains content in the category {}.",
                    html_escape(self.category.unwrap_or("unknown"))
                ),
            ),
            Some(BlockType::ImageClassification) => {
                ("Image blocked", "This image was classified as objectionable.".to_string())
            }
            Some(BlockType::BadCertificate) => (
                "Untrusted certificate",
                "The site presented a certificate that could not be verified.".to_string(),
            ),
            Some(BlockType::Url) | None => (
                "Site blocked",
                format!(
                    "This site is in the category {}.",
                    html_escape(self.category.unwrap_or("unknown"))
                ),
            ),
        };

        let categories = if self.applied_categories.is_empty() {
            String::new()
        } else {
            let items: String = self
                .applied_categories
                .iter()
                .map(|c| format!("<li>{}</li>", html_escape(c)))
                .collect();
            format!("<p>Matched categories:</p><ul>{items}</ul>")
        };

        let unblock = self
            .unblock_link()
            .map(|link| format!(r#"<p><a href="{}">Request a review</a></p>"#, html_escape(&link)))
            .unwrap_or_default();

        let relaxed = if self.relaxed_available {
            "<p>A relaxed policy is available from the netveil tray application.</p>"
        } else {
            ""
        };

        BLOCK_TEMPLATE
            .replace("{{TITLE}}", title)
            .replace("{{REASON}}", &reason)
            .replace("{{URL}}", &html_escape(self.url))
            .replace("{{CATEGORIES}}", &categories)
            .replace("{{UNBLOCK}}", &unblock)
            .replace("{{RELAXED}}", relaxed)
    }

    /// Deep link to the management server's review form
    pub fn unblock_link(&self) -> Option<String> {
        let base = self.unblock_base?;
        let base = if base.ends_with('/') {
            Url::parse(base).ok()?
        } else {
            Url::parse(&format!("{base}/")).ok()?
        };
        let mut link = base.join("unblock").ok()?;
        {
            let mut query = link.query_pairs_mut();
            query.append_pair("device", &URL_SAFE_NO_PAD.encode(self.device_name.unwrap_or_default()));
            query.append_pair("url", &URL_SAFE_NO_PAD.encode(self.url));
            query.append_pair("trigger", &URL_SAFE_NO_PAD.encode(self.trigger.unwrap_or_default()));
            if let Some(token) = self.token {
                query.append_pair("token", token);
            }
        }
        Some(link.into())
    }
}

pub fn render_bad_certificate_page(host: &str, thumbprint: &str, errors: &[String]) -> String {
    let items: String = errors
        .iter()
        .map(|e| format!("<li>{}</li>", html_escape(e)))
        .collect();
    CERTIFICATE_TEMPLATE
        .replace("{{HOST}}", &html_escape(host))
        .replace("{{THUMBPRINT}}", &html_escape(thumbprint))
        .replace("{{ERRORS}}", &items)
}

pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_url() {
        let page = BlockPage {
            block_type: Some(BlockType::Url),
            url: "http://bad.example/<script>",
            category: Some("Gambling"),
            ..Default::default()
        }
        .render();
        assert!(page.contains("Site blocked"));
        assert!(page.contains("Gambling"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
    }

    #[test]
    fn test_unblock_link() {
        let page = BlockPage {
            block_type: Some(BlockType::TextTrigger),
            url: "http://bad.example/",
            trigger: Some("poker"),
            device_name: Some("LAPTOP-1"),
            token: Some("tok"),
            unblock_base: Some("https://manage.example.com/api"),
            ..Default::default()
        };
        let link = Url::parse(&page.unblock_link().unwrap()).unwrap();
        assert_eq!(link.path(), "/api/unblock");
        let pairs: Vec<(String, String)> = link.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("device".to_string(), URL_SAFE_NO_PAD.encode("LAPTOP-1"))));
        assert!(pairs.contains(&("url".to_string(), URL_SAFE_NO_PAD.encode("http://bad.example/"))));
        assert!(pairs.contains(&("trigger".to_string(), URL_SAFE_NO_PAD.encode("poker"))));
        assert!(pairs.contains(&("token".to_string(), "tok".to_string())));
    }

    #[test]
    fn test_no_link_without_server() {
        let page = BlockPage {
            url: "http://x.example/",
            relaxed_available: true,
            ..Default::default()
        };
        assert!(page.unblock_link().is_none());
        assert!(page.render().contains("relaxed policy"));
    }

    #[test]
    fn test_certificate_page() {
        let page = render_bad_certificate_page("nas.local", "AB12", &["UntrustedRoot".to_string()]);
        assert!(page.contains("nas.local"));
        assert!(page.contains("AB12"));
        assert!(page.contains("<li>UntrustedRoot</li>"));
    }

    #[test]
    fn test_png_signature() {
        assert_eq!(&TRANSPARENT_PNG[..8], b"\x89PNG\r\n\x1a\n");
    }
}
