use std::fmt;

/// Media types of the simple-repository protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    PypiV1Json,
    PypiV1Html,
    TextHtml,
}

impl MediaType {
    /// Parse a media type from a `Content-Type` value (parameters stripped),
    /// returning `None` if the media type is not supported.
    pub fn from_content_type(s: &str) -> Option<Self> {
        let essence = s.split(';').next().unwrap_or(s).trim();
        match essence {
            "application/vnd.pypi.simple.v1+json" => Some(Self::PypiV1Json),
            "application/vnd.pypi.simple.v1+html" => Some(Self::PypiV1Html),
            "text/html" => Some(Self::TextHtml),
            _ => None,
        }
    }

    /// The `Accept` header sent to upstream indexes: JSON preferred, HTML
    /// accepted as fallback.
    #[inline]
    pub const fn accept() -> &'static str {
        // See: https://peps.python.org/pep-0691/#version-format-selection
        "application/vnd.pypi.simple.v1+json, application/vnd.pypi.simple.v1+html;q=0.2, text/html;q=0.01"
    }

    /// Negotiate the response form for an incoming `Accept` header: JSON
    /// when the client asks for the v1 JSON media type, HTML otherwise.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::TextHtml;
        };
        for part in accept.split(',') {
            let mut params = part.split(';');
            let essence = params.next().unwrap_or("").trim();
            if essence != "application/vnd.pypi.simple.v1+json" {
                continue;
            }
            let rejected = params.any(|p| {
                let p = p.trim();
                p == "q=0" || p == "q=0.0" || p == "q=0.00" || p == "q=0.000"
            });
            if !rejected {
                return Self::PypiV1Json;
            }
        }
        Self::TextHtml
    }

    pub fn is_json(self) -> bool {
        matches!(self, Self::PypiV1Json)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PypiV1Json => write!(f, "application/vnd.pypi.simple.v1+json"),
            Self::PypiV1Html => write!(f, "application/vnd.pypi.simple.v1+html"),
            Self::TextHtml => write!(f, "text/html"),
        }
    }
}
