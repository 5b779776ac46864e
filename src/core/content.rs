use serde::{Deserialize, Serialize};

/// Message content: either a plain string or an ordered list of typed parts.
/// Every consumer goes through the methods here instead of re-inspecting the
/// shape at each call site.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt: Option<String>,
    },
    Audio {
        url: String,
    },
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text(text.into())
    }

    /// Blank text, or an empty part list. A part list that carries only
    /// non-text parts (an image, say) is not empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.trim().is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }

    /// Length of the accumulated text, used to anchor tool calls against the
    /// text streamed so far.
    pub fn text_len(&self) -> usize {
        match self {
            Content::Text(text) => text.len(),
            Content::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    Part::Text { text } => text.len(),
                    _ => 0,
                })
                .sum(),
        }
    }

    /// Append a streamed text chunk, extending the trailing text run.
    pub fn push_text(&mut self, chunk: &str) {
        match self {
            Content::Text(text) => text.push_str(chunk),
            Content::Parts(parts) => match parts.last_mut() {
                Some(Part::Text { text }) => text.push_str(chunk),
                _ => parts.push(Part::Text {
                    text: chunk.to_string(),
                }),
            },
        }
    }

    /// Collapse to the concatenated text runs, dropping non-text parts.
    pub fn flatten_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Assemble content from raw input text plus already-encoded attachment
/// parts. Attachment encoding happens upstream; this only decides the shape.
pub fn build_content(text: &str, attachments: &[Part]) -> Content {
    if attachments.is_empty() {
        return Content::Text(text.to_string());
    }

    let mut parts = Vec::with_capacity(attachments.len() + 1);
    if !text.trim().is_empty() {
        parts.push(Part::Text {
            text: text.to_string(),
        });
    }
    parts.extend(attachments.iter().cloned());
    Content::Parts(parts)
}
