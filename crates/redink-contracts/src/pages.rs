use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Cover,
    #[default]
    Content,
    Summary,
}

impl PageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PageKind::Cover => "cover",
            PageKind::Content => "content",
            PageKind::Summary => "summary",
        }
    }
}

/// One outline entry mapped to one generated image.
///
/// The index is the page's identity inside a task; it is also the stem of
/// the image file written for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub index: usize,
    #[serde(rename = "type", default)]
    pub kind: PageKind,
    pub content: String,
}

impl Page {
    pub fn new(index: usize, kind: PageKind, content: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            content: content.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.content.trim().is_empty() {
            return Err(format!("page {} has no content", self.index));
        }
        Ok(())
    }
}

pub fn parse_pages(raw: &str) -> anyhow::Result<Vec<Page>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    // Accept either a bare array or an outline response carrying `pages`.
    let pages = match value {
        serde_json::Value::Object(mut obj) => obj
            .remove("pages")
            .ok_or_else(|| anyhow::anyhow!("outline payload has no `pages` field"))?,
        other => other,
    };
    let pages: Vec<Page> = serde_json::from_value(pages)?;
    if pages.is_empty() {
        anyhow::bail!("pages must not be empty");
    }
    Ok(pages)
}
