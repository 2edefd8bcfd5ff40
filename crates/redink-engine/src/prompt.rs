use redink_contracts::pages::{Page, PageKind};

/// Context shared by every page of one run.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub user_topic: Option<&'a str>,
    pub full_outline: Option<&'a str>,
}

fn role_line(kind: PageKind) -> &'static str {
    match kind {
        PageKind::Cover => {
            "Design the cover page: a bold headline layout that makes the topic obvious at a glance."
        }
        PageKind::Content => {
            "Design a content page: lay the text out clearly with supporting illustrations."
        }
        PageKind::Summary => {
            "Design the closing summary page: recap the key points with a clean call to action."
        }
    }
}

pub fn build_page_prompt(page: &Page, context: &PromptContext<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(role_line(page.kind));
    prompt.push_str("\n\nPage content:\n");
    prompt.push_str(page.content.trim());

    if let Some(topic) = non_blank(context.user_topic) {
        prompt.push_str("\n\nOriginal topic from the user:\n");
        prompt.push_str(topic);
    }
    if let Some(outline) = non_blank(context.full_outline) {
        prompt.push_str("\n\nFull outline of the document (keep this page consistent with it):\n");
        prompt.push_str(outline);
    }
    prompt.push_str("\n\nRender every piece of text legibly and keep the page vertically composed.");
    prompt
}

/// Wrap a prompt so the provider matches the attached reference's style.
pub fn with_style_reference(prompt: &str) -> String {
    format!(
        "Use the attached image as the visual style reference (palette, layout, typography and \
decorative elements) and produce a new image in the same style.\n\n\
Content for the new image:\n{prompt}\n\n\
Requirements:\n\
1. Keep the same visual style and design language as the reference.\n\
2. Keep the color scheme consistent with the reference.\n\
3. Keep layout and decoration consistent.\n\
4. Follow the new content, not the reference's content."
    )
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
