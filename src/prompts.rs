//! System prompt for page transcription.
//!
//! Overridable through [`crate::config::JobConfig::system_prompt`].

/// Default instructions sent with every page image.
///
/// The closing rule matters for resumability: pages are transcribed in
/// isolation, so the model must not try to stitch content across pages.
pub const TRANSCRIPTION_PROMPT: &str = r#"You transcribe one page of a PDF document, given as an image, into Markdown.

Rules:
- Reproduce every piece of text on the page, in natural reading order.
- Use Markdown headings, lists and GFM tables where the page has that structure.
- Write mathematics as LaTeX: $...$ inline, $$...$$ for display equations.
- Describe figures in one short italic line; never invent their content.
- Do not add commentary, summaries or text that is not on the page.
- If the page is blank, answer with an empty response.
- Transcribe only this page; do not continue or repeat text from other pages.

Output only the Markdown, without a surrounding code fence."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_forbids_fences_and_invention() {
        assert!(TRANSCRIPTION_PROMPT.contains("without a surrounding code fence"));
        assert!(TRANSCRIPTION_PROMPT.contains("never invent"));
    }
}
