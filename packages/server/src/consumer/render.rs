//! Frame content rendering: markdown with extensions → chat blocks.
//!
//! Fenced code blocks whose info string carries `{ action: "Label" }` become
//! action buttons; the rest of the body is converted to the chat mrkdwn
//! dialect and split on blank lines into section blocks. The mapping is a
//! flat table of block-kind rules, not a tree walk.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag};
use slack::models::{Block, ButtonElement};
use tracing::warn;

pub const MAX_TEXT_LEN: usize = 3000;
pub const MAX_BLOCKS: usize = 50;
pub const MAX_BUTTON_VALUE_LEN: usize = 2000;

const TRUNCATION_SUFFIX: &str = "…[truncated]";

/// Text plus blocks ready for a chat update call.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub text: String,
    pub blocks: Vec<Block>,
}

impl RenderedMessage {
    /// Append a link button, reusing a trailing actions block when present.
    pub fn push_link_button(&mut self, label: &str, action_id: &str, url: &str) {
        let button = ButtonElement::link(label, action_id, url);
        match self.blocks.last_mut() {
            Some(Block::Actions { elements }) => elements.push(button),
            _ => {
                if self.blocks.len() < MAX_BLOCKS {
                    self.blocks.push(Block::Actions {
                        elements: vec![button],
                    });
                }
            }
        }
    }
}

/// Render one frame's content.
pub fn render_content(content: &str) -> RenderedMessage {
    let (stripped, buttons) = extract_action_blocks(content);
    let mrkdwn = markdown_to_mrkdwn(&stripped);
    let text = truncate_text(&mrkdwn, MAX_TEXT_LEN);

    let section_cap = if buttons.is_empty() {
        MAX_BLOCKS
    } else {
        MAX_BLOCKS - 1
    };
    let mut blocks: Vec<Block> = text
        .split("\n\n")
        .filter(|section| !section.trim().is_empty())
        .take(section_cap)
        .map(Block::section_mrkdwn)
        .collect();

    if !buttons.is_empty() {
        blocks.push(Block::Actions { elements: buttons });
    }

    RenderedMessage { text, blocks }
}

struct ActionFence {
    lang: String,
    label: String,
    show: bool,
}

/// Pull action fences out of the content, returning the remaining text and
/// the synthesized buttons.
fn extract_action_blocks(content: &str) -> (String, Vec<ButtonElement>) {
    let mut kept: Vec<String> = Vec::new();
    let mut buttons = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let fence = line
            .trim_start()
            .strip_prefix("```")
            .and_then(parse_fence_info);
        let Some(fence) = fence else {
            kept.push(line.to_string());
            continue;
        };

        let mut body_lines = Vec::new();
        let mut closed = false;
        for inner in lines.by_ref() {
            if inner.trim() == "```" {
                closed = true;
                break;
            }
            body_lines.push(inner.to_string());
        }

        if !closed {
            // Unterminated fence: leave the text untouched.
            kept.push(line.to_string());
            kept.extend(body_lines);
            continue;
        }

        let body = body_lines.join("\n");
        let value = if fence.lang == "blockkit" {
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(parsed) => serde_json::to_string(&parsed).unwrap_or(body.clone()),
                Err(e) => {
                    warn!(error = %e, "invalid blockkit body, using literal value");
                    body.clone()
                }
            }
        } else {
            body.clone()
        };

        if value.chars().count() > MAX_BUTTON_VALUE_LEN {
            warn!(
                label = %fence.label,
                len = value.chars().count(),
                "dropping action button, value too long"
            );
        } else {
            let action_id = format!("action_{}", buttons.len());
            buttons.push(ButtonElement::with_value(&fence.label, action_id, value));
        }

        if fence.show {
            kept.push(format!("```{}", fence.lang));
            kept.extend(body_lines);
            kept.push("```".to_string());
        }
    }

    (kept.join("\n"), buttons)
}

/// Parse `lang { action: "Label", show?: bool }` fence info.
fn parse_fence_info(info: &str) -> Option<ActionFence> {
    let brace = info.find('{')?;
    let lang = info[..brace].trim().to_string();
    let body = &info[brace..];

    let label = quoted_value_after(body, "action")?;
    let show = body
        .find("show")
        .map(|at| body[at + 4..].trim_start().trim_start_matches(':').trim_start())
        .map(|rest| rest.starts_with("true"))
        .unwrap_or(false);

    Some(ActionFence { lang, label, show })
}

fn quoted_value_after(body: &str, key: &str) -> Option<String> {
    let at = body.find(key)?;
    let rest = body[at + key.len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Convert standard markdown to the chat mrkdwn dialect.
fn markdown_to_mrkdwn(markdown: &str) -> String {
    let parser = Parser::new_ext(markdown, Options::empty());
    let mut out = String::new();
    // Ordered lists carry their next number; unordered push None.
    let mut list_stack: Vec<Option<u64>> = Vec::new();

    for event in parser {
        match event {
            Event::Start(Tag::Paragraph) => {}
            Event::End(Tag::Paragraph) => out.push_str("\n\n"),
            Event::Start(Tag::Heading(..)) => out.push('*'),
            Event::End(Tag::Heading(..)) => out.push_str("*\n\n"),
            Event::Start(Tag::Strong) | Event::End(Tag::Strong) => out.push('*'),
            Event::Start(Tag::Emphasis) | Event::End(Tag::Emphasis) => out.push('_'),
            Event::Start(Tag::CodeBlock(kind)) => {
                out.push_str("```");
                if let CodeBlockKind::Fenced(lang) = kind {
                    out.push_str(&lang);
                }
                out.push('\n');
            }
            Event::End(Tag::CodeBlock(_)) => out.push_str("```\n\n"),
            Event::Start(Tag::List(start)) => list_stack.push(start),
            Event::End(Tag::List(_)) => {
                list_stack.pop();
                out.push('\n');
            }
            Event::Start(Tag::Item) => match list_stack.last_mut() {
                Some(Some(n)) => {
                    out.push_str(&format!("{n}. "));
                    *n += 1;
                }
                _ => out.push_str("• "),
            },
            Event::End(Tag::Item) => out.push('\n'),
            Event::Start(Tag::Link(_, dest, _)) => {
                out.push('<');
                out.push_str(&dest);
                out.push('|');
            }
            Event::End(Tag::Link(..)) => out.push('>'),
            Event::Text(text) => out.push_str(&text),
            Event::Code(code) => {
                out.push('`');
                out.push_str(&code);
                out.push('`');
            }
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Rule => out.push_str("---\n\n"),
            _ => {}
        }
    }

    out.trim_end().to_string()
}

fn truncate_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(TRUNCATION_SUFFIX.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_SUFFIX);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use slack::models::TextObject;

    fn section_text(block: &Block) -> &str {
        match block {
            Block::Section {
                text: TextObject::Mrkdwn { text },
            } => text,
            _ => panic!("expected mrkdwn section"),
        }
    }

    #[test]
    fn single_action_fence_becomes_one_button() {
        let content = "Run this:\n```bash { action: \"Deploy\" }\nkubectl apply -f app.yaml\n```\ndone";
        let rendered = render_content(content);

        let Some(Block::Actions { elements }) = rendered.blocks.last() else {
            panic!("expected trailing actions block");
        };
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text.as_str(), "Deploy");
        assert_eq!(
            elements[0].value.as_deref(),
            Some("kubectl apply -f app.yaml")
        );
        // The fence itself is removed from the text.
        assert!(!rendered.text.contains("kubectl"));
    }

    #[test]
    fn oversized_button_value_is_dropped() {
        let long_value = "x".repeat(MAX_BUTTON_VALUE_LEN + 1);
        let content = format!("```sh {{ action: \"Big\" }}\n{long_value}\n```");
        let rendered = render_content(&content);
        assert!(rendered
            .blocks
            .iter()
            .all(|b| !matches!(b, Block::Actions { .. })));
    }

    #[test]
    fn button_value_at_limit_is_kept() {
        let value = "y".repeat(MAX_BUTTON_VALUE_LEN);
        let content = format!("```sh {{ action: \"Max\" }}\n{value}\n```");
        let rendered = render_content(&content);
        let Some(Block::Actions { elements }) = rendered.blocks.last() else {
            panic!("expected actions block");
        };
        assert_eq!(elements[0].value.as_deref(), Some(value.as_str()));
    }

    #[test]
    fn blockkit_fence_parses_body_as_json() {
        let content = "```blockkit { action: \"Open\" }\n{ \"kind\": \"modal\",\n  \"title\": \"Hi\" }\n```";
        let rendered = render_content(content);
        let Some(Block::Actions { elements }) = rendered.blocks.last() else {
            panic!("expected actions block");
        };
        // Compact re-serialization proves it went through a JSON parse.
        assert_eq!(
            elements[0].value.as_deref(),
            Some(r#"{"kind":"modal","title":"Hi"}"#)
        );
    }

    #[test]
    fn show_flag_keeps_fence_in_text() {
        let content = "```sh { action: \"Run\", show: true }\necho hi\n```";
        let rendered = render_content(content);
        assert!(rendered.text.contains("echo hi"));
        assert!(rendered
            .blocks
            .iter()
            .any(|b| matches!(b, Block::Actions { .. })));
    }

    #[test]
    fn plain_code_fences_are_untouched() {
        let content = "```rust\nfn main() {}\n```";
        let rendered = render_content(content);
        assert!(rendered.text.contains("fn main() {}"));
        assert!(rendered
            .blocks
            .iter()
            .all(|b| !matches!(b, Block::Actions { .. })));
    }

    #[test]
    fn markdown_maps_to_mrkdwn_dialect() {
        let markdown = "# Title\n\nSome **bold** and *italic* and `code`.\n\n[docs](https://example.com)";
        let out = markdown_to_mrkdwn(markdown);
        assert!(out.contains("*Title*"));
        assert!(out.contains("*bold*"));
        assert!(out.contains("_italic_"));
        assert!(out.contains("`code`"));
        assert!(out.contains("<https://example.com|docs>"));
    }

    #[test]
    fn lists_render_bullets_and_numbers() {
        let out = markdown_to_mrkdwn("- one\n- two\n\n1. first\n2. second");
        assert!(out.contains("• one"));
        assert!(out.contains("• two"));
        assert!(out.contains("1. first"));
        assert!(out.contains("2. second"));
    }

    #[test]
    fn mrkdwn_preserves_plain_text() {
        let markdown = "Some **bold** text with `code` and a [link](https://x.dev)";
        let out = markdown_to_mrkdwn(markdown);
        for word in ["Some", "bold", "text", "code", "link"] {
            assert!(out.contains(word), "missing {word} in {out}");
        }
    }

    #[test]
    fn blank_lines_split_sections() {
        let rendered = render_content("first paragraph\n\nsecond paragraph");
        assert_eq!(rendered.blocks.len(), 2);
        assert_eq!(section_text(&rendered.blocks[0]), "first paragraph");
        assert_eq!(section_text(&rendered.blocks[1]), "second paragraph");
    }

    #[test]
    fn long_text_is_truncated_with_suffix() {
        let content = "word ".repeat(2000);
        let rendered = render_content(&content);
        assert!(rendered.text.chars().count() <= MAX_TEXT_LEN);
        assert!(rendered.text.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn block_count_is_capped() {
        let content = (0..80)
            .map(|i| format!("section {i}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let rendered = render_content(&content);
        assert!(rendered.blocks.len() <= MAX_BLOCKS);
    }

    #[test]
    fn push_link_button_reuses_actions_block() {
        let content = "```sh { action: \"Run\" }\necho hi\n```";
        let mut rendered = render_content(content);
        rendered.push_link_button("Edit", "edit_branch", "https://example.com/tree/b");

        let actions: Vec<_> = rendered
            .blocks
            .iter()
            .filter(|b| matches!(b, Block::Actions { .. }))
            .collect();
        assert_eq!(actions.len(), 1);
        let Block::Actions { elements } = actions[0] else {
            unreachable!()
        };
        assert_eq!(elements.len(), 2);
    }

    #[test]
    fn push_link_button_appends_when_no_actions_exist() {
        let mut rendered = render_content("just text");
        rendered.push_link_button("Edit", "edit_branch", "https://example.com/tree/b");
        assert!(matches!(rendered.blocks.last(), Some(Block::Actions { .. })));
    }

    #[test]
    fn fence_info_without_action_is_ignored() {
        assert!(parse_fence_info("rust").is_none());
        assert!(parse_fence_info("rust { show: true }").is_none());
        let fence = parse_fence_info("sh { action: \"Go\", show: true }").unwrap();
        assert_eq!(fence.lang, "sh");
        assert_eq!(fence.label, "Go");
        assert!(fence.show);
    }
}
