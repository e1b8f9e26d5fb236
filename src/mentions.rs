//! Entity-mention markup in questions and completions.
//!
//! Questions typed in the browser carry mentions either as `[type|qid:name]`
//! or as plain `[name]`. Completions returned by the QAC service carry one
//! `[...]` placeholder per entity, paired positionally with a QID list.

use crate::EntityIndex;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(?:[^\[\]|]*\|[^\[\]:]*:)?([^\[\]]*)\]").expect("valid mention regex")
});

/// Removes mention markup so only the entity names remain.
pub fn strip_entity_mentions(question: &str) -> String {
    let mut current = question.to_string();
    // Repeat until no markup is left so nested brackets also collapse.
    while MENTION_RE.is_match(&current) {
        current = MENTION_RE.replace_all(&current, "$1").into_owned();
    }
    current
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Placeholder(String),
}

/// A completion split into plain text and bracketed entity placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionText {
    segments: Vec<Segment>,
}

impl CompletionText {
    pub fn parse(completion: &str) -> Self {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = completion;
        while let Some(open) = rest.find('[') {
            let after_open = &rest[open + 1..];
            let Some(close) = after_open.find(']') else {
                break;
            };
            let inner = &after_open[..close];
            if let Some(nested) = inner.rfind('[') {
                // "[a [b]" keeps "[a " as text and treats "[b]" as the placeholder.
                text.push_str(&rest[..open + 1 + nested]);
                rest = &rest[open + 1 + nested..];
                continue;
            }
            text.push_str(&rest[..open]);
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Placeholder(inner.to_string()));
            rest = &after_open[close + 1..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(inner) => Some(inner.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Replaces the content of the final placeholder. Returns `false` when
    /// there is no placeholder to rewrite.
    pub fn replace_last_placeholder(&mut self, replacement: &str) -> bool {
        let last = self
            .segments
            .iter_mut()
            .rev()
            .find(|segment| matches!(segment, Segment::Placeholder(_)));
        match last {
            Some(Segment::Placeholder(inner)) => {
                *inner = replacement.to_string();
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for CompletionText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => f.write_str(text)?,
                Segment::Placeholder(inner) => write!(f, "[{inner}]")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wikified {
    pub text: String,
    pub urls: Vec<String>,
}

/// Rewrites the last placeholder of `completion` with the Wikipedia title of
/// the last QID and collects the article URLs of every resolved QID.
pub fn wikify_completion<S: AsRef<str>>(
    index: &EntityIndex,
    completion: &str,
    qids: &[S],
) -> Wikified {
    let mut parsed = CompletionText::parse(completion);
    let mut urls = Vec::new();
    let mut rewritten = false;
    for (position, qid) in qids.iter().enumerate() {
        let qid = qid.as_ref().trim();
        if qid.is_empty() {
            continue;
        }
        let info = index.info_by_qid(qid);
        let Some(url) = info.url() else {
            continue;
        };
        urls.push(url);
        if position + 1 == qids.len() {
            rewritten = parsed.replace_last_placeholder(&info.title);
        }
    }
    let text = if rewritten {
        parsed.to_string()
    } else {
        completion.to_string()
    };
    Wikified { text, urls }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WikiInfo;

    fn index() -> EntityIndex {
        let rows = [
            ("Q1", WikiInfo::new("Bar Film", "", "")),
            ("Q2", WikiInfo::new("Jane Doe", "", "")),
            ("Q3", WikiInfo::new("", "http://img/x.png", "no title")),
        ];
        let qid_info = rows.map(|(qid, info)| (qid.to_string(), info));
        EntityIndex::new(qid_info, Vec::new())
    }

    #[test]
    fn strips_typed_mentions() {
        assert_eq!(
            strip_entity_mentions("who directed [film|Q1:Bar Film]?"),
            "who directed Bar Film?"
        );
    }

    #[test]
    fn strips_plain_mentions() {
        assert_eq!(
            strip_entity_mentions("where was [Jane Doe] born in [Ulm]"),
            "where was Jane Doe born in Ulm"
        );
    }

    #[test]
    fn stripping_is_idempotent() {
        for question in [
            "plain question",
            "[a|Q1:x] and [y]",
            "[[nested]] brackets",
            "dangling [ bracket",
            "",
        ] {
            let once = strip_entity_mentions(question);
            assert_eq!(strip_entity_mentions(&once), once, "input {question:?}");
        }
    }

    #[test]
    fn parse_splits_text_and_placeholders() {
        let parsed = CompletionText::parse("who directed [Q1] and [Q2] ");
        assert_eq!(
            parsed.segments(),
            &[
                Segment::Text("who directed ".into()),
                Segment::Placeholder("Q1".into()),
                Segment::Text(" and ".into()),
                Segment::Placeholder("Q2".into()),
                Segment::Text(" ".into()),
            ]
        );
        assert_eq!(parsed.to_string(), "who directed [Q1] and [Q2] ");
    }

    #[test]
    fn unbalanced_brackets_stay_text() {
        let parsed = CompletionText::parse("a [b [c] d [e");
        assert_eq!(parsed.placeholders().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(parsed.to_string(), "a [b [c] d [e");
    }

    #[test]
    fn wikifies_last_placeholder() {
        let result = wikify_completion(&index(), "who directed [Q1] ", &["Q1"]);
        assert_eq!(result.text, "who directed [Bar Film] ");
        assert_eq!(result.urls, vec!["https://en.wikipedia.org/wiki/Bar_Film"]);
    }

    #[test]
    fn unresolved_qid_leaves_completion_unchanged() {
        let result = wikify_completion(&index(), "who directed [Q9] ", &["Q9"]);
        assert_eq!(result.text, "who directed [Q9] ");
        assert!(result.urls.is_empty());
    }

    #[test]
    fn only_the_last_placeholder_is_rewritten() {
        let result = wikify_completion(&index(), "did [Jane] star in [x]", &["Q2", "Q1"]);
        assert_eq!(result.text, "did [Jane] star in [Bar Film]");
        assert_eq!(result.urls.len(), 2);
    }

    #[test]
    fn unresolved_qids_are_skipped_but_others_kept() {
        let result = wikify_completion(&index(), "[a] and [b]", &["Q404", "Q2"]);
        assert_eq!(result.text, "[a] and [Jane Doe]");
        assert_eq!(result.urls, vec!["https://en.wikipedia.org/wiki/Jane_Doe"]);
    }

    #[test]
    fn empty_title_keeps_placeholder() {
        let result = wikify_completion(&index(), "show [x] ", &["Q3"]);
        assert_eq!(result.text, "show [x] ");
        assert!(result.urls.is_empty());
    }

    #[test]
    fn no_qids_is_a_no_op() {
        let result = wikify_completion::<&str>(&index(), "how tall is", &[]);
        assert_eq!(result.text, "how tall is");
        assert!(result.urls.is_empty());
    }
}
