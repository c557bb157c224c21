// Keyword prefilter
//
// A multi-pattern Aho-Corasick pass over each normalized source. When no
// configured keyword appears anywhere, the expensive per-rule regex scan
// is skipped entirely and the request is CLEAN. Soundness contract: the
// keyword set must be a superset of the literal anchors of active rules,
// or the prefilter must be disabled.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use crate::config::PrefilterConfig;

pub struct KeywordPrefilter {
    enabled: bool,
    automaton: Option<AhoCorasick>,
    keywords: Vec<String>,
}

impl KeywordPrefilter {
    /// Build the automaton from the configured keyword set. Keywords are
    /// matched case-insensitively.
    pub fn new(config: &PrefilterConfig) -> Self {
        let enabled = config.enabled && !config.keywords.is_empty();
        let automaton = if enabled {
            Some(
                AhoCorasickBuilder::new()
                    .ascii_case_insensitive(true)
                    .match_kind(MatchKind::LeftmostLongest)
                    .build(&config.keywords)
                    .expect("prefilter keyword automaton failed to build"),
            )
        } else {
            None
        };
        Self {
            enabled,
            automaton,
            keywords: config.keywords.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    /// Returns the first keyword found in `text`, or None when the text
    /// cannot match any rule anchored on the keyword set.
    pub fn hit<'a>(&'a self, text: &str) -> Option<&'a str> {
        let automaton = self.automaton.as_ref()?;
        automaton
            .find(text)
            .map(|m| self.keywords[m.pattern().as_usize()].as_str())
    }

    /// True when at least one of the given sources contains a keyword.
    /// A disabled prefilter conservatively reports a hit so the full scan
    /// always runs.
    pub fn any_hit<'a, I>(&self, sources: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        if !self.enabled {
            return true;
        }
        sources.into_iter().any(|text| self.hit(text).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
