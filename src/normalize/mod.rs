// Text canonicalization pipeline
//
// Ten stages applied in a fixed order; each stage receives the output of
// the previous one and may contribute to the flag set and diff summary:
//
//  1. NFKC compatibility folding
//  2. BOM strip + edge whitespace trim
//  3. Zero-width removal
//  4. Bidi override neutralization
//  5. Unicode tag character removal
//  6. Homoglyph folding
//  7. Excessive-whitespace collapse
//  8. Control character filter
//  9. Base64 blob detection (non-mutating)
// 10. PDF artifact stripping
//
// Ordering matters: NFKC must precede homoglyph folding so compatibility
// forms collapse first, and zero-width removal must precede bidi
// stripping so bidi markers cannot hide inside zero-width sequences.
//
// The pipeline is a pure function of input and configuration, and
// idempotent with respect to content: normalizing an already-normalized
// string returns it unchanged (the mask and diff reset).

use regex::Regex;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

use crate::config::NormalizeConfig;

// ---------------------------------------------------------------------------
// Mask alphabet
// ---------------------------------------------------------------------------

/// Ordinary character, untouched by any marking stage.
pub const MASK_ORDINARY: char = '.';
/// A zero-width character was removed immediately before this position.
pub const MASK_ZERO_WIDTH: char = 'Z';
/// An invisible character (bidi, tag, control) was removed before this position.
pub const MASK_INVISIBLE: char = 'I';
/// This character was folded from a homoglyph to its ASCII analog.
pub const MASK_HOMOGLYPH: char = 'H';

/// Bytes kept from the raw input as the `original` snapshot.
const ORIGINAL_SNAPSHOT_MAX_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Obfuscation indicators raised while normalizing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeFlags {
    pub zero_width_present: bool,
    pub homoglyph_present: bool,
    pub bidi_present: bool,
    pub bom_stripped: bool,
    pub base64_blob_present: bool,
    pub pdf_artifact_stripped: bool,
    pub excessive_whitespace: bool,
    pub unicode_tag_chars_present: bool,
    pub replacement_char_present: bool,
}

/// Per-stage counts of characters removed or replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub nfkc_changed: bool,
    pub trimmed: usize,
    pub zero_width_removed: usize,
    pub bidi_removed: usize,
    pub tag_chars_removed: usize,
    pub homoglyphs_folded: usize,
    pub whitespace_collapsed: usize,
    pub control_chars_removed: usize,
    pub pdf_artifacts_removed: usize,
}

/// Canonicalized text with provenance.
///
/// `char_mask` has exactly one cell per character of `normalized`, drawn
/// from the fixed mask alphabet. Removal stages collapse the removed
/// position onto the next surviving character; the first stage that acts
/// at a position wins and later stages never overwrite its mark.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    /// Bounded snapshot of the raw input (first 4 KiB).
    pub original: String,
    pub normalized: String,
    pub char_mask: String,
    pub diff: DiffSummary,
    pub flags: NormalizeFlags,
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("input of {size} bytes exceeds the normalizer limit of {limit} bytes")]
    Oversize { size: usize, limit: usize },
}

// ---------------------------------------------------------------------------
// Trait: Normalizer
// ---------------------------------------------------------------------------

/// Pure text normalizer. Implementations must be Send + Sync so they can
/// be shared across request tasks.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, input: &str) -> Result<NormalizedText, NormalizeError>;
}

// ---------------------------------------------------------------------------
// Implementation: PipelineNormalizer
// ---------------------------------------------------------------------------

pub struct PipelineNormalizer {
    config: NormalizeConfig,
    base64_blob: Regex,
}

impl PipelineNormalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        let pattern = format!(r"[A-Za-z0-9+/]{{{},}}={{0,2}}", config.base64_min_len.max(8));
        let base64_blob = Regex::new(&pattern).expect("base64 blob pattern is invalid");
        Self {
            config,
            base64_blob,
        }
    }
}

impl Default for PipelineNormalizer {
    fn default() -> Self {
        Self::new(NormalizeConfig::default())
    }
}

impl Normalizer for PipelineNormalizer {
    fn normalize(&self, input: &str) -> Result<NormalizedText, NormalizeError> {
        if input.len() > self.config.max_input_bytes {
            return Err(NormalizeError::Oversize {
                size: input.len(),
                limit: self.config.max_input_bytes,
            });
        }

        let mut flags = NormalizeFlags::default();
        let mut diff = DiffSummary::default();

        if input.contains('\u{FFFD}') {
            flags.replacement_char_present = true;
        }

        // Stage 1: NFKC compatibility folding.
        let folded: String = input.nfkc().collect();
        diff.nfkc_changed = folded != input;
        let mut text = Masked::from_str(&folded);

        // Stage 2: BOM strip + edge whitespace trim.
        if text.chars.first() == Some(&'\u{FEFF}') {
            text.remove_front(1);
            flags.bom_stripped = true;
        }
        diff.trimmed += text.trim_edges();

        // Stage 3: zero-width removal.
        diff.zero_width_removed = text.remove_matching(is_zero_width, MASK_ZERO_WIDTH);
        flags.zero_width_present = diff.zero_width_removed > 0;

        // Stage 4: bidi override neutralization.
        diff.bidi_removed = text.remove_matching(is_bidi_control, MASK_INVISIBLE);
        flags.bidi_present = diff.bidi_removed > 0;

        // Stage 5: Unicode tag character removal.
        diff.tag_chars_removed = text.remove_matching(is_tag_char, MASK_INVISIBLE);
        flags.unicode_tag_chars_present = diff.tag_chars_removed > 0;

        // Stage 6: homoglyph folding.
        diff.homoglyphs_folded = text.fold_homoglyphs();
        flags.homoglyph_present = diff.homoglyphs_folded > 0;

        // Stage 7: excessive-whitespace collapse.
        diff.whitespace_collapsed = text.collapse_whitespace(self.config.whitespace_run_threshold);
        flags.excessive_whitespace = diff.whitespace_collapsed > 0;

        // Stage 8: control character filter.
        diff.control_chars_removed = text.remove_matching(is_filtered_control, MASK_INVISIBLE);

        // Stage 9: base64 blob detection (non-mutating).
        let current = text.to_string();
        flags.base64_blob_present = self.base64_blob.is_match(&current);

        // Stage 10: PDF artifact stripping.
        diff.pdf_artifacts_removed = text.strip_pdf_artifacts();
        flags.pdf_artifact_stripped = diff.pdf_artifacts_removed > 0;

        // Removal stages may have exposed new edge whitespace; trim it so
        // the pipeline stays idempotent.
        diff.trimmed += text.trim_edges();

        let (normalized, char_mask) = text.into_parts();
        Ok(NormalizedText {
            original: bounded_snapshot(input),
            normalized,
            char_mask,
            diff,
            flags,
        })
    }
}

fn bounded_snapshot(input: &str) -> String {
    if input.len() <= ORIGINAL_SNAPSHOT_MAX_BYTES {
        return input.to_string();
    }
    let mut end = ORIGINAL_SNAPSHOT_MAX_BYTES;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    input[..end].to_string()
}

// ---------------------------------------------------------------------------
// Internal: masked character buffer
// ---------------------------------------------------------------------------

/// Text with a parallel mask, kept aligned through every mutation.
struct Masked {
    chars: Vec<char>,
    mask: Vec<char>,
}

impl Masked {
    fn from_str(s: &str) -> Self {
        let chars: Vec<char> = s.chars().collect();
        let mask = vec![MASK_ORDINARY; chars.len()];
        Self { chars, mask }
    }

    fn to_string(&self) -> String {
        self.chars.iter().collect()
    }

    fn into_parts(self) -> (String, String) {
        (self.chars.iter().collect(), self.mask.iter().collect())
    }

    fn remove_front(&mut self, count: usize) {
        self.chars.drain(..count);
        self.mask.drain(..count);
    }

    /// Drop leading and trailing whitespace. Returns the number of
    /// characters removed.
    fn trim_edges(&mut self) -> usize {
        let mut removed = 0;
        while self.chars.last().is_some_and(|c| c.is_whitespace()) {
            self.chars.pop();
            self.mask.pop();
            removed += 1;
        }
        let lead = self
            .chars
            .iter()
            .take_while(|c| c.is_whitespace())
            .count();
        if lead > 0 {
            self.remove_front(lead);
            removed += lead;
        }
        removed
    }

    /// Remove every character matching `pred`, marking the next surviving
    /// character with `mark` (first-stage-wins: an existing non-ordinary
    /// mark is kept). Returns the number of characters removed.
    fn remove_matching(&mut self, pred: impl Fn(char) -> bool, mark: char) -> usize {
        let mut out_chars = Vec::with_capacity(self.chars.len());
        let mut out_mask = Vec::with_capacity(self.mask.len());
        let mut pending = false;
        let mut removed = 0;

        for (&c, &m) in self.chars.iter().zip(self.mask.iter()) {
            if pred(c) {
                removed += 1;
                pending = true;
            } else {
                let m = if pending && m == MASK_ORDINARY { mark } else { m };
                pending = false;
                out_chars.push(c);
                out_mask.push(m);
            }
        }

        self.chars = out_chars;
        self.mask = out_mask;
        removed
    }

    /// Replace confusable characters with their ASCII analog in place.
    fn fold_homoglyphs(&mut self) -> usize {
        let mut folded = 0;
        for (c, m) in self.chars.iter_mut().zip(self.mask.iter_mut()) {
            if let Some(ascii) = homoglyph_to_ascii(*c) {
                *c = ascii;
                if *m == MASK_ORDINARY {
                    *m = MASK_HOMOGLYPH;
                }
                folded += 1;
            }
        }
        folded
    }

    /// Collapse whitespace runs longer than `threshold` to a single space,
    /// or to a single newline when the run contains one. Returns the
    /// number of characters removed.
    fn collapse_whitespace(&mut self, threshold: usize) -> usize {
        let mut out_chars = Vec::with_capacity(self.chars.len());
        let mut out_mask = Vec::with_capacity(self.mask.len());
        let mut removed = 0;
        let mut i = 0;

        while i < self.chars.len() {
            if self.chars[i].is_whitespace() {
                let start = i;
                while i < self.chars.len() && self.chars[i].is_whitespace() {
                    i += 1;
                }
                let run = i - start;
                if run > threshold {
                    let replacement = if self.chars[start..i].contains(&'\n') {
                        '\n'
                    } else {
                        ' '
                    };
                    out_chars.push(replacement);
                    out_mask.push(self.mask[start]);
                    removed += run - 1;
                } else {
                    out_chars.extend_from_slice(&self.chars[start..i]);
                    out_mask.extend_from_slice(&self.mask[start..i]);
                }
            } else {
                out_chars.push(self.chars[i]);
                out_mask.push(self.mask[i]);
                i += 1;
            }
        }

        self.chars = out_chars;
        self.mask = out_mask;
        removed
    }

    /// Remove text-extraction artifacts:
    /// - a hyphen or soft hyphen whose following whitespace contains a
    ///   newline (a word broken across lines) together with that whitespace
    /// - stray soft hyphens
    /// - runs of three or more "- " repetitions
    ///
    /// Returns the number of characters removed.
    fn strip_pdf_artifacts(&mut self) -> usize {
        let mut out_chars = Vec::with_capacity(self.chars.len());
        let mut out_mask = Vec::with_capacity(self.mask.len());
        let mut removed = 0;
        let mut i = 0;
        let len = self.chars.len();

        while i < len {
            let c = self.chars[i];

            if c == '-' || c == '\u{00AD}' {
                // Hyphenated line break: hyphen, whitespace containing \n.
                let mut j = i + 1;
                let mut saw_newline = false;
                while j < len && self.chars[j].is_whitespace() {
                    if self.chars[j] == '\n' {
                        saw_newline = true;
                    }
                    j += 1;
                }
                if saw_newline {
                    removed += j - i;
                    i = j;
                    continue;
                }
            }

            if c == '\u{00AD}' {
                removed += 1;
                i += 1;
                continue;
            }

            if c == '-' {
                // Repeated "- " bullet-noise runs.
                let mut j = i;
                let mut reps = 0;
                while j + 1 < len && self.chars[j] == '-' && self.chars[j + 1] == ' ' {
                    reps += 1;
                    j += 2;
                }
                if reps >= 3 {
                    if j < len && self.chars[j] == '-' {
                        j += 1;
                    }
                    removed += j - i;
                    i = j;
                    continue;
                }
            }

            out_chars.push(c);
            out_mask.push(self.mask[i]);
            i += 1;
        }

        self.chars = out_chars;
        self.mask = out_mask;
        removed
    }
}

// ---------------------------------------------------------------------------
// Internal: character classes
// ---------------------------------------------------------------------------

fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' // Zero-width space
        | '\u{200C}' // Zero-width non-joiner
        | '\u{200D}' // Zero-width joiner
        | '\u{2060}' // Word joiner
        | '\u{FEFF}' // Zero-width no-break space
        | '\u{180E}' // Mongolian vowel separator
    )
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

fn is_tag_char(c: char) -> bool {
    matches!(c, '\u{E0000}'..='\u{E007F}')
}

/// C0/C1 controls except LF and TAB, plus DEL.
fn is_filtered_control(c: char) -> bool {
    if c == '\n' || c == '\t' {
        return false;
    }
    matches!(c, '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}')
}

/// Map a visually-identical Cyrillic or Greek character to its ASCII
/// analog. Only one-to-one confusables are folded so the mask stays
/// aligned one cell per character.
fn homoglyph_to_ascii(c: char) -> Option<char> {
    match c {
        // Cyrillic lowercase
        '\u{0430}' => Some('a'), // а
        '\u{0441}' => Some('c'), // с
        '\u{0435}' => Some('e'), // е
        '\u{043E}' => Some('o'), // о
        '\u{0440}' => Some('p'), // р
        '\u{0445}' => Some('x'), // х
        '\u{0443}' => Some('y'), // у
        '\u{0456}' => Some('i'), // і (Ukrainian)
        '\u{0458}' => Some('j'), // ј (Serbian)
        '\u{0455}' => Some('s'), // ѕ (Macedonian)
        // Cyrillic uppercase
        '\u{0410}' => Some('A'), // А
        '\u{0412}' => Some('B'), // В
        '\u{0415}' => Some('E'), // Е
        '\u{041A}' => Some('K'), // К
        '\u{041C}' => Some('M'), // М
        '\u{041D}' => Some('H'), // Н
        '\u{041E}' => Some('O'), // О
        '\u{0420}' => Some('P'), // Р
        '\u{0421}' => Some('C'), // С
        '\u{0422}' => Some('T'), // Т
        '\u{0425}' => Some('X'), // Х
        // Greek lowercase
        '\u{03B1}' => Some('a'), // α
        '\u{03BF}' => Some('o'), // ο
        '\u{03B9}' => Some('i'), // ι
        '\u{03BD}' => Some('v'), // ν
        '\u{03C5}' => Some('u'), // υ
        // Greek uppercase
        '\u{0391}' => Some('A'), // Α
        '\u{0392}' => Some('B'), // Β
        '\u{0395}' => Some('E'), // Ε
        '\u{0396}' => Some('Z'), // Ζ
        '\u{0397}' => Some('H'), // Η
        '\u{0399}' => Some('I'), // Ι
        '\u{039A}' => Some('K'), // Κ
        '\u{039C}' => Some('M'), // Μ
        '\u{039D}' => Some('N'), // Ν
        '\u{039F}' => Some('O'), // Ο
        '\u{03A1}' => Some('P'), // Ρ
        '\u{03A4}' => Some('T'), // Τ
        '\u{03A5}' => Some('Y'), // Υ
        '\u{03A7}' => Some('X'), // Χ
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
