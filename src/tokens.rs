//! Approximate token accounting for invocation logs.

/// Counts tokens in a piece of text. `None` means the counter could not
/// produce an estimate; callers record 0 in that case.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> Option<u64>;
}

/// Character-class estimate close to BPE tokenizers on prose: each CJK
/// ideograph, kana or hangul syllable is about one token, other text runs
/// about four characters per token.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> Option<u64> {
        let mut wide = 0u64;
        let mut narrow = 0u64;
        for c in text.chars() {
            if is_wide(c) {
                wide += 1;
            } else {
                narrow += 1;
            }
        }
        Some(wide + narrow.div_ceil(4))
    }
}

fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF     // hiragana, katakana
        | 0x3400..=0x4DBF   // CJK extension A
        | 0x4E00..=0x9FFF   // CJK unified ideographs
        | 0xAC00..=0xD7AF   // hangul syllables
        | 0xF900..=0xFAFF   // CJK compatibility ideographs
        | 0xFF00..=0xFFEF   // fullwidth forms
        | 0x20000..=0x2FA1F // CJK extensions B-F and supplement
    )
}

/// Count with `counter`, degrading to 0 when no estimate is available.
pub fn count_or_zero(counter: Option<&dyn TokenCounter>, text: &str) -> u64 {
    counter.and_then(|c| c.count(text)).unwrap_or(0)
}
