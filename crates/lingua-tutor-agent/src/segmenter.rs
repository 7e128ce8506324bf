//! Streamed text → speakable sentence units.

/// Splits streamed fragments at `.`, `!` and `?`.
///
/// No abbreviation or decimal guard: "z.B." and "3.5" split too.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment and return every sentence it completed, leftmost first.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut units = Vec::new();
        while let Some(end) = self.buffer.find(['.', '!', '?']) {
            let rest = self.buffer.split_off(end + 1);
            units.push(std::mem::replace(&mut self.buffer, rest));
        }
        units
    }

    /// Text received since the last terminator.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// End of stream: the leftover text, if it holds anything but whitespace.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() { None } else { Some(rest) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_completes_on_last_fragment() {
        let mut segmenter = SentenceSegmenter::new();
        assert!(segmenter.push("Hallo").is_empty());
        assert!(segmenter.push(" Wie").is_empty());
        assert!(segmenter.push(" geht").is_empty());
        assert_eq!(segmenter.push(" es?"), vec!["Hallo Wie geht es?"]);
        assert!(segmenter.finish().is_none());
    }

    #[test]
    fn test_multiple_terminators_in_one_fragment() {
        let mut segmenter = SentenceSegmenter::new();
        assert_eq!(
            segmenter.push("Gut! Und dir? Ich"),
            vec!["Gut!", " Und dir?"]
        );
        assert_eq!(segmenter.pending(), " Ich");
        assert_eq!(segmenter.push(" auch."), vec![" Ich auch."]);
    }

    #[test]
    fn test_remainder_flushed_at_end() {
        let mut segmenter = SentenceSegmenter::new();
        assert_eq!(segmenter.push("Fertig. Was nun"), vec!["Fertig."]);
        assert_eq!(segmenter.finish().as_deref(), Some(" Was nun"));
        assert!(segmenter.finish().is_none());
    }

    #[test]
    fn test_whitespace_remainder_dropped() {
        let mut segmenter = SentenceSegmenter::new();
        segmenter.push("Ende.  \n");
        assert!(segmenter.finish().is_none());
    }

    #[test]
    fn test_no_abbreviation_guard() {
        let mut segmenter = SentenceSegmenter::new();
        assert_eq!(
            segmenter.push("Das kostet 3.5 Euro."),
            vec!["Das kostet 3.", "5 Euro."]
        );
        assert_eq!(segmenter.push("z.B. so"), vec!["z.", "B."]);
    }
}
