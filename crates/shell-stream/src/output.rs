//! Line-oriented output container
//!
//! Shell output is a list of lines, and most consumers only want a slice of
//! it: the mount table entry for one device, everything except a header,
//! the last non-empty line. [`Output`] stores the lines and provides the
//! filtering, slicing and lookup helpers for that kind of post-processing.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Ordered collection of output lines with manipulation helpers
///
/// All manipulation methods work in place and return `&mut Self` so they can
/// be chained:
///
/// ```
/// use shell_stream::Output;
///
/// let mut out = Output::from(vec!["Filesystem  Size".into(), "/dev/sda1  20G".into()]);
/// out.discard_contains("Filesystem", false).trim();
/// assert_eq!(out.lines(), ["/dev/sda1  20G"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    lines: Vec<String>,
}

impl Output {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a plain sequence in each line
    pub fn replace(&mut self, find: &str, replacement: &str) -> &mut Self {
        for line in &mut self.lines {
            *line = line.replace(find, replacement);
        }
        self
    }

    /// Replace every regex match in each line
    pub fn replace_regex(&mut self, re: &Regex, replacement: &str) -> &mut Self {
        for line in &mut self.lines {
            *line = re.replace_all(line, replacement).into_owned();
        }
        self
    }

    /// Keep only lines containing a sequence
    pub fn retain_contains(&mut self, needle: &str, ignore_case: bool) -> &mut Self {
        let needle_lower = ignore_case.then(|| needle.to_lowercase());
        self.lines.retain(|line| match &needle_lower {
            Some(n) => line.to_lowercase().contains(n),
            None => line.contains(needle),
        });
        self
    }

    /// Drop all lines containing a sequence
    pub fn discard_contains(&mut self, needle: &str, ignore_case: bool) -> &mut Self {
        let needle_lower = ignore_case.then(|| needle.to_lowercase());
        self.lines.retain(|line| match &needle_lower {
            Some(n) => !line.to_lowercase().contains(n),
            None => !line.contains(needle),
        });
        self
    }

    /// Keep only lines matching a regex
    pub fn retain_matching(&mut self, re: &Regex) -> &mut Self {
        self.lines.retain(|line| re.is_match(line));
        self
    }

    /// Drop all lines matching a regex
    pub fn discard_matching(&mut self, re: &Regex) -> &mut Self {
        self.lines.retain(|line| !re.is_match(line));
        self
    }

    /// Keep only the lines inside `[start, stop)`
    ///
    /// Negative positions count from the end, so `slice(1, -1)` drops the
    /// first and last line.
    pub fn slice(&mut self, start: isize, stop: isize) -> &mut Self {
        let len = self.lines.len() as isize;
        let begin = (if start < 0 { len + start } else { start }).clamp(0, len) as usize;
        let end = (if stop < 0 { len + stop } else { stop }).clamp(0, len) as usize;

        if begin >= end {
            self.lines.clear();
        } else {
            self.lines.drain(end..);
            self.lines.drain(..begin);
        }
        self
    }

    /// Reverse the line order
    pub fn reverse(&mut self) -> &mut Self {
        self.lines.reverse();
        self
    }

    /// Trim each line and drop the ones left empty
    pub fn trim(&mut self) -> &mut Self {
        self.lines = self
            .lines
            .iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        self
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the container holds no lines
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// All lines as a slice
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Consume the container and return the lines
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    /// Join all lines with a separator
    pub fn join(&self, separator: &str) -> String {
        self.lines.join(separator)
    }

    /// A single trimmed line; negative positions count from the end
    ///
    /// With `skip_empty`, the lookup walks past blank lines (towards the
    /// start when `pos` is negative, towards the end otherwise).
    pub fn line(&self, pos: isize, skip_empty: bool) -> Option<&str> {
        if self.lines.is_empty() {
            return None;
        }

        let len = self.lines.len() as isize;
        let mut at = if pos < 0 { len + pos } else { pos };
        let step = if pos < 0 { -1 } else { 1 };

        while at >= 0 && at < len {
            let candidate = self.lines[at as usize].trim();
            if !skip_empty || !candidate.is_empty() {
                return Some(candidate);
            }
            at += step;
        }

        None
    }

    /// The last line, trimmed
    pub fn last_line(&self) -> Option<&str> {
        self.line(-1, false)
    }
}

impl From<Vec<String>> for Output {
    fn from(lines: Vec<String>) -> Self {
        Self { lines }
    }
}

impl std::fmt::Display for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Output {
        Output::from(vec![
            "one".to_string(),
            "two".to_string(),
            "three".to_string(),
            "four".to_string(),
        ])
    }

    #[test]
    fn slice_with_negative_bounds() {
        let mut out = sample();
        out.slice(1, -1);
        assert_eq!(out.lines(), ["two", "three"]);
    }

    #[test]
    fn slice_collapses_when_empty_range() {
        let mut out = sample();
        out.slice(3, 1);
        assert!(out.is_empty());
    }

    #[test]
    fn line_accepts_negative_positions() {
        let out = sample();
        assert_eq!(out.line(0, false), Some("one"));
        assert_eq!(out.line(-1, false), Some("four"));
        assert_eq!(out.line(-5, false), None);
    }

    #[test]
    fn line_skips_empty_lines() {
        let out = Output::from(vec!["value".to_string(), "  ".to_string(), String::new()]);
        assert_eq!(out.line(-1, true), Some("value"));
        assert_eq!(out.line(-1, false), Some(""));
    }

    #[test]
    fn trim_drops_blank_lines() {
        let mut out = Output::from(vec!["  a  ".to_string(), " ".to_string(), "b".to_string()]);
        out.trim();
        assert_eq!(out.lines(), ["a", "b"]);
    }

    #[test]
    fn retain_and_discard_by_pattern() {
        let re = Regex::new(r"^/dev/").unwrap();
        let mut out = Output::from(vec![
            "/dev/sda1 20G".to_string(),
            "tmpfs 1G".to_string(),
            "/dev/sdb2 50G".to_string(),
        ]);
        out.retain_matching(&re);
        assert_eq!(out.len(), 2);

        out.discard_contains("SDB2", true);
        assert_eq!(out.lines(), ["/dev/sda1 20G"]);
    }

    #[test]
    fn chained_manipulation() {
        let mut out = sample();
        out.reverse().slice(0, 2).replace("o", "0");
        assert_eq!(out.lines(), ["f0ur", "three"]);
    }
}
