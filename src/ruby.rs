//! Ruby-annotation segmentation for episode bodies.
//!
//! Two source conventions are recognized, both funnelled through the bracket
//! form after markup normalization:
//!
//! - `｜base《reading》` anywhere in a line (ASCII `|` accepted too),
//! - a line without closing punctuation followed by a line that is wholly
//!   wrapped in parentheses, which becomes the reading of the whole line.
//!
//! The output is a flat list of styled runs; every rendered line ends with a
//! [`RunKind::LineBreak`] run.

use std::sync::OnceLock;

use html2text::render::TrivialDecorator;
use regex::Regex;

/// Wide enough that `html2text` never wraps a paragraph of body text.
const PLAIN_TEXT_WIDTH: usize = 4096;

const TERMINAL_PUNCTUATION: &[char] = &['。', '、', '．', '，', '.', ','];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Text,
    RubyBase,
    RubyReading,
    LineBreak,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub text: String,
    pub kind: RunKind,
    pub font_size: f32,
    /// Readings are drawn raised above the baseline.
    pub superscript: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotatedText {
    pub runs: Vec<Run>,
}

impl AnnotatedText {
    /// Base/reading pairs in order of appearance.
    pub fn ruby_pairs(&self) -> Vec<(&str, &str)> {
        self.runs
            .windows(2)
            .filter(|w| w[0].kind == RunKind::RubyBase && w[1].kind == RunKind::RubyReading)
            .map(|w| (w[0].text.as_str(), w[1].text.as_str()))
            .collect()
    }

    pub fn line_count(&self) -> usize {
        self.runs.iter().filter(|r| r.kind == RunKind::LineBreak).count()
    }

    /// Text with readings dropped.
    pub fn plain_text(&self) -> String {
        self.runs
            .iter()
            .filter_map(|r| match r.kind {
                RunKind::Text | RunKind::RubyBase => Some(r.text.as_str()),
                RunKind::LineBreak => Some("\n"),
                RunKind::RubyReading => None,
            })
            .collect()
    }

    /// Text with readings inlined as `base《reading》`, for terminals.
    pub fn inline_text(&self) -> String {
        let mut out = String::new();
        for run in &self.runs {
            match run.kind {
                RunKind::Text | RunKind::RubyBase => out.push_str(&run.text),
                RunKind::RubyReading => {
                    out.push('《');
                    out.push_str(&run.text);
                    out.push('》');
                }
                RunKind::LineBreak => out.push('\n'),
            }
        }
        out
    }
}

fn ruby_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<ruby[^>]*>(.*?)</ruby\s*>").expect("valid ruby tag regex"))
}

fn rt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<rt[^>]*>(.*?)</rt\s*>").expect("valid rt regex"))
}

fn rp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<rp[^>]*>.*?</rp\s*>").expect("valid rp regex"))
}

fn any_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[a-zA-Z/!?][^>]*>").expect("valid tag regex"))
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&(#[0-9]+|#x[0-9a-fA-F]+|[a-zA-Z]+);").expect("valid entity regex"))
}

fn line_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<(br|p|div|h[1-6]|li|ul|ol|table|tr|pre|blockquote)\b")
            .expect("valid line tag regex")
    })
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[｜|]([^｜|《》\n]+)《([^《》\n]+)》").expect("valid bracket regex"))
}

fn paren_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[(（]([^()（）]+)[)）]\s*$").expect("valid paren regex"))
}

/// Rewrite `<ruby>` markup into the bracket form and reduce every other tag
/// to plain text.
pub fn normalize_markup(body: &str) -> String {
    let bracketed = ruby_tag_re().replace_all(body, |caps: &regex::Captures| {
        let inner = rp_re().replace_all(&caps[1], "");
        let reading: String = rt_re()
            .captures_iter(&inner)
            .map(|c| strip_tags(&c[1]))
            .collect();
        let base = strip_tags(&rt_re().replace_all(&inner, ""));
        if reading.trim().is_empty() {
            base
        } else {
            format!("｜{}《{}》", base.trim(), reading.trim())
        }
    });

    if !any_tag_re().is_match(&bracketed) && !entity_re().is_match(&bracketed) {
        return bracketed.into_owned();
    }

    // Without any line-level tags the source newlines are the only line
    // structure, and html2text would fold them into spaces.
    let html = if line_tag_re().is_match(&bracketed) {
        bracketed.into_owned()
    } else {
        bracketed.replace('\n', "<br>")
    };

    let converted = html2text::config::with_decorator(TrivialDecorator::new())
        .string_from_read(html.as_bytes(), PLAIN_TEXT_WIDTH);
    match converted {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("Failed to convert episode markup to text: {}", e);
            strip_tags(&html)
        }
    }
}

fn strip_tags(html: &str) -> String {
    any_tag_re().replace_all(html, "").into_owned()
}

/// Segment `text` into styled runs. Call again whenever the sizes change.
pub fn render(text: &str, base_size: f32, ruby_size: f32) -> AnnotatedText {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Renderer {
        runs: Vec::new(),
        base_size,
        ruby_size,
    };

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if bracket_re().is_match(line) {
            out.bracket_line(line);
            i += 1;
        } else if let Some(reading) = lines.get(i + 1).and_then(|next| paired_reading(line, next)) {
            out.paired_line(line, reading);
            i += 2;
        } else {
            out.text(line);
            i += 1;
        }
        out.line_break();
    }

    AnnotatedText { runs: out.runs }
}

/// Normalize markup and render in one step.
pub fn render_body(body: &str, base_size: f32, ruby_size: f32) -> AnnotatedText {
    render(&normalize_markup(body), base_size, ruby_size)
}

fn paired_reading<'a>(line: &str, next: &'a str) -> Option<&'a str> {
    let content = line.trim_end();
    if content.trim_start().is_empty() || content.ends_with(TERMINAL_PUNCTUATION) {
        return None;
    }
    paren_line_re()
        .captures(next)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|reading| !reading.is_empty())
}

struct Renderer {
    runs: Vec<Run>,
    base_size: f32,
    ruby_size: f32,
}

impl Renderer {
    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.runs.push(Run {
            text: text.to_string(),
            kind: RunKind::Text,
            font_size: self.base_size,
            superscript: false,
        });
    }

    fn ruby(&mut self, base: &str, reading: &str) {
        self.runs.push(Run {
            text: base.to_string(),
            kind: RunKind::RubyBase,
            font_size: self.base_size,
            superscript: false,
        });
        self.runs.push(Run {
            text: reading.to_string(),
            kind: RunKind::RubyReading,
            font_size: self.ruby_size,
            superscript: true,
        });
    }

    fn line_break(&mut self) {
        self.runs.push(Run {
            text: "\n".to_string(),
            kind: RunKind::LineBreak,
            font_size: self.base_size,
            superscript: false,
        });
    }

    fn bracket_line(&mut self, line: &str) {
        let mut last = 0;
        for caps in bracket_re().captures_iter(line) {
            let (Some(whole), Some(base), Some(reading)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            self.text(&line[last..whole.start()]);
            self.ruby(base.as_str(), reading.as_str());
            last = whole.end();
        }
        self.text(&line[last..]);
    }

    fn paired_line(&mut self, line: &str, reading: &str) {
        let content = line.trim_end();
        let base = content.trim_start();
        self.text(&content[..content.len() - base.len()]);
        self.ruby(base, reading);
    }
}
