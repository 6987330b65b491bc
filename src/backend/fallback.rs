//! Keyword-rule responder used when no native model can answer
//!
//! The responder is deterministic apart from the clock used by the time and
//! date rules. [`FallbackStreamer`] replays its answer through a
//! [`TokenSink`] in small chunks so callers see the same streaming contract as
//! the native path.

use crate::config::FallbackConfig;
use crate::sink::TokenSink;
use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

const USER_TURN_START: &str = "<|im_start|>user";
const TURN_END: &str = "<|im_end|>";

/// Longest slice of the user's text quoted back by the default rule
const QUOTE_LIMIT: usize = 30;

pub const DIVISION_BY_ZERO_MESSAGE: &str =
    "Cannot compute that: division by zero is undefined.";

// ============================================================================
// Rules
// ============================================================================

/// Rule that produced a fallback answer, in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Greeting,
    Identity,
    Weather,
    Time,
    Date,
    Help,
    Arithmetic,
    Programming,
    Gratitude,
    Default,
}

pub struct FallbackResponder {
    keyword_rules: Vec<(Rule, Regex)>,
    expression: Option<Regex>,
}

impl FallbackResponder {
    pub fn new() -> Self {
        let keyword_rules = [
            (
                Rule::Greeting,
                r"(?i)\b(hello|hi|hey|good (morning|afternoon|evening))\b|你好|您好|嗨",
            ),
            (
                Rule::Identity,
                r"(?i)\b(who are you|what are you|your name)\b|你是谁|你叫什么",
            ),
            (
                Rule::Weather,
                r"(?i)\b(weather|forecast|rain|sunny|temperature)\b|天气|下雨",
            ),
            (Rule::Time, r"(?i)\b(time|clock)\b|几点|时间"),
            (Rule::Date, r"(?i)\b(date|today|what day)\b|日期|几号|星期|今天"),
            (
                Rule::Help,
                r"(?i)\b(help|what can you do|capabilities)\b|帮助|你能做什么",
            ),
            (
                Rule::Programming,
                r"(?i)\b(code|coding|program|programming|rust|python|java|javascript|function|compile|bug)\b|代码|编程",
            ),
            (Rule::Gratitude, r"(?i)\b(thanks|thank you|thx)\b|谢谢|感谢"),
        ]
        .into_iter()
        .filter_map(|(rule, pattern)| Regex::new(pattern).ok().map(|re| (rule, re)))
        .collect();

        let expression =
            Regex::new(r"(-?\d+(?:\.\d+)?)\s*([+\-*/])\s*(-?\d+(?:\.\d+)?)").ok();

        Self {
            keyword_rules,
            expression,
        }
    }

    /// Answer a prompt using the local clock
    pub fn respond(&self, prompt: &str) -> String {
        self.respond_at(prompt, Local::now())
    }

    /// Answer a prompt as if the local time were `now`
    pub fn respond_at(&self, prompt: &str, now: DateTime<Local>) -> String {
        let text = extract_user_text(prompt);
        let rule = self.classify(&text);
        debug!(rule = ?rule, "Fallback responder matched rule");

        match rule {
            Rule::Greeting => {
                "Hello! I'm your on-device assistant. How can I help you today?".to_string()
            }
            Rule::Identity => "I'm a local assistant running entirely on this device. \
                 Without a loaded model I answer from a small set of built-in rules."
                .to_string(),
            Rule::Weather => "I can't check the weather while offline. \
                 Try a weather app or website for the latest forecast."
                .to_string(),
            Rule::Time => format!("It's {} right now.", now.format("%H:%M")),
            Rule::Date => format!("Today is {}.", now.format("%A, %B %-d, %Y")),
            Rule::Help => "I can greet you, tell the time and date, and do simple \
                 arithmetic like \"12 * 4\". Load a model for open-ended answers."
                .to_string(),
            Rule::Arithmetic => self
                .evaluate(&text)
                .unwrap_or_else(|| default_answer(&text)),
            Rule::Programming => "Programming questions need a loaded language model. \
                 Download and load one to get code help."
                .to_string(),
            Rule::Gratitude => "You're welcome! Let me know if there's anything else.".to_string(),
            Rule::Default => default_answer(&text),
        }
    }

    /// First matching rule for the already extracted user text
    pub fn classify(&self, text: &str) -> Rule {
        for (rule, pattern) in &self.keyword_rules {
            if *rule == Rule::Programming && self.evaluate(text).is_some() {
                return Rule::Arithmetic;
            }
            if pattern.is_match(text) {
                return *rule;
            }
        }
        if self.evaluate(text).is_some() {
            return Rule::Arithmetic;
        }
        Rule::Default
    }

    /// Evaluate the first `number operator number` expression in `text`
    pub fn evaluate(&self, text: &str) -> Option<String> {
        let normalized = normalize_operators(text);
        let caps = self.expression.as_ref()?.captures(&normalized)?;
        let lhs: f64 = caps.get(1)?.as_str().parse().ok()?;
        let op = caps.get(2)?.as_str();
        let rhs: f64 = caps.get(3)?.as_str().parse().ok()?;

        let value = match op {
            "+" => lhs + rhs,
            "-" => lhs - rhs,
            "*" => lhs * rhs,
            "/" => {
                if rhs == 0.0 {
                    return Some(DIVISION_BY_ZERO_MESSAGE.to_string());
                }
                lhs / rhs
            }
            _ => return None,
        };

        if !value.is_finite() {
            return Some("Cannot compute that: the result is out of range.".to_string());
        }

        Some(format!(
            "{} {} {} = {}",
            format_number(lhs),
            op,
            format_number(rhs),
            format_number(value)
        ))
    }
}

impl Default for FallbackResponder {
    fn default() -> Self {
        Self::new()
    }
}

/// Recover the last user turn from a ChatML prompt, or the whole prompt
pub fn extract_user_text(prompt: &str) -> String {
    let Some(start) = prompt.rfind(USER_TURN_START) else {
        return prompt.trim().to_string();
    };
    let body = &prompt[start + USER_TURN_START.len()..];
    let body = match body.find(TURN_END) {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

fn normalize_operators(text: &str) -> String {
    // Longer phrases first so "乘以" is not split by "乘"
    const REPLACEMENTS: &[(&str, &str)] = &[
        ("multiplied by", "*"),
        ("divided by", "/"),
        ("plus", "+"),
        ("minus", "-"),
        ("times", "*"),
        ("加上", "+"),
        ("减去", "-"),
        ("乘以", "*"),
        ("除以", "/"),
        ("加", "+"),
        ("减", "-"),
        ("乘", "*"),
        ("×", "*"),
        ("÷", "/"),
    ];

    let mut normalized = text.to_lowercase();
    for (word, symbol) in REPLACEMENTS {
        normalized = normalized.replace(word, symbol);
    }
    normalized
}

fn format_number(value: f64) -> String {
    if value == 0.0 {
        // Also folds -0.0
        "0".to_string()
    } else if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

fn default_answer(text: &str) -> String {
    let mut quote: String = text.chars().take(QUOTE_LIMIT).collect();
    if text.chars().count() > QUOTE_LIMIT {
        quote.push_str("...");
    }
    format!(
        "You said: \"{quote}\". I'm running without a language model right now, \
         so I can only handle greetings, time and date questions and simple arithmetic."
    )
}

// ============================================================================
// Streaming
// ============================================================================

/// Source of chunk sizes and inter-chunk delays for simulated streaming
pub trait ChunkSource: Send {
    fn next_chunk_len(&mut self) -> usize;
    fn next_delay(&mut self) -> Duration;
}

/// Random chunking within the configured bounds
pub struct RandomChunks {
    rng: StdRng,
    config: FallbackConfig,
}

impl RandomChunks {
    pub fn new(config: &FallbackConfig) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            config: config.clone(),
        }
    }

    pub fn seeded(config: &FallbackConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            config: config.clone(),
        }
    }
}

impl ChunkSource for RandomChunks {
    fn next_chunk_len(&mut self) -> usize {
        let min = self.config.chunk_min.max(1);
        let max = self.config.chunk_max.max(min);
        self.rng.gen_range(min..=max)
    }

    fn next_delay(&mut self) -> Duration {
        let min = self.config.delay_min_ms;
        let max = self.config.delay_max_ms.max(min);
        Duration::from_millis(self.rng.gen_range(min..=max))
    }
}

/// Constant chunk length and delay
#[derive(Debug, Clone, Copy)]
pub struct FixedChunks {
    pub len: usize,
    pub delay: Duration,
}

impl ChunkSource for FixedChunks {
    fn next_chunk_len(&mut self) -> usize {
        self.len.max(1)
    }

    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

type ChunkSourceFactory = Box<dyn Fn() -> Box<dyn ChunkSource> + Send + Sync>;

/// Streams fallback answers through a sink with a cooperative stop flag
pub struct FallbackStreamer {
    responder: FallbackResponder,
    chunks: ChunkSourceFactory,
    stop: AtomicBool,
    active: AtomicBool,
}

impl FallbackStreamer {
    pub fn new(config: &FallbackConfig) -> Self {
        let config = config.clone();
        Self::with_chunk_source(move || Box::new(RandomChunks::new(&config)))
    }

    pub fn with_chunk_source<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn ChunkSource> + Send + Sync + 'static,
    {
        Self {
            responder: FallbackResponder::new(),
            chunks: Box::new(factory),
            stop: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    /// Request that the current stream halt before its next chunk
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Clear the stop request once a session has ended
    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_generating(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Answer `prompt` and stream the answer into `sink`
    ///
    /// Always ends with exactly one `on_complete`, carrying the full answer or
    /// the prefix emitted before a stop was observed. Returns that text.
    pub async fn stream(&self, prompt: &str, sink: &dyn TokenSink) -> String {
        let answer = self.responder.respond(prompt);
        let chars: Vec<char> = answer.chars().collect();
        let mut source = (self.chunks)();
        let mut emitted = String::with_capacity(answer.len());
        let mut index = 0;

        self.active.store(true, Ordering::SeqCst);
        while index < chars.len() {
            if self.stop.load(Ordering::SeqCst) {
                debug!(emitted = emitted.len(), "Fallback stream stopped");
                break;
            }
            let end = (index + source.next_chunk_len()).min(chars.len());
            let chunk: String = chars[index..end].iter().collect();
            sink.on_token(&chunk);
            emitted.push_str(&chunk);
            index = end;

            if index < chars.len() {
                tokio::time::sleep(source.next_delay()).await;
            }
        }
        self.active.store(false, Ordering::SeqCst);

        sink.on_complete(&emitted);
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, GenerationEvent};
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 0)
            .single()
            .expect("unambiguous local time")
    }

    fn chatml(user: &str) -> String {
        format!(
            "<|im_start|>system\nYou are helpful.<|im_end|>\n<|im_start|>user\n{user}<|im_end|>\n<|im_start|>assistant\n"
        )
    }

    #[test]
    fn test_extract_user_text() {
        assert_eq!(extract_user_text(&chatml("what is 2+2")), "what is 2+2");
        assert_eq!(extract_user_text("  plain text "), "plain text");
        assert_eq!(extract_user_text("<|im_start|>user\nunterminated"), "unterminated");
    }

    #[test]
    fn test_rule_precedence() {
        let responder = FallbackResponder::new();
        assert_eq!(responder.classify("hello, what time is it"), Rule::Greeting);
        assert_eq!(responder.classify("who are you"), Rule::Identity);
        assert_eq!(responder.classify("will it rain tomorrow"), Rule::Weather);
        assert_eq!(responder.classify("what time is it"), Rule::Time);
        assert_eq!(responder.classify("what is the date"), Rule::Date);
        assert_eq!(responder.classify("help"), Rule::Help);
        assert_eq!(responder.classify("compute 3 + 5"), Rule::Arithmetic);
        assert_eq!(responder.classify("write python code"), Rule::Programming);
        assert_eq!(responder.classify("thanks a lot"), Rule::Gratitude);
        assert_eq!(responder.classify("tell me a story"), Rule::Default);
    }

    #[test]
    fn test_word_boundaries() {
        let responder = FallbackResponder::new();
        // "this" must not trigger the "hi" greeting
        assert_eq!(responder.classify("this is a test"), Rule::Default);
        assert_eq!(responder.classify("3 times 4"), Rule::Arithmetic);
    }

    #[test]
    fn test_arithmetic() {
        let responder = FallbackResponder::new();
        assert_eq!(responder.evaluate("3+5").as_deref(), Some("3 + 5 = 8"));
        assert_eq!(responder.evaluate("7 / 2").as_deref(), Some("7 / 2 = 3.50"));
        assert_eq!(responder.evaluate("1 / 3").as_deref(), Some("1 / 3 = 0.33"));
        assert_eq!(responder.evaluate("6 times 7").as_deref(), Some("6 * 7 = 42"));
        assert_eq!(
            responder.evaluate("10 divided by 4").as_deref(),
            Some("10 / 4 = 2.50")
        );
        assert_eq!(responder.evaluate("9减4").as_deref(), Some("9 - 4 = 5"));
        assert_eq!(responder.evaluate("3×3").as_deref(), Some("3 * 3 = 9"));
        assert_eq!(responder.evaluate("no numbers here"), None);
    }

    #[test]
    fn test_large_integral_results_have_no_decimals() {
        let responder = FallbackResponder::new();
        assert_eq!(
            responder.evaluate("100000000 * 100000000").as_deref(),
            Some("100000000 * 100000000 = 10000000000000000")
        );
        assert_eq!(
            responder.evaluate("-12345678 * 100000000").as_deref(),
            Some("-12345678 * 100000000 = -1234567800000000")
        );
        assert_eq!(responder.evaluate("0 * -3").as_deref(), Some("0 * -3 = 0"));
    }

    #[test]
    fn test_division_by_zero() {
        let responder = FallbackResponder::new();
        let answer = responder.respond(&chatml("10/0"));
        assert_eq!(answer, DIVISION_BY_ZERO_MESSAGE);
        assert!(!answer.contains("inf"));
        assert!(!answer.contains("NaN"));
    }

    #[test]
    fn test_time_and_date() {
        let responder = FallbackResponder::new();
        assert_eq!(
            responder.respond_at("what time is it", fixed_time()),
            "It's 14:05 right now."
        );
        assert_eq!(
            responder.respond_at("what's the date", fixed_time()),
            "Today is Saturday, March 9, 2024."
        );
    }

    #[test]
    fn test_default_truncates_quote() {
        let responder = FallbackResponder::new();
        let long = "a".repeat(50);
        let answer = responder.respond(&long);
        assert!(answer.contains(&format!("\"{}...\"", "a".repeat(30))));
        assert!(!answer.contains(&"a".repeat(31)));
    }

    #[test]
    fn test_random_chunks_respect_bounds() {
        let config = FallbackConfig::default();
        let mut chunks = RandomChunks::seeded(&config, 7);
        for _ in 0..200 {
            let len = chunks.next_chunk_len();
            assert!((config.chunk_min..=config.chunk_max).contains(&len));
            let delay = chunks.next_delay().as_millis() as u64;
            assert!((config.delay_min_ms..=config.delay_max_ms).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_stream_concatenates_to_answer() {
        let streamer = FallbackStreamer::with_chunk_source(|| {
            Box::new(FixedChunks {
                len: 3,
                delay: Duration::ZERO,
            })
        });
        let (sink, mut rx) = ChannelSink::channel();
        let text = streamer.stream(&chatml("2 plus 2"), &sink).await;
        drop(sink);

        let mut tokens = String::new();
        let mut terminal = None;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Token(t) => {
                    assert!(t.chars().count() <= 3);
                    tokens.push_str(&t);
                }
                other => terminal = Some(other),
            }
        }
        assert_eq!(tokens, "2 + 2 = 4");
        assert_eq!(text, tokens);
        assert_eq!(terminal, Some(GenerationEvent::Complete(tokens)));
        assert!(!streamer.is_generating());
    }

    #[tokio::test]
    async fn test_stop_before_stream_completes_empty() {
        let streamer = FallbackStreamer::with_chunk_source(|| {
            Box::new(FixedChunks {
                len: 2,
                delay: Duration::ZERO,
            })
        });
        streamer.stop();
        let (sink, mut rx) = ChannelSink::channel();
        let text = streamer.stream("hello", &sink).await;
        assert_eq!(text, "");
        assert_eq!(rx.recv().await, Some(GenerationEvent::Complete(String::new())));

        streamer.reset();
        let text = streamer.stream("hello", &sink).await;
        assert!(!text.is_empty());
    }
}
