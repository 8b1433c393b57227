//! 关键词指令解析：正则意图表 + 参数抽取（URL、选择器、邮箱、数字）

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use super::{CommandParser, ParsedCommand};
use crate::core::AuraError;

struct IntentPattern {
    intent: &'static str,
    regex: Regex,
    confidence: f64,
    /// 将最后一个捕获组存为该参数
    capture_as: Option<&'static str>,
}

static INTENT_PATTERNS: OnceLock<Vec<IntentPattern>> = OnceLock::new();

fn intent_patterns() -> &'static [IntentPattern] {
    INTENT_PATTERNS.get_or_init(|| {
        let table: [(&str, &str, f64, Option<&str>); 16] = [
            ("navigate", r"(?i)^(?:navigate to|go to)\s+(.+)$", 0.9, Some("target")),
            ("navigate", r"^(?:打开|访问|进入)\s*(.+)$", 0.9, Some("target")),
            ("navigate", r"(?i)^open\s+(.+)$", 0.7, Some("target")),
            ("search", r"(?i)^search\s+(?:for\s+)?(.+)$", 0.9, Some("query")),
            ("search", r"^(?:搜索|查找)\s*(.+)$", 0.9, Some("query")),
            ("search", r"(?i)^(?:find|look for)\s+(.+)$", 0.8, Some("query")),
            ("click", r"(?i)^(?:click|press)\s+(?:on\s+)?(.+)$", 0.9, Some("target")),
            ("click", r"^点击\s*(.+)$", 0.9, Some("target")),
            ("fill_form", r"(?i)^fill\s+(.+?)\s+with\s+(.+)$", 0.9, Some("value")),
            ("fill_form", r"(?i)^(?:type|enter)\s+(.+?)\s+into\s+(.+)$", 0.8, Some("field")),
            ("login", r"(?i)^(?:log\s*in|sign\s*in)\b(.*)$", 0.9, None),
            ("login", r"^登录\s*(.*)$", 0.9, None),
            ("purchase", r"(?i)\b(?:buy|purchase|checkout|pay for)\b\s*(.*)$", 0.85, Some("item")),
            ("extract", r"(?i)^(?:extract|scrape|get)\s+(.+)$", 0.8, Some("target")),
            ("extract", r"^(?:提取|获取|抓取)\s*(.+)$", 0.8, Some("target")),
            ("wait", r"(?i)^wait\s+(?:for\s+)?(\d+)\s*(?:seconds?|s)?$", 0.9, Some("seconds")),
        ];
        table
            .into_iter()
            .map(|(intent, pattern, confidence, capture_as)| IntentPattern {
                intent,
                regex: Regex::new(pattern).expect("static intent pattern"),
                confidence,
                capture_as,
            })
            .collect()
    })
}

static PARAM_PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();

fn param_patterns() -> &'static [(&'static str, Regex)] {
    PARAM_PATTERNS.get_or_init(|| {
        [
            ("url", r"https?://[^\s]+|www\.[^\s]+"),
            ("selector", r"#[a-zA-Z][\w-]*|\.[a-zA-Z][\w-]*|\[[^\]]+\]"),
            ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            ("number", r"\b\d+(?:\.\d+)?\b"),
        ]
        .into_iter()
        .map(|(name, pattern)| (name, Regex::new(pattern).expect("static parameter pattern")))
        .collect()
    })
}

/// 基于正则意图表的指令解析器；无法识别时意图为 "unknown"、置信度 0
#[derive(Debug, Default)]
pub struct KeywordCommandParser;

impl KeywordCommandParser {
    pub fn new() -> Self {
        Self
    }

    fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[async_trait]
impl CommandParser for KeywordCommandParser {
    async fn parse(&self, text: &str) -> Result<ParsedCommand, AuraError> {
        let normalized = Self::normalize(text);
        if normalized.is_empty() {
            return Err(AuraError::Validation(vec!["empty command".to_string()]));
        }

        let mut parameters = BTreeMap::new();
        for (name, regex) in param_patterns() {
            if let Some(m) = regex.find(&normalized) {
                parameters.insert(name.to_string(), m.as_str().to_string());
            }
        }

        let best = intent_patterns()
            .iter()
            .filter_map(|p| p.regex.captures(&normalized).map(|caps| (p, caps)))
            .max_by(|(a, _), (b, _)| a.confidence.total_cmp(&b.confidence));

        let (intent, confidence) = match best {
            Some((pattern, caps)) => {
                if let Some(name) = pattern.capture_as {
                    let value = caps
                        .iter()
                        .skip(1)
                        .flatten()
                        .last()
                        .map(|m| m.as_str().trim().to_string());
                    if let Some(value) = value.filter(|v| !v.is_empty()) {
                        parameters.entry(name.to_string()).or_insert(value);
                    }
                }
                (pattern.intent.to_string(), pattern.confidence)
            }
            None => ("unknown".to_string(), 0.0),
        };

        tracing::debug!("Parsed command intent={} confidence={:.2}", intent, confidence);
        Ok(ParsedCommand {
            intent,
            confidence,
            parameters,
        })
    }
}
