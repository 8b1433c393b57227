//! 规则化风险评估与策略检查

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{ParsedCommand, PolicyDecision, PolicyEngine, RiskAssessment, RiskEngine, RiskLevel};
use crate::core::AuraError;

const SENSITIVE_URL_KEYWORDS: [&str; 5] = ["admin", "login", "password", "payment", "checkout"];

/// 按意图与参数累加风险分
#[derive(Debug, Default)]
pub struct RuleRiskEngine;

impl RuleRiskEngine {
    pub fn new() -> Self {
        Self
    }

    fn level_for(score: f64) -> RiskLevel {
        if score >= 0.8 {
            RiskLevel::Critical
        } else if score >= 0.6 {
            RiskLevel::High
        } else if score >= 0.3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[async_trait]
impl RiskEngine for RuleRiskEngine {
    async fn assess(
        &self,
        command: &ParsedCommand,
        base: RiskLevel,
    ) -> Result<RiskAssessment, AuraError> {
        let mut score: f64 = 0.0;
        let mut factors = Vec::new();

        match command.intent.as_str() {
            "purchase" => {
                score += 0.7;
                factors.push("payment operation".to_string());
            }
            "login" => {
                score += 0.6;
                factors.push("credential handling".to_string());
            }
            "click" | "fill_form" => {
                score += 0.3;
                factors.push("state-changing action".to_string());
            }
            _ => {}
        }

        if let Some(url) = command.parameters.get("url") {
            let lower = url.to_lowercase();
            for keyword in SENSITIVE_URL_KEYWORDS {
                if lower.contains(keyword) {
                    score += 0.2;
                    factors.push(format!("sensitive url keyword: {}", keyword));
                }
            }
        }

        if command.parameters.contains_key("email") {
            score += 0.3;
            factors.push("personal data".to_string());
        }

        let score = score.min(1.0);
        let level = Self::level_for(score).max(base);
        tracing::info!("Risk assessment: level={:?} score={:.2}", level, score);

        Ok(RiskAssessment {
            level,
            score,
            factors,
        })
    }
}

/// 策略：拒绝列表中的意图与 Critical 风险；High 风险需要审批；其余放行
#[derive(Debug)]
pub struct RulePolicyEngine {
    denied_intents: BTreeSet<String>,
}

impl Default for RulePolicyEngine {
    fn default() -> Self {
        Self {
            denied_intents: ["login", "purchase"].into_iter().map(String::from).collect(),
        }
    }
}

impl RulePolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_denied_intent(mut self, intent: impl Into<String>) -> Self {
        self.denied_intents.insert(intent.into());
        self
    }

    /// 清空拒绝列表
    pub fn permissive() -> Self {
        Self {
            denied_intents: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl PolicyEngine for RulePolicyEngine {
    async fn check(
        &self,
        command: &ParsedCommand,
        risk: &RiskAssessment,
    ) -> Result<PolicyDecision, AuraError> {
        if self.denied_intents.contains(&command.intent) {
            return Ok(PolicyDecision::deny(format!(
                "Denied by policy rule: intent '{}' is not permitted",
                command.intent
            )));
        }
        if risk.level == RiskLevel::Critical {
            return Ok(PolicyDecision::deny("Denied by policy rule: critical risk"));
        }
        if risk.level == RiskLevel::High {
            return Ok(PolicyDecision {
                allowed: true,
                reason: Some("Approval required by policy rule: high risk".to_string()),
                approval_required: true,
            });
        }
        Ok(PolicyDecision::allow())
    }
}
