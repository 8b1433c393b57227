//! 编排协作者：指令解析、风险评估、策略检查、技能库、站点探索
//!
//! 编排器只依赖这里的 trait；本模块同时提供一组基于规则/内存的轻量实现，
//! 可在部署时替换为真实的模型或服务。

pub mod explorer;
pub mod parser;
pub mod rules;
pub mod skills;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AuraError;
use crate::graph::{ActionGraph, ExecutionResult};

pub use explorer::StaticSiteExplorer;
pub use parser::KeywordCommandParser;
pub use rules::{RulePolicyEngine, RuleRiskEngine};
pub use skills::InMemorySkillLibrary;

/// 技能匹配时携带站点域名的参数名
pub const SITE_PARAMETER: &str = "site";

/// 站点范围归一为小写域名："https://Www.Example.com/path?q=1" -> "www.example.com"
pub fn site_domain(site_scope: &str) -> String {
    let trimmed = site_scope.trim();
    let rest = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    rest.split(['/', '?', '#'])
        .next()
        .unwrap_or(rest)
        .to_lowercase()
}

/// 解析后的指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub intent: String,
    pub confidence: f64,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// 0.0 - 1.0
    pub score: f64,
    pub factors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub approval_required: bool,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            approval_required: false,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            approval_required: false,
        }
    }
}

/// 技能匹配结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMatch {
    pub skill_id: String,
    pub confidence: f64,
    pub parameters: BTreeMap<String, String>,
}

/// 站点模型：合成动作图所需的关键元素定位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteModel {
    pub domain: String,
    pub homepage: String,
    pub search_input: Option<String>,
    pub submit_button: String,
    pub results: String,
}

#[async_trait]
pub trait CommandParser: Send + Sync {
    async fn parse(&self, text: &str) -> Result<ParsedCommand, AuraError>;
}

#[async_trait]
pub trait RiskEngine: Send + Sync {
    /// 评估风险；结果等级不低于 base
    async fn assess(
        &self,
        command: &ParsedCommand,
        base: RiskLevel,
    ) -> Result<RiskAssessment, AuraError>;
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn check(
        &self,
        command: &ParsedCommand,
        risk: &RiskAssessment,
    ) -> Result<PolicyDecision, AuraError>;
}

#[async_trait]
pub trait SkillLibrary: Send + Sync {
    /// parameters 中的 `SITE_PARAMETER` 限定技能所属站点
    async fn find_matching_skill(
        &self,
        intent: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Option<SkillMatch>;

    async fn execute_skill(
        &self,
        skill_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, AuraError>;

    /// 将一次成功的动作图执行沉淀为技能，返回新技能 ID
    async fn distill(
        &self,
        _command: &ParsedCommand,
        _graph: &ActionGraph,
        _result: &ExecutionResult,
    ) -> Result<Option<String>, AuraError> {
        Ok(None)
    }
}

#[async_trait]
pub trait SiteExplorer: Send + Sync {
    async fn explore(&self, site_scope: &str) -> Result<SiteModel, AuraError>;
}
