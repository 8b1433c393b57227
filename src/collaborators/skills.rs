//! 内存技能库
//!
//! 成功执行的动作图按意图沉淀为技能：节点中出现的参数值被替换为 `{{name}}` 占位符，
//! 回放时再用新参数绑定。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{site_domain, ParsedCommand, SkillLibrary, SkillMatch, SITE_PARAMETER};
use crate::core::AuraError;
use crate::graph::{ActionGraph, ExecutionResult};

/// 完整匹配（意图一致且参数齐全）时的置信度
const FULL_MATCH_CONFIDENCE: f64 = 0.9;
/// 意图一致但缺少参数
const PARTIAL_MATCH_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct StoredSkill {
    pub id: String,
    pub intent: String,
    /// 沉淀时所在站点的域名；模板中的首页与选择器只对该站点有效
    pub site: Option<String>,
    pub parameter_names: Vec<String>,
    pub template: ActionGraph,
    pub success_count: u64,
    pub replay_count: u64,
    pub created_at: DateTime<Utc>,
}

impl StoredSkill {
    /// 用参数绑定模板，返回可执行的新图
    pub fn instantiate(&self, parameters: &BTreeMap<String, String>) -> ActionGraph {
        let mut graph = ActionGraph::new(bind(&self.template.goal, parameters));
        graph.nodes = self.template.nodes.clone();
        graph.edges = self.template.edges.clone();
        graph.budget_tokens = self.template.budget_tokens;
        graph.timeout_ms = self.template.timeout_ms;
        graph.metadata = self.template.metadata.clone();
        graph
            .metadata
            .insert("skill_id".to_string(), json!(self.id));
        for node in graph.nodes.iter_mut() {
            for field in [&mut node.url, &mut node.locator, &mut node.text] {
                if let Some(value) = field.as_mut() {
                    *value = bind(value, parameters);
                }
            }
        }
        graph
    }

    fn shape(&self) -> Vec<(String, &'static str)> {
        shape_of(&self.template)
    }

    /// 请求未限定站点时任何技能都可用
    fn serves_site(&self, requested: Option<&String>) -> bool {
        match (&self.site, requested) {
            (Some(own), Some(requested)) => own == requested,
            _ => true,
        }
    }
}

fn site_of(graph: &ActionGraph) -> Option<String> {
    graph
        .metadata
        .get(SITE_PARAMETER)
        .and_then(|v| v.as_str())
        .map(site_domain)
}

fn shape_of(graph: &ActionGraph) -> Vec<(String, &'static str)> {
    graph
        .nodes
        .iter()
        .map(|n| (n.id.clone(), n.kind.as_str()))
        .collect()
}

fn bind(text: &str, parameters: &BTreeMap<String, String>) -> String {
    parameters.iter().fold(text.to_string(), |acc, (k, v)| {
        acc.replace(&format!("{{{{{}}}}}", k), v)
    })
}

fn unbind(text: &str, parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .fold(text.to_string(), |acc, (k, v)| {
            acc.replace(v.as_str(), &format!("{{{{{}}}}}", k))
        })
}

/// 进程内技能库
#[derive(Debug, Default)]
pub struct InMemorySkillLibrary {
    skills: RwLock<HashMap<String, StoredSkill>>,
}

impl InMemorySkillLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, skill: StoredSkill) {
        self.skills.write().await.insert(skill.id.clone(), skill);
    }

    pub async fn get(&self, skill_id: &str) -> Option<StoredSkill> {
        self.skills.read().await.get(skill_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.skills.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.skills.read().await.is_empty()
    }
}

#[async_trait]
impl SkillLibrary for InMemorySkillLibrary {
    async fn find_matching_skill(
        &self,
        intent: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Option<SkillMatch> {
        let requested_site = parameters.get(SITE_PARAMETER).map(|s| site_domain(s));
        let skills = self.skills.read().await;
        skills
            .values()
            .filter(|s| s.intent == intent && s.serves_site(requested_site.as_ref()))
            .map(|s| {
                let complete = s
                    .parameter_names
                    .iter()
                    .all(|name| parameters.contains_key(name));
                let confidence = if complete {
                    FULL_MATCH_CONFIDENCE
                } else {
                    PARTIAL_MATCH_CONFIDENCE
                };
                (s, confidence)
            })
            .max_by(|(a, ca), (b, cb)| {
                ca.total_cmp(cb)
                    .then(a.success_count.cmp(&b.success_count))
            })
            .map(|(s, confidence)| SkillMatch {
                skill_id: s.id.clone(),
                confidence,
                parameters: s
                    .parameter_names
                    .iter()
                    .filter_map(|n| parameters.get(n).map(|v| (n.clone(), v.clone())))
                    .collect(),
            })
    }

    /// 返回绑定参数后的回放计划：`{"skill_id", "graph"}`
    async fn execute_skill(
        &self,
        skill_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, AuraError> {
        let mut skills = self.skills.write().await;
        let skill = skills
            .get_mut(skill_id)
            .ok_or_else(|| AuraError::TaskExecution(format!("Skill not found: {}", skill_id)))?;
        skill.replay_count += 1;
        let graph = skill.instantiate(parameters);
        tracing::info!("Replaying skill {} ({} nodes)", skill_id, graph.nodes.len());

        let graph = serde_json::to_value(&graph)
            .map_err(|e| AuraError::TaskExecution(format!("Skill {} serialization: {}", skill_id, e)))?;
        Ok(json!({ "skill_id": skill_id, "graph": graph }))
    }

    async fn distill(
        &self,
        command: &ParsedCommand,
        graph: &ActionGraph,
        result: &ExecutionResult,
    ) -> Result<Option<String>, AuraError> {
        if !result.success || graph.nodes.is_empty() {
            return Ok(None);
        }

        let mut template = graph.clone();
        template.goal = unbind(&graph.goal, &command.parameters);
        template.log.clear();
        template.started_at = None;
        template.finished_at = None;
        for node in template.nodes.iter_mut() {
            for field in [&mut node.url, &mut node.locator, &mut node.text] {
                if let Some(value) = field.as_mut() {
                    *value = unbind(value, &command.parameters);
                }
            }
            node.status = Default::default();
            node.result = None;
            node.error = None;
            node.started_at = None;
            node.finished_at = None;
        }
        let parameter_names: Vec<String> = command.parameters.keys().cloned().collect();
        let site = site_of(graph);

        let mut skills = self.skills.write().await;
        let shape = shape_of(&template);
        if let Some(existing) = skills.values_mut().find(|s| {
            s.intent == command.intent
                && s.site == site
                && s.parameter_names == parameter_names
                && s.shape() == shape
        }) {
            existing.success_count += 1;
            tracing::debug!("Skill {} reinforced", existing.id);
            return Ok(Some(existing.id.clone()));
        }

        let id = format!("skill_{}", uuid::Uuid::new_v4());
        skills.insert(
            id.clone(),
            StoredSkill {
                id: id.clone(),
                intent: command.intent.clone(),
                site,
                parameter_names,
                template,
                success_count: 1,
                replay_count: 0,
                created_at: Utc::now(),
            },
        );
        tracing::info!("Distilled skill {} for intent {}", id, command.intent);
        Ok(Some(id))
    }
}
