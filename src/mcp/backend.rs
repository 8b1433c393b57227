//! 执行后端抽象：一个多路复用客户端同时连接所有启用的远程服务器
//!
//! 连接是批量的：connect 接收全部启用的服务器配置，返回一个覆盖它们的句柄。

use async_trait::async_trait;

use super::RemoteServerConfig;
use crate::core::BackendError;

/// 后端连接句柄（不透明，可克隆）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    id: String,
    servers: Vec<String>,
}

impl BackendHandle {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            servers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 该句柄覆盖的服务器名
    pub fn servers(&self) -> &[String] {
        &self.servers
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// 批量连接全部给定服务器
    async fn connect(&self, servers: &[RemoteServerConfig]) -> Result<BackendHandle, BackendError>;

    /// 列出句柄上所有工具（工具名以 `<server>_` 为前缀）
    async fn list_tools(&self, handle: &BackendHandle) -> Result<Vec<String>, BackendError>;

    /// 列出某个服务器的工具，用作健康探测
    async fn list_server_tools(
        &self,
        handle: &BackendHandle,
        server: &str,
    ) -> Result<Vec<String>, BackendError> {
        let prefix = format!("{}_", server);
        Ok(self
            .list_tools(handle)
            .await?
            .into_iter()
            .filter(|t| t.starts_with(&prefix))
            .collect())
    }

    /// 执行一条指令，返回文本结果
    async fn execute(&self, handle: &BackendHandle, command: &str) -> Result<String, BackendError>;

    async fn disconnect(&self, handle: &BackendHandle) -> Result<(), BackendError>;
}
