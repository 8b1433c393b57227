//! Mock 执行后端（用于测试与本地演示，无需真实远程服务器）
//!
//! 可编排失败：前 N 次连接失败、前 N 次执行失败、匹配某关键字的指令失败、某服务器健康探测失败。
//! 执行成功时回显指令中的 Task 行，便于断言；在已断开的句柄上执行会失败。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{BackendHandle, ExecutionBackend, RemoteServerConfig};
use crate::core::BackendError;

#[derive(Debug, Default)]
struct MockState {
    connect_failures: VecDeque<BackendError>,
    execute_failures: VecDeque<BackendError>,
    command_failures: Vec<(String, BackendError)>,
    unhealthy: HashSet<String>,
    tools: HashMap<String, Vec<String>>,
    connected: Vec<String>,
    /// 已断开的句柄 ID
    released: HashSet<String>,
    commands: Vec<String>,
    connects: u32,
    disconnects: u32,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 接下来 n 次 connect 返回 err
    pub fn fail_next_connects(&self, n: usize, err: BackendError) {
        let mut s = self.state();
        s.connect_failures.extend(std::iter::repeat(err).take(n));
    }

    /// 接下来 n 次 execute 返回 err
    pub fn fail_next_executes(&self, n: usize, err: BackendError) {
        let mut s = self.state();
        s.execute_failures.extend(std::iter::repeat(err).take(n));
    }

    /// 指令文本包含 pattern 时始终失败
    pub fn fail_commands_containing(&self, pattern: impl Into<String>, err: BackendError) {
        self.state().command_failures.push((pattern.into(), err));
    }

    pub fn set_server_healthy(&self, server: &str, healthy: bool) {
        let mut s = self.state();
        if healthy {
            s.unhealthy.remove(server);
        } else {
            s.unhealthy.insert(server.to_string());
        }
    }

    /// 为服务器指定工具列表（未指定时为 `<server>_ping`）
    pub fn set_tools(&self, server: &str, tools: Vec<String>) {
        self.state().tools.insert(server.to_string(), tools);
    }

    /// 已执行的指令（含失败的）
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    pub fn disconnect_count(&self) -> u32 {
        self.state().disconnects
    }

    /// 最近一次成功连接覆盖的服务器
    pub fn connected_servers(&self) -> Vec<String> {
        self.state().connected.clone()
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn connect(&self, servers: &[RemoteServerConfig]) -> Result<BackendHandle, BackendError> {
        let mut s = self.state();
        s.connects += 1;
        if let Some(err) = s.connect_failures.pop_front() {
            return Err(err);
        }
        let names: Vec<String> = servers.iter().map(|c| c.name.clone()).collect();
        s.connected = names.clone();
        Ok(BackendHandle::new(names))
    }

    async fn list_tools(&self, handle: &BackendHandle) -> Result<Vec<String>, BackendError> {
        let s = self.state();
        Ok(handle
            .servers()
            .iter()
            .flat_map(|server| {
                s.tools
                    .get(server)
                    .cloned()
                    .unwrap_or_else(|| vec![format!("{}_ping", server)])
            })
            .collect())
    }

    async fn list_server_tools(
        &self,
        handle: &BackendHandle,
        server: &str,
    ) -> Result<Vec<String>, BackendError> {
        if self.state().unhealthy.contains(server) {
            return Err(BackendError::Transport(format!(
                "connection refused by {}",
                server
            )));
        }
        if !handle.servers().iter().any(|s| s == server) {
            return Err(BackendError::Transport(format!("{} is not attached", server)));
        }
        let prefix = format!("{}_", server);
        Ok(self
            .list_tools(handle)
            .await?
            .into_iter()
            .filter(|t| t.starts_with(&prefix))
            .collect())
    }

    async fn execute(&self, handle: &BackendHandle, command: &str) -> Result<String, BackendError> {
        let mut s = self.state();
        s.commands.push(command.to_string());
        if s.released.contains(handle.id()) {
            return Err(BackendError::Transport("connection closed".to_string()));
        }
        if let Some(err) = s.execute_failures.pop_front() {
            return Err(err);
        }
        if let Some((_, err)) = s
            .command_failures
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
        {
            return Err(err.clone());
        }
        let task = command
            .lines()
            .rev()
            .find_map(|l| l.strip_prefix("Task: "))
            .unwrap_or(command);
        Ok(format!("[mock] {}", task))
    }

    async fn disconnect(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let mut s = self.state();
        s.disconnects += 1;
        s.released.insert(handle.id().to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let backend = MockBackend::new();
        backend.fail_next_connects(1, BackendError::Transport("down".into()));
        let servers = [RemoteServerConfig::new("playwright", "npx")];
        assert!(backend.connect(&servers).await.is_err());
        let handle = backend.connect(&servers).await.unwrap();
        assert_eq!(handle.servers(), ["playwright".to_string()]);
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_execute_echoes_task_line() {
        let backend = MockBackend::new();
        let handle = BackendHandle::new(vec!["playwright".into()]);
        let out = backend
            .execute(&handle, "Context:\nurl: x\n\nTask: Navigate to x")
            .await
            .unwrap();
        assert_eq!(out, "[mock] Navigate to x");
    }

    #[tokio::test]
    async fn test_released_handle_rejects_commands() {
        let backend = MockBackend::new();
        let handle = backend
            .connect(&[RemoteServerConfig::new("playwright", "npx")])
            .await
            .unwrap();
        backend.disconnect(&handle).await.unwrap();
        assert!(matches!(
            backend.execute(&handle, "Navigate to x").await,
            Err(BackendError::Transport(_))
        ));
        assert_eq!(backend.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_server_listing_fails() {
        let backend = MockBackend::new();
        let handle = BackendHandle::new(vec!["a".into(), "b".into()]);
        backend.set_server_healthy("a", false);
        assert!(backend.list_server_tools(&handle, "a").await.is_err());
        assert_eq!(
            backend.list_server_tools(&handle, "b").await.unwrap(),
            vec!["b_ping".to_string()]
        );
    }
}
