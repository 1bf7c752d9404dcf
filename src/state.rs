// 全局状态：配置、查询执行器与会话表。

use crate::config::Config;
use crate::executor::QueryExecutor;
use crate::session::SessionRegistry;
use crate::storage::{build_connector, Connector};
use anyhow::{Context, Result};
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub executor: QueryExecutor,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        // 连接描述在启动时解析一次，之后每次调用按需建连。
        let connector = build_connector(&config.database).context("数据库配置无效")?;
        Ok(Self::with_connector(config, connector))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            executor: QueryExecutor::new(connector),
            sessions: SessionRegistry::new(),
        }
    }
}
