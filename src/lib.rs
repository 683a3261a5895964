// modules
pub mod bridge;
pub mod config;
pub mod constants;
pub mod error;
pub mod logger;
pub mod proxy;
pub mod server;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;

use crate::bridge::ConversationManager;
use crate::config::{ConfigError, ProxyConfig};
use crate::session::{ModelCatalog, SessionDriver};

/// Process-wide dependency root, passed to every handler. The manager,
/// catalog and session driver live here instead of in global statics.
pub struct AppContext {
    pub config: ProxyConfig,
    /// `excluded_file_patterns`, compiled once at startup.
    pub exclude_patterns: Vec<Regex>,
    pub manager: Arc<ConversationManager>,
    pub driver: Arc<dyn SessionDriver>,
    pub catalog: ModelCatalog,
    /// The port the proxy listens on; bridge URLs embed it.
    pub port: u16,
    /// Working directory sessions run in (defaults to the proxy's own).
    pub working_directory: Option<PathBuf>,
}

impl AppContext {
    pub fn new(
        config: ProxyConfig,
        driver: Arc<dyn SessionDriver>,
        port: u16,
    ) -> Result<Self, ConfigError> {
        let exclude_patterns = config.compile_exclude_patterns()?;
        Ok(Self {
            config,
            exclude_patterns,
            manager: ConversationManager::new(),
            driver,
            catalog: ModelCatalog::with_defaults(),
            port,
            working_directory: None,
        })
    }
}
