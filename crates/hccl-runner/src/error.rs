use thiserror::Error;

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Fatal failures of a demo run. Every variant names the stage it came from.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("[{stage}] configuration error: {message}")]
    Configuration { stage: &'static str, message: String },

    #[error("[{stage}] missing dependency: {message}")]
    DependencyMissing { stage: &'static str, message: String },

    #[error("[{stage}] {message}; commands: {}", render_commands(.commands))]
    WorkerFailure {
        stage: &'static str,
        message: String,
        commands: Vec<String>,
    },

    #[error("[{stage}] io error: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
}

fn render_commands(commands: &[String]) -> String {
    if commands.is_empty() {
        return "[]".to_string();
    }
    format!("[{}]", commands.join(" | "))
}

impl LaunchError {
    pub fn config(stage: &'static str, message: impl Into<String>) -> Self {
        LaunchError::Configuration {
            stage,
            message: message.into(),
        }
    }

    pub fn dependency(stage: &'static str, message: impl Into<String>) -> Self {
        LaunchError::DependencyMissing {
            stage,
            message: message.into(),
        }
    }

    pub fn io(stage: &'static str, source: std::io::Error) -> Self {
        LaunchError::Io { stage, source }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            LaunchError::Configuration { stage, .. }
            | LaunchError::DependencyMissing { stage, .. }
            | LaunchError::WorkerFailure { stage, .. }
            | LaunchError::Io { stage, .. } => stage,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::Configuration { .. } => "configuration_error",
            LaunchError::DependencyMissing { .. } => "dependency_missing",
            LaunchError::WorkerFailure { .. } => "worker_failure",
            LaunchError::Io { .. } => "io_error",
        }
    }

    /// Process exit status for this failure class. Never zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Configuration { .. } => 2,
            LaunchError::DependencyMissing { .. } => 3,
            LaunchError::WorkerFailure { .. } => 4,
            LaunchError::Io { .. } => 5,
        }
    }

    pub fn commands(&self) -> &[String] {
        match self {
            LaunchError::WorkerFailure { commands, .. } => commands,
            _ => &[],
        }
    }
}
