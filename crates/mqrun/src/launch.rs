use std::path::Path;

pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

/// Server configuration file handed to the JVM, resolved against the install dir.
pub const SERVER_CONF: &str = "server.conf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    pub program: String,
    /// `{artifact}` is replaced with the cached artifact path.
    pub args: Vec<String>,
}

impl LaunchTemplate {
    pub fn java(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![
                format!("-Dconfig.file={SERVER_CONF}"),
                "-jar".to_string(),
                ARTIFACT_PLACEHOLDER.to_string(),
            ],
        }
    }

    pub fn render(&self, artifact: &Path) -> Vec<String> {
        let artifact = artifact.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(ARTIFACT_PLACEHOLDER, &artifact))
            .collect()
    }

    /// Human-readable command line, for logs only.
    pub fn display(&self, artifact: &Path) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.render(artifact));
        parts.join(" ")
    }
}
