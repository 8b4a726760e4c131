use std::path::PathBuf;

/// Files loaded from the workspace into the system prompt, in order.
pub const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".nanocell"))
            .unwrap_or_else(|| PathBuf::from(".nanocell"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn workspace(&self) -> PathBuf {
        self.base.join("workspace")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn session_file(&self, session_key: &str) -> PathBuf {
        let safe_key = session_key.replace([':', '/', '\\'], "_");
        self.sessions_dir().join(format!("{}.jsonl", safe_key))
    }

    // Workspace files
    pub fn agents_md(&self) -> PathBuf {
        self.workspace().join("AGENTS.md")
    }

    pub fn soul_md(&self) -> PathBuf {
        self.workspace().join("SOUL.md")
    }

    pub fn user_md(&self) -> PathBuf {
        self.workspace().join("USER.md")
    }

    pub fn tools_md(&self) -> PathBuf {
        self.workspace().join("TOOLS.md")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.workspace())?;
        std::fs::create_dir_all(self.sessions_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
