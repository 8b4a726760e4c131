use base64::Engine;
use chrono::Local;
use nanocell_core::paths::BOOTSTRAP_FILES;
use nanocell_core::types::{ChatMessage, ContentPart};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Assembles the message list for one primary-agent turn.
pub struct ContextBuilder {
    workspace: PathBuf,
}

impl ContextBuilder {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Identity section followed by every bootstrap file present in the
    /// workspace, separated by horizontal rules.
    pub fn build_system_prompt(&self) -> String {
        let mut parts = vec![self.identity()];

        for file in BOOTSTRAP_FILES {
            if let Some(content) = self.load_file_if_exists(self.workspace.join(file)) {
                parts.push(format!("## {}\n\n{}", file, content.trim_end()));
            }
        }

        parts.join("\n\n---\n\n")
    }

    fn identity(&self) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");
        format!(
            "# nanocell\n\n\
             You are nanocell, an AI assistant with access to tools.\n\n\
             ## Current Time\n{}\n\n\
             ## Workspace\nYour workspace is at: {}\n\n\
             ## Tools\n\
             - Use tools when needed; otherwise answer directly.\n\
             - Use `spawn` for long-running or independent work. The result is announced back to this conversation when it finishes.\n\
             - Use `message` only to reach a different channel or chat. Your normal reply is delivered automatically.\n\
             - After tool calls, reply to the user with a concise summary of the outcome.",
            now,
            self.workspace.display()
        )
    }

    /// `[system, ...history, user]`.
    pub fn build_messages(&self, history: &[ChatMessage], content: &str, media: &[String]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&self.build_system_prompt()));
        messages.extend(history.iter().cloned());
        messages.push(self.build_user_message(content, media));
        messages
    }

    /// A plain text user turn, or a multi-part one with every readable image
    /// in `media` ahead of the text.
    pub fn build_user_message(&self, content: &str, media: &[String]) -> ChatMessage {
        let mut parts: Vec<ContentPart> = media
            .iter()
            .filter_map(|path| encode_image_to_data_url(Path::new(path)))
            .map(ContentPart::image_url)
            .collect();

        if parts.is_empty() {
            return ChatMessage::user(content);
        }

        parts.push(ContentPart::text(content));
        ChatMessage::user_parts(parts)
    }

    fn load_file_if_exists<P: AsRef<Path>>(&self, path: P) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

fn encode_image_to_data_url(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime_type = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => {
            debug!(path = %path.display(), "Skipping non-image media");
            return None;
        }
    };

    match std::fs::read(path) {
        Ok(bytes) => {
            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
            Some(format!("data:{};base64,{}", mime_type, data))
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Skipping unreadable media");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanocell_core::types::{MessageContent, Role};

    #[test]
    fn test_system_prompt_includes_bootstrap_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("USER.md"), "Call me Sam.\n").unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Be brief.").unwrap();

        let prompt = ContextBuilder::new(dir.path().to_path_buf()).build_system_prompt();
        assert!(prompt.starts_with("# nanocell"));
        assert!(prompt.contains(&dir.path().display().to_string()));

        let agents = prompt.find("## AGENTS.md\n\nBe brief.").unwrap();
        let user = prompt.find("## USER.md\n\nCall me Sam.").unwrap();
        assert!(agents < user);
        assert!(!prompt.contains("## SOUL.md"));
        assert_eq!(prompt.matches("\n\n---\n\n").count(), 2);
    }

    #[test]
    fn test_build_messages_order() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path().to_path_buf());
        let history = vec![ChatMessage::user("earlier"), ChatMessage::assistant("reply")];

        let messages = builder.build_messages(&history, "now", &[]);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], history[0]);
        assert_eq!(messages[2], history[1]);
        assert_eq!(messages[3], ChatMessage::user("now"));
    }

    #[test]
    fn test_user_message_puts_images_before_text() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("cat.PNG");
        std::fs::write(&image, [0x89, b'P', b'N', b'G']).unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "not an image").unwrap();

        let builder = ContextBuilder::new(dir.path().to_path_buf());
        let media = vec![
            notes.display().to_string(),
            dir.path().join("missing.jpg").display().to_string(),
            image.display().to_string(),
        ];
        let msg = builder.build_user_message("what is this?", &media);

        let MessageContent::Parts(parts) = &msg.content else {
            panic!("expected multi-part content");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], ContentPart::image_url("data:image/png;base64,iVBORw=="));
        assert_eq!(parts[1], ContentPart::text("what is this?"));
    }

    #[test]
    fn test_user_message_without_readable_images_is_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path().to_path_buf());
        let msg = builder.build_user_message("hi", &["/nonexistent/a.png".to_string()]);
        assert_eq!(msg, ChatMessage::user("hi"));
    }
}
