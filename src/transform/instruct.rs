use crate::history::{ChatHistory, Role};

use super::PromptTransform;

/// 命名轮次的 instruct 模板，适用于没有专用对话控制 token 的模型：
/// 每条消息渲染为 "Name: content"，结尾留下 "Assistant:" 等待续写。
pub struct InstructTransform {
    system_name: String,
    user_name: String,
    assistant_name: String,
    unknown_name: String,
    stops: Vec<String>,
}

impl Default for InstructTransform {
    fn default() -> Self {
        let user_name = "User".to_string();
        Self {
            system_name: "System".to_string(),
            stops: vec![format!("\n{}:", user_name)],
            user_name,
            assistant_name: "Assistant".to_string(),
            unknown_name: "??".to_string(),
        }
    }
}

impl InstructTransform {
    fn name_for(&self, role: Role) -> &str {
        match role {
            Role::System => &self.system_name,
            Role::User => &self.user_name,
            Role::Assistant => &self.assistant_name,
            Role::Unknown => &self.unknown_name,
        }
    }
}

impl PromptTransform for InstructTransform {
    fn render(&self, history: &ChatHistory) -> String {
        let mut out = String::new();
        for message in history.messages() {
            out.push_str(&format!(
                "{}: {}\n",
                self.name_for(message.role),
                message.content
            ));
        }
        out.push_str(&format!("{}:", self.assistant_name));
        out
    }

    fn stop_sequences(&self) -> &[String] {
        &self.stops
    }

    fn trim_output(&self, text: &str) -> String {
        let assistant_marker = format!("{}:", self.assistant_name);
        // 剥掉一层标记可能露出下一层，循环到不再变化为止
        let mut current = text.to_string();
        loop {
            let mut next = current.clone();
            if let Some(rest) = next.strip_prefix(&assistant_marker) {
                next = rest.trim_start().to_string();
            }
            if let Some(rest) = next.strip_suffix(&assistant_marker) {
                next = rest.trim_end().to_string();
            }
            // instruct 续写标记
            if let Some(rest) = next.strip_suffix("\n> ") {
                next = rest.trim_end().to_string();
            }
            if next == current {
                return next;
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatMessage;

    #[test]
    fn renders_named_turns() {
        let t = InstructTransform::default();
        let history: ChatHistory = vec![
            ChatMessage::new(Role::System, "Be brief."),
            ChatMessage::new(Role::User, "hello"),
        ]
        .into_iter()
        .collect();
        assert_eq!(t.render(&history), "System: Be brief.\nUser: hello\nAssistant:");
    }

    #[test]
    fn trim_is_idempotent_over_all_markers() {
        let t = InstructTransform::default();
        let trimmed = t.trim_output("Assistant: 4\n> ");
        assert_eq!(trimmed, "4");
        assert_eq!(t.trim_output(&trimmed), "4");
    }

    #[test]
    fn trim_strips_stacked_markers_in_one_call() {
        let t = InstructTransform::default();
        // 续写标记压在回显的角色名上，一次调用要剥干净
        let trimmed = t.trim_output("4 Assistant:\n> ");
        assert_eq!(trimmed, "4");
        assert_eq!(t.trim_output(&trimmed), "4");
    }

    #[test]
    fn stops_block_next_user_turn() {
        let t = InstructTransform::default();
        assert_eq!(t.stop_sequences(), &["\nUser:".to_string()]);
    }
}
