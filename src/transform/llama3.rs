use crate::history::{ChatHistory, Role};

use super::PromptTransform;

/// llama3 对话模板：每条消息包一层 header 控制 token，
/// 结尾追加未闭合的 assistant header 等待生成。
pub struct Llama3Transform {
    assistant_name: String,
    user_name: String,
    stops: Vec<String>,
}

impl Default for Llama3Transform {
    fn default() -> Self {
        Self {
            assistant_name: "Assistant".to_string(),
            user_name: "User".to_string(),
            stops: vec!["<|eot_id|>".to_string(), "<|end_of_text|>".to_string()],
        }
    }
}

impl PromptTransform for Llama3Transform {
    fn render(&self, history: &ChatHistory) -> String {
        let mut out = String::new();
        for message in history.messages() {
            let header = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                // llama3 模板没有第四种角色，未知消息按 user 处理
                Role::Unknown => "user",
            };
            out.push_str("<|begin_of_text|>");
            out.push_str(&format!(
                "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                header, message.content
            ));
        }
        out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        out
    }

    fn stop_sequences(&self) -> &[String] {
        &self.stops
    }

    fn trim_output(&self, text: &str) -> String {
        let user_prefix = format!("{}:", self.user_name);
        let assistant_suffix = format!("{}:", self.assistant_name);
        // 标记可能层层叠在一起（"... Assistant:<|eot_id|>"），
        // 剥掉一层会露出下一层，循环到不再变化为止
        let mut current = text.to_string();
        loop {
            let mut next = current.clone();
            if let Some(rest) = next.strip_prefix(&user_prefix) {
                next = rest.trim_start().to_string();
            }
            if let Some(rest) = next.strip_suffix(&assistant_suffix) {
                next = rest.trim_end().to_string();
            }
            // 停止序列偶尔会原样出现在输出尾部
            for stop in &self.stops {
                if let Some(rest) = next.strip_suffix(stop.as_str()) {
                    next = rest.trim_end().to_string();
                }
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

    fn history() -> ChatHistory {
        vec![
            ChatMessage::new(Role::System, "You are terse."),
            ChatMessage::new(Role::User, "2+2?"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn renders_messages_in_order_with_open_assistant_turn() {
        let t = Llama3Transform::default();
        let prompt = t.render(&history());
        let sys = prompt.find("system<|end_header_id|>\n\nYou are terse.").unwrap();
        let user = prompt.find("user<|end_header_id|>\n\n2+2?").unwrap();
        assert!(sys < user);
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn trim_strips_echoed_names_and_is_idempotent() {
        let t = Llama3Transform::default();
        let once = t.trim_output("4 Assistant:");
        assert_eq!(once, "4");
        assert_eq!(t.trim_output(&once), "4");

        let prefixed = t.trim_output("User: what?");
        assert_eq!(prefixed, "what?");
        assert_eq!(t.trim_output(&prefixed), "what?");
    }

    #[test]
    fn trim_strips_stacked_markers_in_one_call() {
        let t = Llama3Transform::default();
        // 停止序列压在回显的角色名上，一次调用要剥干净
        let trimmed = t.trim_output("4 Assistant:<|eot_id|>");
        assert_eq!(trimmed, "4");
        assert_eq!(t.trim_output(&trimmed), "4");
        assert_eq!(t.trim_output("User: 4<|end_of_text|>"), "4");
    }

    #[test]
    fn trim_strips_trailing_stop_token() {
        let t = Llama3Transform::default();
        assert_eq!(t.trim_output("4<|eot_id|>"), "4");
    }

    #[test]
    fn default_stops_cover_turn_and_text_end() {
        let t = Llama3Transform::default();
        assert_eq!(
            t.stop_sequences(),
            &["<|eot_id|>".to_string(), "<|end_of_text|>".to_string()]
        );
    }
}
