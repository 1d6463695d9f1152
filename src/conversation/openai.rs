//! OpenAI Assistants (v2) implementation of [`ConversationService`].

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::{ConversationError, ConversationService, Message, Role, RunState, RunStatus};

pub struct AssistantsClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    status: String,
    #[serde(default)]
    required_action: Option<RequiredAction>,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RequiredAction {
    submit_tool_outputs: ToolOutputs,
}

#[derive(Debug, Deserialize)]
struct ToolOutputs {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Page size when reading a thread back.
const MESSAGE_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

impl MessageList {
    /// Cursor for the following page, if the service says there is one.
    fn next_cursor(&self) -> Option<String> {
        if !self.has_more {
            return None;
        }
        self.last_id
            .clone()
            .or_else(|| self.data.last().and_then(|m| m.id.clone()))
    }
}

fn messages_path(session: &str, after: Option<&str>) -> String {
    match after {
        Some(cursor) => format!("threads/{session}/messages?order=asc&limit={MESSAGE_PAGE}&after={cursor}"),
        None => format!("threads/{session}/messages?order=asc&limit={MESSAGE_PAGE}"),
    }
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    #[serde(default)]
    id: Option<String>,
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<TextValue>,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}

impl RunObject {
    fn into_state(self) -> RunState {
        let required_actions = self
            .required_action
            .map(|a| {
                a.submit_tool_outputs
                    .tool_calls
                    .into_iter()
                    .map(|c| c.function.name)
                    .collect()
            })
            .unwrap_or_default();
        let last_error = self
            .last_error
            .and_then(|e| e.message.or(e.code));
        RunState {
            status: RunStatus::from_api(&self.status),
            required_actions,
            last_error,
        }
    }
}

impl MessageObject {
    fn into_message(self) -> Message {
        let content = self
            .content
            .into_iter()
            .filter_map(|part| part.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        let role = if self.role == "assistant" {
            Role::Assistant
        } else {
            Role::User
        };
        Message { role, content }
    }
}

impl AssistantsClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn post(&self, path: &str, body: Value) -> Result<ureq::Response, ConversationError> {
        trace!(path, "POST");
        let request = self
            .agent
            .post(&self.url(path))
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("OpenAI-Beta", "assistants=v2");
        request.send_json(body).map_err(map_error)
    }

    fn get(&self, path: &str) -> Result<ureq::Response, ConversationError> {
        trace!(path, "GET");
        self.agent
            .get(&self.url(path))
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("OpenAI-Beta", "assistants=v2")
            .call()
            .map_err(map_error)
    }
}

fn map_error(err: ureq::Error) -> ConversationError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            ConversationError::Network(format!("HTTP {code}: {}", body.trim()))
        }
        ureq::Error::Transport(transport) => ConversationError::Network(transport.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: ureq::Response) -> Result<T, ConversationError> {
    response
        .into_json::<T>()
        .map_err(|e| ConversationError::Network(format!("unreadable response: {e}")))
}

impl ConversationService for AssistantsClient {
    fn create_session(&self, _participant: &str) -> Result<String, ConversationError> {
        let created: Created = decode(self.post("threads", json!({}))?)?;
        debug!(thread = %created.id, "thread created");
        Ok(created.id)
    }

    fn post_message(&self, session: &str, message: &Message) -> Result<(), ConversationError> {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        self.post(
            &format!("threads/{session}/messages"),
            json!({ "role": role, "content": message.content }),
        )?;
        Ok(())
    }

    fn create_run(&self, session: &str, participant: &str) -> Result<String, ConversationError> {
        let created: Created = decode(self.post(
            &format!("threads/{session}/runs"),
            json!({ "assistant_id": participant }),
        )?)?;
        debug!(thread = session, run = %created.id, "run created");
        Ok(created.id)
    }

    fn run_status(&self, session: &str, run: &str) -> Result<RunState, ConversationError> {
        let object: RunObject = decode(self.get(&format!("threads/{session}/runs/{run}"))?)?;
        Ok(object.into_state())
    }

    /// The whole thread, oldest first, following `after` cursors until the
    /// service reports no further pages.
    fn list_messages(&self, session: &str) -> Result<Vec<Message>, ConversationError> {
        let mut messages = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page: MessageList = decode(self.get(&messages_path(session, after.as_deref()))?)?;
            let next = page.next_cursor();
            messages.extend(page.data.into_iter().map(MessageObject::into_message));
            match next {
                Some(cursor) if after.as_deref() != Some(cursor.as_str()) => after = Some(cursor),
                _ => break,
            }
        }
        trace!(thread = session, messages = messages.len(), "thread read back");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_object_with_tool_calls() {
        let object: RunObject = serde_json::from_value(json!({
            "id": "run_abc",
            "status": "requires_action",
            "required_action": {
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "failed_test", "arguments": "{}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "passed_test", "arguments": "{}"}}
                    ]
                }
            },
            "last_error": null
        }))
        .unwrap();
        let state = object.into_state();
        assert_eq!(state.status, RunStatus::RequiresAction);
        assert_eq!(state.required_actions, vec!["failed_test", "passed_test"]);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn run_object_with_error() {
        let object: RunObject = serde_json::from_value(json!({
            "status": "failed",
            "last_error": {"code": "rate_limit_exceeded", "message": "Rate limit reached"}
        }))
        .unwrap();
        let state = object.into_state();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("Rate limit reached"));
    }

    #[test]
    fn message_list_keeps_text_parts() {
        let list: MessageList = serde_json::from_value(json!({
            "object": "list",
            "data": [
                {"role": "user", "content": [{"type": "text", "text": {"value": "page", "annotations": []}}]},
                {"role": "assistant", "content": [
                    {"type": "image_file", "image_file": {"file_id": "f"}},
                    {"type": "text", "text": {"value": "passed", "annotations": []}}
                ]}
            ]
        }))
        .unwrap();
        let messages: Vec<Message> = list.data.into_iter().map(MessageObject::into_message).collect();
        assert_eq!(messages, vec![Message::user("page"), Message::assistant("passed")]);
    }

    #[test]
    fn long_threads_are_read_page_by_page() {
        let first: MessageList = serde_json::from_value(json!({
            "object": "list",
            "data": [
                {"id": "msg_1", "role": "user", "content": []},
                {"id": "msg_100", "role": "user", "content": []}
            ],
            "first_id": "msg_1",
            "last_id": "msg_100",
            "has_more": true
        }))
        .unwrap();
        assert_eq!(first.next_cursor().as_deref(), Some("msg_100"));
        assert_eq!(
            messages_path("thread_1", Some("msg_100")),
            "threads/thread_1/messages?order=asc&limit=100&after=msg_100"
        );

        let last: MessageList = serde_json::from_value(json!({
            "data": [{"id": "msg_101", "role": "assistant", "content": []}],
            "last_id": "msg_101",
            "has_more": false
        }))
        .unwrap();
        assert_eq!(last.next_cursor(), None);
        assert_eq!(
            messages_path("thread_1", None),
            "threads/thread_1/messages?order=asc&limit=100"
        );
    }

    #[test]
    fn missing_last_id_falls_back_to_final_message() {
        let page: MessageList = serde_json::from_value(json!({
            "data": [{"id": "msg_7", "role": "user", "content": []}],
            "has_more": true
        }))
        .unwrap();
        assert_eq!(page.next_cursor().as_deref(), Some("msg_7"));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = AssistantsClient::new("https://api.example.com/v1/", "k", Duration::from_secs(1));
        assert_eq!(client.url("threads"), "https://api.example.com/v1/threads");
    }

    #[test]
    fn unreachable_service_is_a_network_failure() {
        let client = AssistantsClient::new("http://127.0.0.1:9/v1", "k", Duration::from_secs(2));
        assert!(matches!(
            client.create_session("asst"),
            Err(ConversationError::Network(_))
        ));
    }
}
