//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel};
use rig::message::Message;
use rust_decimal::Decimal;

use super::costs;
use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
use crate::error::LlmError;

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    input_cost: Decimal,
    output_cost: Decimal,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        let (input_cost, output_cost) = costs::model_cost(model_name);
        Self {
            model,
            model_name: model_name.to_string(),
            input_cost,
            output_cost,
        }
    }
}

/// Split our flat message list into rig's (preamble, history, prompt) shape.
fn split_messages(
    messages: Vec<ChatMessage>,
) -> Result<(Option<String>, Vec<Message>, Message), String> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system.push(msg.content),
            Role::User => turns.push(Message::user(msg.content)),
            Role::Assistant => turns.push(Message::assistant(msg.content)),
        }
    }

    let prompt = turns.pop().ok_or("request has no user message")?;
    let preamble = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    Ok((preamble, turns, prompt))
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (self.input_cost, self.output_cost)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) =
            split_messages(request.messages).map_err(|reason| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason,
            })?;

        let mut builder = self.model.completion_request(prompt);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if !history.is_empty() {
            builder = builder.messages(history);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "no text content in response".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_collects_system_and_keeps_last_turn_as_prompt() {
        let (preamble, history, _prompt) = split_messages(vec![
            ChatMessage::system("a"),
            ChatMessage::system("b"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ])
        .unwrap();
        assert_eq!(preamble.as_deref(), Some("a\n\nb"));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn split_rejects_system_only() {
        assert!(split_messages(vec![ChatMessage::system("only")]).is_err());
    }
}
