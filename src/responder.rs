use crate::llm::{CompletionClient, LlmError, LlmMessage};
use crate::models::{
    Credential, GeneratedResponse, GenerationStatus, ProcessingLogEntry, ProductInfo, Review,
};
use crate::store::{ReviewStore, StoreError};
use chrono::Utc;
use rand::seq::IndexedRandom;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_PROMPT: &str = "Ты представитель продавца на маркетплейсе. \
     Коротко и вежливо ответь покупателю на отзыв о товаре.";
pub const EMPTY_REVIEW_PLACEHOLDER: &str = "Пользователь не оставил комментарий";
const EXAMPLE_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Generated(String),
    Fallback { text: String, reason: String },
}

impl GenerationOutcome {
    pub fn text(&self) -> &str {
        match self {
            GenerationOutcome::Generated(text) => text,
            GenerationOutcome::Fallback { text, .. } => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, GenerationOutcome::Fallback { .. })
    }
}

#[derive(Debug, Error)]
enum GenerationError {
    #[error("prompt lookup failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Inputs of one reply generation.
#[derive(Debug, Clone, Copy)]
pub struct ReplyRequest<'a> {
    pub review_text: &'a str,
    pub product_name: Option<&'a str>,
    pub sku: Option<i64>,
    pub rating: Option<i32>,
}

impl<'a> ReplyRequest<'a> {
    pub fn for_review(review: &'a Review, product: Option<&'a ProductInfo>) -> Self {
        Self {
            review_text: &review.text,
            product_name: product.and_then(|p| p.product_name.as_deref()),
            sku: Some(review.sku),
            rating: Some(review.rating),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub generated: usize,
    pub fallbacks: usize,
    pub errors: usize,
}

pub fn compose_instruction(base: Option<&str>, product_override: Option<&str>) -> String {
    let base = base
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PROMPT);
    match product_override.map(str::trim).filter(|p| !p.is_empty()) {
        Some(extra) => format!("{base}\n\n{extra}"),
        None => base.to_string(),
    }
}

/// Up to three distinct examples, in random order.
pub fn sample_examples(pool: &[String]) -> Vec<String> {
    let mut rng = rand::rng();
    pool.choose_multiple(&mut rng, EXAMPLE_LIMIT)
        .cloned()
        .collect()
}

pub fn build_context(product_name: Option<&str>, rating: Option<i32>) -> String {
    let mut lines = Vec::new();
    if let Some(name) = product_name.filter(|n| !n.trim().is_empty()) {
        lines.push(format!("Товар: {name}"));
    }
    if let Some(rating) = rating {
        lines.push(format!("Оценка: {rating}/5"));
    }
    lines.join("\n")
}

pub fn build_messages(
    instruction: &str,
    examples: &[String],
    context: &str,
    review_text: &str,
) -> Vec<LlmMessage> {
    let mut system = instruction.to_string();
    if !examples.is_empty() {
        system.push_str("\n\nПримеры ответов:\n");
        let listed: Vec<String> = examples.iter().map(|e| format!("- {e}")).collect();
        system.push_str(&listed.join("\n"));
        system.push_str("\nВдохновляйся этими примерами и перефразируй их.");
    }
    if !context.is_empty() {
        system.push_str("\n\n");
        system.push_str(context);
    }
    let user = if review_text.trim().is_empty() {
        EMPTY_REVIEW_PLACEHOLDER
    } else {
        review_text
    };
    vec![LlmMessage::system(system), LlmMessage::user(user)]
}

pub fn fallback_reply(product_name: Option<&str>, rating: Option<i32>) -> String {
    let mut reply = String::from("Спасибо за ваш отзыв!");
    if let Some(name) = product_name.filter(|n| !n.trim().is_empty()) {
        reply.push_str(&format!(" Мы учтем ваше мнение о товаре {name}."));
    }
    if rating.is_some_and(|r| r < 4) {
        reply.push_str(" Приносим извинения за доставленные неудобства.");
    }
    reply
}

pub struct ResponseEngine {
    store: Arc<dyn ReviewStore>,
    llm: Arc<dyn CompletionClient>,
}

impl ResponseEngine {
    pub fn new(store: Arc<dyn ReviewStore>, llm: Arc<dyn CompletionClient>) -> Self {
        Self { store, llm }
    }

    async fn try_generate(
        &self,
        request: &ReplyRequest<'_>,
        credential: &Credential,
        examples: &[String],
    ) -> Result<String, GenerationError> {
        let base = self.store.active_prompt().await?;
        let product_override = match request.sku {
            Some(sku) => self.store.product_prompt(sku).await?,
            None => None,
        };
        let instruction = compose_instruction(base.as_deref(), product_override.as_deref());
        let context = build_context(request.product_name, request.rating);
        let messages = build_messages(&instruction, examples, &context, request.review_text);
        let text = self
            .llm
            .complete(
                credential.gpt_api_key.as_deref(),
                credential.gpt_folder.as_deref(),
                &messages,
            )
            .await?;
        Ok(text)
    }

    /// Never fails: any error turns into the templated fallback. Both paths
    /// write a generation log row.
    pub async fn generate(
        &self,
        request: &ReplyRequest<'_>,
        credential: &Credential,
        examples: &[String],
    ) -> GenerationOutcome {
        let (outcome, entry) = match self.try_generate(request, credential, examples).await {
            Ok(text) => {
                crate::metrics::reply_generated("generated");
                let entry = ProcessingLogEntry::generation(
                    GenerationStatus::Success,
                    request.review_text,
                    &text,
                );
                (GenerationOutcome::Generated(text), entry)
            }
            Err(err) => {
                crate::metrics::reply_generated("fallback");
                warn!(
                    target = "reviews.generate",
                    seller_id = %credential.seller_id,
                    error = %err,
                    "completion failed, using fallback"
                );
                let reason = err.to_string();
                let entry = ProcessingLogEntry::generation(
                    GenerationStatus::Error,
                    request.review_text,
                    &reason,
                );
                let text = fallback_reply(request.product_name, request.rating);
                (GenerationOutcome::Fallback { text, reason }, entry)
            }
        };
        if let Err(err) = self.store.append_log(&entry).await {
            warn!(target = "reviews.generate", error = %err, "failed to write generation log");
        }
        outcome
    }

    /// Generates and stores replies for the seller's unanswered reviews.
    pub async fn process_pending(
        &self,
        credential: &Credential,
        batch: usize,
    ) -> Result<GenerationReport, StoreError> {
        let pool = match self.store.predefined_responses().await {
            Ok(pool) => pool,
            Err(err) => {
                warn!(target = "reviews.generate", error = %err, "example pool unavailable");
                Vec::new()
            }
        };
        let pending = self
            .store
            .reviews_awaiting_response(&credential.seller_id, batch)
            .await?;
        let mut report = GenerationReport::default();
        if pending.is_empty() {
            debug!(target = "reviews.generate", seller_id = %credential.seller_id, "nothing to generate");
            return Ok(report);
        }

        for (review, product) in &pending {
            let examples = sample_examples(&pool);
            let request = ReplyRequest::for_review(review, product.as_ref());
            let outcome = self.generate(&request, credential, &examples).await;
            let response = GeneratedResponse {
                review_id: review.id.clone(),
                seller_id: review.seller_id.clone(),
                text: outcome.text().to_string(),
                created_at: Utc::now(),
            };
            match self.store.save_response(&response).await {
                Ok(()) if outcome.is_fallback() => report.fallbacks += 1,
                Ok(()) => report.generated += 1,
                Err(err) => {
                    warn!(
                        target = "reviews.generate",
                        review_id = %review.id,
                        error = %err,
                        "failed to store reply"
                    );
                    report.errors += 1;
                }
            }
        }
        info!(
            target = "reviews.generate",
            seller_id = %credential.seller_id,
            generated = report.generated,
            fallbacks = report.fallbacks,
            errors = report.errors,
            "generation pass finished"
        );
        Ok(report)
    }
}
