//! Router: split an inquiry into intent segments and classify each one.
//!
//! Classification is a pure function over a closed category set ([`classify`]). Keyword hits
//! score 1, explicit domain markers (catalog product names, error codes, order/ticket/account
//! identifiers) score 3. A category wins when it reaches the minimum score and is strictly
//! ahead; a tie goes to the category with explicit markers, otherwise the text is routed to
//! every tied category. [`Router::route`] never fails: internal failures yield one
//! `Ambiguous` segment spanning the whole inquiry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::config::RouterConfig;
use crate::knowledge::Catalog;
use crate::llm::{CompletionOptions, Inference, InferenceError};
use crate::orchestrator::{ConversationContext, EntityKind, Inquiry};

/// Slot keys produced by the router.
pub mod slots {
    /// Order reference as written by the customer (validated later by the billing agent).
    pub const ORDER_REF: &str = "order_ref";
    pub const TICKET_REF: &str = "ticket_ref";
    pub const ERROR_CODE: &str = "error_code";
    /// Catalog id of a named product or add-on.
    pub const PRODUCT: &str = "product";
    pub const ACCOUNT_ID: &str = "account_id";
    /// First keyword that matched the segment's category.
    pub const TOPIC: &str = "topic";
}

/// Longer inquiries are not segmented.
pub const MAX_INQUIRY_CHARS: usize = 4000;

const MARKER_SCORE: u32 = 3;
const KEYWORD_SCORE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Product,
    TechnicalSupport,
    OrderBilling,
    AccountManagement,
    Ambiguous,
}

impl Category {
    pub const ROUTABLE: [Category; 4] = [
        Category::Product,
        Category::TechnicalSupport,
        Category::OrderBilling,
        Category::AccountManagement,
    ];

    /// Label used for reply parts.
    pub fn label(self) -> &'static str {
        match self {
            Category::Product => "Product information",
            Category::TechnicalSupport => "Technical support",
            Category::OrderBilling => "Order and billing",
            Category::AccountManagement => "Account management",
            Category::Ambiguous => "Clarification",
        }
    }

    /// Name of the capability answering this category, for failure notes.
    pub fn capability(self) -> &'static str {
        match self {
            Category::Product => "product information",
            Category::TechnicalSupport => "technical support",
            Category::OrderBilling => "order and billing lookup",
            Category::AccountManagement => "account management",
            Category::Ambiguous => "clarification",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One self-contained request extracted from an inquiry. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSegment {
    pub index: usize,
    pub category: Category,
    pub slots: BTreeMap<String, String>,
    /// The inquiry text this segment covers.
    pub span: String,
    /// Index of an earlier segment whose accepted identifiers this one refers back to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<usize>,
}

impl IntentSegment {
    pub fn slot(&self, key: &str) -> Option<&str> {
        self.slots.get(key).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassificationFailure {
    #[error("inquiry is empty")]
    Empty,
    #[error("inquiry longer than {0} characters")]
    TooLong(usize),
    #[error("segmentation produced no segments")]
    NoSegments,
    #[error("classifier call failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("malformed classifier output: {0}")]
    Malformed(String),
    #[error("classifier confidence {0:.2} below threshold")]
    LowConfidence(f32),
    #[error("classifier asked for clarification")]
    NeedsClarification,
}

/// Result of [`classify`]: the winning categories and the scores behind them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// One category; several on an unresolved tie; `[Ambiguous]` below threshold.
    pub categories: Vec<Category>,
    pub scores: BTreeMap<Category, u32>,
    /// Categories with at least one explicit marker.
    pub explicit: BTreeSet<Category>,
    /// First matching keyword or marker per category.
    pub topics: BTreeMap<Category, String>,
}

impl Classification {
    pub fn primary(&self) -> Category {
        self.categories.first().copied().unwrap_or(Category::Ambiguous)
    }

    pub fn has_signal(&self) -> bool {
        self.scores.values().any(|s| *s > 0)
    }
}

const PRODUCT_KEYWORDS: &[&str] = &[
    "price", "prices", "pricing", "cost", "costs", "how much", "plans", "tier", "tiers",
    "feature", "features", "compare", "comparison", "difference", "upgrade", "downgrade",
    "trial", "add on", "addon", "add ons", "included", "include", "includes", "user limit",
];

const TECHNICAL_KEYWORDS: &[&str] = &[
    "error", "errors", "bug", "crash", "crashes", "crashing", "fail", "fails", "failed",
    "failing", "failure", "not working", "broken", "deploy", "deploying", "deployment",
    "deployments", "container", "containers", "timeout", "timeouts", "slow", "pending", "stuck",
    "rollback", "roll back", "fix", "troubleshoot", "troubleshooting", "issue", "problem",
    "connection", "connect", "cluster", "image", "dashboard",
];

const BILLING_KEYWORDS: &[&str] = &[
    "order", "orders", "invoice", "invoices", "billing", "bill", "billed", "charge", "charged",
    "refund", "refunds", "payment", "payments", "pay", "receipt", "shipping", "shipped",
    "delivery", "delivered", "purchase", "ticket", "tickets", "credit card", "subscription",
    "cancel",
];

const ACCOUNT_KEYWORDS: &[&str] = &[
    "account", "user", "users", "seat", "seats", "password", "login", "log in", "sign in",
    "permission", "permissions", "role", "roles", "team member", "team members", "admin",
    "sso", "renewal", "renew",
];

static ERROR_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bE\d{4}\b").expect("error code pattern"));
static ORDER_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bORD-[A-Z0-9]+\b").expect("order marker pattern"));
static HASH_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#\s*([A-Za-z0-9][A-Za-z0-9-]*)").expect("hash reference pattern"));
static ORDER_WORD_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\border\s+(?:number\s+|no\.?\s*|id\s+)?([A-Za-z0-9-]*\d[A-Za-z0-9-]*)")
        .expect("order reference pattern")
});
static TICKET_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bTKT-[A-Z0-9]+\b").expect("ticket marker pattern"));
static TICKET_WORD_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bticket\s+(?:number\s+|no\.?\s*|id\s+)?([A-Za-z0-9-]*\d[A-Za-z0-9-]*)")
        .expect("ticket reference pattern")
});
static ACCOUNT_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bACC-[A-Z0-9]+\b").expect("account marker pattern"));
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+(?:\s+|$)|\n+").expect("sentence pattern"));
static CONNECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|[\s,;]+)(?:also|additionally|in addition|another question|separately|and can you|and could you|plus)\b[\s,:]*",
    )
    .expect("connective pattern")
});
static CONJUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[\s,]+(?:and|but|while)\s+").expect("conjunction pattern"));
static ANAPHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:that|this|the same|same|my last)\s+(order|ticket|account|error|code|plan|product)\b")
        .expect("anaphor pattern")
});

/// Lower-case words separated by single spaces, padded with a space on both ends.
pub(crate) fn normalize_words(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    format!(" {} ", words.join(" "))
}

/// Domain vocabulary for classification: catalog names plus the routing threshold.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// (normalized name, catalog id), longest first.
    products: Vec<(String, String)>,
    min_score: u32,
}

impl Vocabulary {
    pub fn new(catalog: &Catalog, min_score: u32) -> Self {
        let mut products: Vec<(String, String)> = catalog
            .names()
            .into_iter()
            .map(|(name, id)| (normalize_words(&name), id))
            .filter(|(name, _)| name.trim().len() > 2)
            .collect();
        products.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        products.dedup_by(|a, b| a.0 == b.0);
        Self {
            products,
            min_score: min_score.max(1),
        }
    }

    /// Catalog id of the first (longest) product name found in `normalized`.
    fn product_in(&self, normalized: &str) -> Option<(&str, &str)> {
        self.products
            .iter()
            .find(|(name, _)| normalized.contains(name.as_str()))
            .map(|(name, id)| (name.trim(), id.as_str()))
    }
}

fn keywords(category: Category) -> &'static [&'static str] {
    match category {
        Category::Product => PRODUCT_KEYWORDS,
        Category::TechnicalSupport => TECHNICAL_KEYWORDS,
        Category::OrderBilling => BILLING_KEYWORDS,
        Category::AccountManagement => ACCOUNT_KEYWORDS,
        Category::Ambiguous => &[],
    }
}

/// First explicit marker for `category` in `text`, if any.
fn marker(category: Category, text: &str, normalized: &str, vocab: &Vocabulary) -> Option<String> {
    match category {
        Category::Product => vocab.product_in(normalized).map(|(name, _)| name.to_string()),
        Category::TechnicalSupport => ERROR_CODE.find(text).map(|m| m.as_str().to_string()),
        Category::OrderBilling => ORDER_MARK
            .find(text)
            .or_else(|| TICKET_MARK.find(text))
            .or_else(|| HASH_REF.find(text))
            .map(|m| m.as_str().to_string()),
        Category::AccountManagement => ACCOUNT_MARK.find(text).map(|m| m.as_str().to_string()),
        Category::Ambiguous => None,
    }
}

/// Classify one piece of text. Pure: same text and vocabulary, same result.
pub fn classify(text: &str, vocab: &Vocabulary) -> Classification {
    let normalized = normalize_words(text);
    let mut scores = BTreeMap::new();
    let mut explicit = BTreeSet::new();
    let mut topics = BTreeMap::new();
    for category in Category::ROUTABLE {
        let mut score = 0;
        if let Some(m) = marker(category, text, &normalized, vocab) {
            score += MARKER_SCORE;
            explicit.insert(category);
            topics.insert(category, m);
        }
        for kw in keywords(category) {
            if normalized.contains(&format!(" {} ", kw)) {
                score += KEYWORD_SCORE;
                topics.entry(category).or_insert_with(|| kw.to_string());
            }
        }
        scores.insert(category, score);
    }

    let best = scores.values().copied().max().unwrap_or(0);
    let categories = if best < vocab.min_score {
        vec![Category::Ambiguous]
    } else {
        let tied: Vec<Category> = scores
            .iter()
            .filter(|(_, s)| **s == best)
            .map(|(c, _)| *c)
            .collect();
        if tied.len() == 1 {
            tied
        } else {
            let with_markers: Vec<Category> =
                tied.iter().copied().filter(|c| explicit.contains(c)).collect();
            if with_markers.len() == 1 {
                with_markers
            } else {
                tied
            }
        }
    };
    Classification {
        categories,
        scores,
        explicit,
        topics,
    }
}

/// Slots explicitly present in `text`.
pub fn extract_slots(text: &str, vocab: &Vocabulary, category: Category, class: &Classification) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(m) = ERROR_CODE.find(text) {
        out.insert(slots::ERROR_CODE.to_string(), m.as_str().to_ascii_uppercase());
    }
    let lower = text.to_lowercase();
    let ticket_context = lower.contains("ticket") && !lower.contains("order");
    if let Some(m) = TICKET_MARK.find(text) {
        out.insert(slots::TICKET_REF.to_string(), m.as_str().to_string());
    } else if let Some(c) = TICKET_WORD_REF.captures(text) {
        out.insert(slots::TICKET_REF.to_string(), c[1].to_string());
    } else if ticket_context {
        if let Some(c) = HASH_REF.captures(text) {
            out.insert(slots::TICKET_REF.to_string(), c[1].to_string());
        }
    }
    if let Some(m) = ORDER_MARK.find(text) {
        out.insert(slots::ORDER_REF.to_string(), m.as_str().to_string());
    } else if let Some(c) = ORDER_WORD_REF.captures(text) {
        out.insert(slots::ORDER_REF.to_string(), c[1].to_string());
    } else if !ticket_context {
        if let Some(c) = HASH_REF.captures(text) {
            out.insert(slots::ORDER_REF.to_string(), c[1].to_string());
        }
    }
    if let Some(m) = ACCOUNT_MARK.find(text) {
        out.insert(slots::ACCOUNT_ID.to_string(), m.as_str().to_ascii_uppercase());
    }
    if let Some((_, id)) = vocab.product_in(&normalize_words(text)) {
        out.insert(slots::PRODUCT.to_string(), id.to_string());
    }
    if let Some(topic) = class.topics.get(&category) {
        out.insert(slots::TOPIC.to_string(), topic.clone());
    }
    out
}

/// Split on sentence terminators, then on clause connectives. Returned pieces are trimmed
/// substrings of `text`.
fn split_clauses(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        sentences.push(&text[start..m.end()]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    let mut out = Vec::new();
    for sentence in sentences {
        let mut last = 0;
        for m in CONNECTIVE.find_iter(sentence) {
            out.push(&sentence[last..m.start()]);
            last = m.end();
        }
        out.push(&sentence[last..]);
    }
    out.into_iter()
        .map(str::trim)
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .collect()
}

/// Split a clause on "and"/"but"/"while" when every part carries its own signal and adjacent
/// parts classify differently; otherwise keep it whole.
fn split_conjunctions<'a>(clause: &'a str, vocab: &Vocabulary) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut last = 0;
    for m in CONJUNCTION.find_iter(clause) {
        parts.push(clause[last..m.start()].trim());
        last = m.end();
    }
    parts.push(clause[last..].trim());
    if parts.len() < 2 {
        return vec![clause];
    }
    let classes: Vec<Classification> = parts.iter().map(|p| classify(p, vocab)).collect();
    let all_signaled = classes
        .iter()
        .all(|c| c.has_signal() && c.primary() != Category::Ambiguous);
    let all_distinct = classes.windows(2).all(|w| w[0].categories != w[1].categories);
    if all_signaled && all_distinct {
        parts
    } else {
        vec![clause]
    }
}

/// (slot key, category) an anaphor like "that order" refers to.
fn anaphor(text: &str) -> Option<(&'static str, Category)> {
    let caps = ANAPHOR.captures(text)?;
    let noun = caps.get(1)?.as_str().to_lowercase();
    Some(match noun.as_str() {
        "order" => (slots::ORDER_REF, Category::OrderBilling),
        "ticket" => (slots::TICKET_REF, Category::OrderBilling),
        "account" => (slots::ACCOUNT_ID, Category::AccountManagement),
        "error" | "code" => (slots::ERROR_CODE, Category::TechnicalSupport),
        _ => (slots::PRODUCT, Category::Product),
    })
}

#[derive(Debug, Deserialize)]
struct LlmVerdict {
    classification: String,
    confidence: f32,
    #[serde(default)]
    requires_clarification: bool,
}

const CLASSIFIER_PROMPT: &str = r#"You route customer support questions for TechSolutions CloudManager.
Classify the query into exactly one category:
- Product: products, features, pricing, plans
- Technical: errors, issues, troubleshooting
- Billing: orders, invoices, payments, subscriptions
- Account: user management, access, settings
- General: anything that fits none of the above
Respond with JSON only, in this format:
{"classification": "Product", "confidence": 0.9, "requires_clarification": false}"#;

/// Strip code fences and keep the first `{` through the last `}`.
fn clean_json(response: &str) -> &str {
    let trimmed = response.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

struct LlmFallback {
    inference: Arc<dyn Inference>,
    min_confidence: f32,
}

impl LlmFallback {
    async fn classify(&self, text: &str) -> Result<Category, ClassificationFailure> {
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(128),
            ..CompletionOptions::with_system(CLASSIFIER_PROMPT)
        };
        let prompt = format!("CLASSIFY QUERY: {}\n\nOUTPUT JSON:", text);
        let response = self.inference.complete(&prompt, &options).await?;
        let verdict: LlmVerdict = serde_json::from_str(clean_json(&response))
            .map_err(|e| ClassificationFailure::Malformed(e.to_string()))?;
        if verdict.requires_clarification {
            return Err(ClassificationFailure::NeedsClarification);
        }
        if !(verdict.confidence >= self.min_confidence) {
            return Err(ClassificationFailure::LowConfidence(verdict.confidence));
        }
        match verdict.classification.trim().to_lowercase().as_str() {
            "product" => Ok(Category::Product),
            "technical" | "technical support" => Ok(Category::TechnicalSupport),
            "billing" | "order" | "orders" => Ok(Category::OrderBilling),
            "account" => Ok(Category::AccountManagement),
            "general" => Err(ClassificationFailure::NeedsClarification),
            other => Err(ClassificationFailure::Malformed(format!("unknown category {:?}", other))),
        }
    }
}

pub struct Router {
    vocabulary: Vocabulary,
    fallback: Option<LlmFallback>,
}

impl Router {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self {
            vocabulary,
            fallback: None,
        }
    }

    /// Router from config; the LLM fallback is enabled only when configured and inference exists.
    pub fn from_config(config: &RouterConfig, catalog: &Catalog, inference: Option<Arc<dyn Inference>>) -> Self {
        let router = Self::new(Vocabulary::new(catalog, config.min_score));
        match inference {
            Some(inference) if config.llm_fallback => {
                router.with_llm_fallback(inference, config.llm_min_confidence)
            }
            _ => router,
        }
    }

    pub fn with_llm_fallback(mut self, inference: Arc<dyn Inference>, min_confidence: f32) -> Self {
        self.fallback = Some(LlmFallback {
            inference,
            min_confidence,
        });
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Segment and classify an inquiry. Always returns at least one segment.
    pub async fn route(&self, inquiry: &Inquiry, context: &ConversationContext) -> Vec<IntentSegment> {
        let segments = self.route_local(inquiry, context);
        let all_ambiguous = segments.iter().all(|s| s.category == Category::Ambiguous);
        if !all_ambiguous {
            return segments;
        }
        let Some(ref fallback) = self.fallback else {
            return segments;
        };
        match fallback.classify(&inquiry.text).await {
            Ok(category) => {
                log::debug!("llm fallback routed inquiry to {:?}", category);
                vec![self.whole(&inquiry.text, category)]
            }
            Err(e) => {
                log::debug!("llm fallback declined: {}", e);
                segments
            }
        }
    }

    /// [`Self::route`] without the LLM fallback. Always returns at least one segment.
    pub fn route_local(&self, inquiry: &Inquiry, context: &ConversationContext) -> Vec<IntentSegment> {
        match self.segment(&inquiry.text, context) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("routing {} turn {}: {}", inquiry.conversation_id, inquiry.turn_index, e);
                vec![self.whole(&inquiry.text, Category::Ambiguous)]
            }
        }
    }

    /// Deterministic segmentation; the part of [`Self::route`] that does not call inference.
    pub fn segment(&self, text: &str, context: &ConversationContext) -> Result<Vec<IntentSegment>, ClassificationFailure> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClassificationFailure::Empty);
        }
        if text.chars().count() > MAX_INQUIRY_CHARS {
            return Err(ClassificationFailure::TooLong(MAX_INQUIRY_CHARS));
        }

        let clauses: Vec<&str> = split_clauses(text)
            .into_iter()
            .flat_map(|c| split_conjunctions(c, &self.vocabulary))
            .collect();

        // Clauses without any signal attach to the previous clause (or the next, when leading).
        let mut groups: Vec<String> = Vec::new();
        let mut leading: Vec<&str> = Vec::new();
        for clause in clauses {
            if classify(clause, &self.vocabulary).has_signal() {
                leading.push(clause);
                groups.push(leading.join(" "));
                leading.clear();
            } else if let Some(last) = groups.last_mut() {
                last.push(' ');
                last.push_str(clause);
            } else {
                leading.push(clause);
            }
        }
        if groups.is_empty() {
            return Ok(vec![self.resolve_ambiguous(text, context)]);
        }

        // Adjacent groups with the same outcome merge.
        let mut merged: Vec<(String, Classification)> = Vec::new();
        for group in groups {
            let class = classify(&group, &self.vocabulary);
            if let Some((span, prev)) = merged.last_mut() {
                if prev.categories == class.categories {
                    span.push(' ');
                    span.push_str(&group);
                    *prev = classify(span, &self.vocabulary);
                    continue;
                }
            }
            merged.push((group, class));
        }

        let mut segments: Vec<IntentSegment> = Vec::new();
        for (span, class) in merged {
            if class.primary() == Category::Ambiguous {
                segments.push(self.resolve_ambiguous(&span, context));
                continue;
            }
            for category in &class.categories {
                segments.push(IntentSegment {
                    index: 0,
                    category: *category,
                    slots: extract_slots(&span, &self.vocabulary, *category, &class),
                    span: span.clone(),
                    depends_on: None,
                });
            }
        }
        if segments.is_empty() {
            return Err(ClassificationFailure::NoSegments);
        }

        for i in 0..segments.len() {
            segments[i].index = i;
            if let Some((slot, _)) = anaphor(&segments[i].span) {
                if segments[i].slots.contains_key(slot) {
                    continue;
                }
                segments[i].depends_on = (0..i).rev().find(|j| segments[*j].slots.contains_key(slot));
            }
        }
        Ok(segments)
    }

    /// An unclassifiable span stays `Ambiguous` unless it refers back to an entity the
    /// conversation already holds ("what about that order?").
    fn resolve_ambiguous(&self, span: &str, context: &ConversationContext) -> IntentSegment {
        if let Some((slot, category)) = anaphor(span) {
            let known = EntityKind::for_slot(slot).map_or(false, |k| context.entity(k).is_some());
            if known {
                return self.whole(span, category);
            }
        }
        self.whole(span, Category::Ambiguous)
    }

    fn whole(&self, span: &str, category: Category) -> IntentSegment {
        let class = classify(span, &self.vocabulary);
        let slots = if category == Category::Ambiguous {
            BTreeMap::new()
        } else {
            extract_slots(span, &self.vocabulary, category, &class)
        };
        IntentSegment {
            index: 0,
            category,
            slots,
            span: span.trim().to_string(),
            depends_on: None,
        }
    }
}
