//! AI-assisted resolution for regions no deterministic strategy can merge.
//!
//! The resolver builds a deterministic conflict context for a region, asks
//! the [`LlmClient`] for merged code, pulls the fenced code block out of the
//! answer, sanity-checks it, and splices it into the working content at the
//! region's location. Anything it cannot trust becomes a FAILED result; a
//! timeout escalates to a human instead.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex_lite::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::locate::{region_text, splice};
use crate::analyzer::structure::BracketScanner;
use crate::analyzer::Language;
use crate::config::ResolverConfig;
use crate::errors::ResolverError;
use crate::llm::{LlmClient, LlmRequest};
use crate::models::{ChangeDetail, MergeFailure, MergeResult, SemanticChange};

use super::strategies::MergeContext;

/// Line prefix that introduces one region's answer in a batched call.
pub const REGION_MARKER: &str = "## REGION:";

const AI_RESOLVER: &str = "ai_resolver";

// ---------------------------------------------------------------------------
// Conflict context
// ---------------------------------------------------------------------------

/// Size caps applied while rendering a conflict context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_snippet_chars: usize,
    pub max_context_chars: usize,
}

impl From<&ResolverConfig> for ContextLimits {
    fn from(config: &ResolverConfig) -> Self {
        Self {
            max_snippet_chars: config.max_snippet_chars,
            max_context_chars: config.max_context_chars,
        }
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from(&ResolverConfig::default())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n... [truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

fn describe_change(change: &SemanticChange, limits: &ContextLimits) -> String {
    let mut out = format!("CHANGE {} {}\n", change.change_type, change.target);
    if let ChangeDetail::JsxProps { props, .. } = &change.detail {
        for prop in props {
            match &prop.value {
                Some(value) if value.is_empty() => out.push_str(&format!("  set {}\n", prop.name)),
                Some(value) => out.push_str(&format!("  set {}={}\n", prop.name, value)),
                None => out.push_str(&format!("  remove {}\n", prop.name)),
            }
        }
        return out;
    }
    if change.content_before.is_none() && change.content_after.is_none() {
        return out;
    }
    let before = change.content_before.as_deref().unwrap_or_default();
    let after = change.content_after.as_deref().unwrap_or_default();
    let patch = diffy::create_patch(before, after).to_string();
    out.push_str("```diff\n");
    out.push_str(truncate(&patch, limits.max_snippet_chars).trim_end_matches('\n'));
    out.push_str("\n```\n");
    out
}

/// Render the conflict context for one region.
///
/// The output depends only on the inputs: file path, location, the current
/// code at the location, then each involved task's id, intent, and changes
/// at the location, in first-seen task order.
pub fn to_prompt_context(ctx: &MergeContext<'_>, limits: &ContextLimits) -> String {
    let region = ctx.region;
    let fence = ctx.language.fence_tags()[0];
    let change_types: Vec<&str> = region.change_types.iter().map(|t| t.as_str()).collect();

    let mut out = String::new();
    out.push_str(&format!("FILE: {}\n", ctx.file_path));
    out.push_str(&format!("LOCATION: {}\n", region.location));
    out.push_str(&format!("LANGUAGE: {}\n", ctx.language));
    out.push_str(&format!("SEVERITY: {}\n", region.severity));
    out.push_str(&format!("CHANGE TYPES: {}\n", change_types.join(", ")));

    out.push_str("\nCURRENT CODE AT LOCATION:\n");
    match region_text(ctx.baseline_content, &region.location, ctx.language) {
        Some(text) => {
            out.push_str(&format!("```{}\n", fence));
            out.push_str(truncate(&text, limits.max_snippet_chars).trim_end_matches('\n'));
            out.push_str("\n```\n");
        }
        None => out.push_str("(no code at this location yet)\n"),
    }

    for task_id in &region.tasks_involved {
        let Some(snapshot) = ctx.snapshots.iter().find(|s| &s.task_id == task_id) else {
            continue;
        };
        out.push_str(&format!("\nTASK {}\nINTENT: {}\n", snapshot.task_id, snapshot.task_intent));
        for change in snapshot.changes_at(&region.location) {
            out.push_str(&describe_change(change, limits));
        }
    }

    truncate(&out, limits.max_context_chars)
}

fn single_prompt(ctx: &MergeContext<'_>, limits: &ContextLimits) -> String {
    format!(
        "{}\nCombine every task's intent into one version of the code at {}. \
         Reply with exactly one ```{} fenced block holding the complete code for that location.\n",
        to_prompt_context(ctx, limits),
        ctx.region.location,
        ctx.language.fence_tags()[0],
    )
}

fn batch_prompt(ctxs: &[MergeContext<'_>], limits: &ContextLimits) -> String {
    let mut out = String::new();
    for ctx in ctxs {
        out.push_str(&format!("{} {}\n", REGION_MARKER, ctx.region.location));
        out.push_str(&to_prompt_context(ctx, limits));
        out.push('\n');
    }
    let fence = ctxs
        .first()
        .map_or("text", |ctx| ctx.language.fence_tags()[0]);
    out.push_str(&format!(
        "For each region above, reply with the line `{} <location>` followed by one ```{} \
         fenced block holding the complete merged code for that location.\n",
        REGION_MARKER, fence
    ));
    out
}

// ---------------------------------------------------------------------------
// Answer parsing
// ---------------------------------------------------------------------------

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```([A-Za-z0-9_+.-]*)[^\n]*\n(.*?)```")
            .unwrap_or_else(|e| panic!("invalid fence pattern: {e}"))
    })
}

/// The first fenced block tagged for `language`, else the first untagged
/// block.
pub fn extract_code_block(response: &str, language: Language) -> Result<String, ResolverError> {
    let mut untagged = None;
    for caps in fence_regex().captures_iter(response) {
        let tag = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
        let body = caps.get(2).map_or("", |m| m.as_str());
        if language.fence_tags().contains(&tag.as_str()) {
            return Ok(body.trim_end_matches('\n').to_string());
        }
        if tag.is_empty() && untagged.is_none() {
            untagged = Some(body.trim_end_matches('\n').to_string());
        }
    }
    untagged.ok_or_else(|| ResolverError::NoCodeBlockFound {
        language: language.name().to_string(),
    })
}

/// Heuristic check that `code` is plausible source for `language`.
pub fn check_code(code: &str, language: Language) -> Result<(), ResolverError> {
    let malformed = |detail: &str| Err(ResolverError::MalformedResolverResponse(detail.into()));

    if code.trim().is_empty() {
        return malformed("empty code block");
    }
    if code
        .lines()
        .any(|l| l.starts_with("<<<<<<<") || l.starts_with(">>>>>>>") || l.trim_end() == "=======")
    {
        return malformed("conflict markers in resolved code");
    }
    if language.uses_braces() {
        let mut scanner = BracketScanner::default();
        for line in code.lines() {
            scanner.feed(line, language);
            if scanner.depth() < 0 {
                return malformed("unbalanced brackets");
            }
        }
        if scanner.depth() != 0 {
            return malformed("unbalanced brackets");
        }
    }
    if !language.keywords().iter().any(|k| code.contains(k)) {
        return Err(ResolverError::MalformedResolverResponse(format!(
            "code does not look like {}",
            language
        )));
    }
    Ok(())
}

/// Split a batched answer into per-region sections keyed by the
/// `## REGION:` markers. Every expected location must be answered exactly
/// once and nothing else may be answered.
pub fn split_batch<'r>(
    response: &'r str,
    locations: &[&str],
) -> Result<Vec<&'r str>, ResolverError> {
    let mut marks: Vec<(&str, usize, usize)> = Vec::new();
    let mut offset = 0;
    for line in response.split_inclusive('\n') {
        if let Some(rest) = line.trim_start().strip_prefix(REGION_MARKER) {
            marks.push((rest.trim().trim_matches('`'), offset, offset + line.len()));
        }
        offset += line.len();
    }
    if marks.len() != locations.len() {
        return Err(ResolverError::MalformedResolverResponse(format!(
            "expected {} region sections, found {}",
            locations.len(),
            marks.len()
        )));
    }

    let mut sections: HashMap<&str, &'r str> = HashMap::new();
    for (i, (location, _, body_start)) in marks.iter().enumerate() {
        let end = marks.get(i + 1).map_or(response.len(), |m| m.1);
        if sections.insert(*location, &response[*body_start..end]).is_some() {
            return Err(ResolverError::MalformedResolverResponse(format!(
                "region '{}' answered twice",
                location
            )));
        }
    }
    locations
        .iter()
        .map(|location| {
            sections.get(location).copied().ok_or_else(|| {
                ResolverError::MalformedResolverResponse(format!(
                    "no answer for region '{}'",
                    location
                ))
            })
        })
        .collect()
}

fn usable_block(section: &str, language: Language) -> Result<String, ResolverError> {
    let code = extract_code_block(section, language)?;
    check_code(&code, language)?;
    Ok(code)
}

/// How a resolver error surfaces on a region.
#[derive(Debug, Clone)]
enum Escalation {
    Human(String),
    Failed(MergeFailure),
}

impl From<ResolverError> for Escalation {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::TimedOut { secs } => {
                Self::Human(format!("AI resolver timed out after {}s", secs))
            }
            ResolverError::Cancelled => Self::Failed(MergeFailure::Cancelled),
            ResolverError::NoCodeBlockFound { language } => {
                Self::Failed(MergeFailure::NoCodeBlockFound { language })
            }
            ResolverError::MalformedResolverResponse(detail) => {
                Self::Failed(MergeFailure::MalformedResolverResponse { detail })
            }
            ResolverError::Llm(e) => Self::Failed(MergeFailure::ResolverTransport {
                detail: e.to_string(),
            }),
        }
    }
}

fn escalate(ctx: &MergeContext<'_>, escalation: Escalation) -> MergeResult {
    match escalation {
        Escalation::Human(reason) => {
            warn!(
                file = ctx.file_path,
                location = %ctx.region.location,
                reason = %reason,
                "AI resolution escalated to a human"
            );
            MergeResult::human_required(ctx.region, reason)
        }
        Escalation::Failed(failure) => {
            warn!(
                file = ctx.file_path,
                location = %ctx.region.location,
                error = %failure,
                "AI resolution failed"
            );
            MergeResult::failed(ctx.region, failure, Some(AI_RESOLVER))
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// LLM-backed region resolver.
#[derive(Clone)]
pub struct AiResolver {
    client: Option<Arc<dyn LlmClient>>,
    config: ResolverConfig,
}

impl AiResolver {
    pub fn new(client: Option<Arc<dyn LlmClient>>, config: ResolverConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Enabled and wired to a client.
    pub fn is_available(&self) -> bool {
        self.config.enabled && self.client.is_some()
    }

    fn unavailable(ctx: &MergeContext<'_>) -> MergeResult {
        debug!(
            file = ctx.file_path,
            location = %ctx.region.location,
            "no AI resolver available; escalating"
        );
        MergeResult::human_required(ctx.region, "no AI resolver available")
    }

    /// Resolve one region. The merged code replaces the region's location in
    /// `ctx.baseline_content`.
    pub async fn resolve(&self, ctx: &MergeContext<'_>, cancel: &CancellationToken) -> MergeResult {
        let client = match &self.client {
            Some(client) if self.config.enabled => client.clone(),
            _ => return Self::unavailable(ctx),
        };
        info!(
            file = ctx.file_path,
            location = %ctx.region.location,
            severity = %ctx.region.severity,
            "requesting AI resolution"
        );

        let prompt = single_prompt(ctx, &ContextLimits::from(&self.config));
        let outcome = match self.call(client.as_ref(), prompt, ctx.language, cancel).await {
            Ok(answer) => usable_block(&answer, ctx.language),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(code) => {
                let content = splice(ctx.baseline_content, &ctx.region.location, ctx.language, &code);
                info!(file = ctx.file_path, location = %ctx.region.location, "AI resolved region");
                MergeResult::ai_resolved(ctx.region, content)
            }
            Err(e) => escalate(ctx, e.into()),
        }
    }

    /// Resolve several regions of one file in a single call.
    ///
    /// All contexts must share the same working content. Results come back
    /// in input order; each successful result carries the content after its
    /// own region was applied on top of the earlier ones. A response whose
    /// region sections do not match the request, or with any section lacking
    /// usable code, fails the whole batch.
    pub async fn resolve_batch(
        &self,
        ctxs: &[MergeContext<'_>],
        cancel: &CancellationToken,
    ) -> Vec<MergeResult> {
        match ctxs {
            [] => return Vec::new(),
            [ctx] => return vec![self.resolve(ctx, cancel).await],
            _ => {}
        }
        let client = match &self.client {
            Some(client) if self.config.enabled => client.clone(),
            _ => return ctxs.iter().map(Self::unavailable).collect(),
        };
        let language = ctxs[0].language;
        info!(
            file = ctxs[0].file_path,
            regions = ctxs.len(),
            "requesting batched AI resolution"
        );

        let prompt = batch_prompt(ctxs, &ContextLimits::from(&self.config));
        let answer = match self.call(client.as_ref(), prompt, language, cancel).await {
            Ok(answer) => answer,
            Err(e) => return Self::fail_all(ctxs, e.into()),
        };
        let locations: Vec<&str> = ctxs.iter().map(|c| c.region.location.as_str()).collect();
        let sections = match split_batch(&answer, &locations) {
            Ok(sections) => sections,
            Err(e) => return Self::fail_all(ctxs, e.into()),
        };

        // Every section must carry usable code before anything is spliced.
        let blocks = match sections
            .into_iter()
            .map(|section| usable_block(section, language))
            .collect::<Result<Vec<String>, ResolverError>>()
        {
            Ok(blocks) => blocks,
            Err(e) => return Self::fail_all(ctxs, e.into()),
        };

        let mut working = ctxs[0].baseline_content.to_string();
        ctxs.iter()
            .zip(blocks)
            .map(|(ctx, code)| {
                working = splice(&working, &ctx.region.location, language, &code);
                MergeResult::ai_resolved(ctx.region, working.clone())
            })
            .collect()
    }

    fn fail_all(ctxs: &[MergeContext<'_>], escalation: Escalation) -> Vec<MergeResult> {
        ctxs.iter()
            .map(|ctx| escalate(ctx, escalation.clone()))
            .collect()
    }

    /// One completion with retries, raced against cancellation and the
    /// configured deadline.
    async fn call(
        &self,
        client: &dyn LlmClient,
        prompt: String,
        language: Language,
        cancel: &CancellationToken,
    ) -> Result<String, ResolverError> {
        let request = LlmRequest { prompt, language };
        let attempts = async {
            let mut attempt = 0u32;
            loop {
                match client.complete(&request).await {
                    Ok(answer) => return Ok(answer),
                    Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                        let delay = self.config.backoff(attempt);
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient LLM failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(ResolverError::Llm(e)),
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolverError::Cancelled),
            outcome = tokio::time::timeout(self.config.timeout(), attempts) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ResolverError::TimedOut { secs: self.config.timeout_secs }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::analyzer::SemanticAnalyzer;
    use crate::conflict::ConflictDetector;
    use crate::errors::LlmError;
    use crate::models::{ConflictRegion, ConflictSeverity, MergeDecision, TaskSnapshot};

    /// Replays canned answers in order; the last one repeats. `Err` holds
    /// an HTTP status.
    struct ScriptedClient {
        answers: Mutex<Vec<Result<String, u16>>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(answers: Vec<Result<String, u16>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let mut answers = self.answers.lock().unwrap();
            let answer = if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers[0].clone()
            };
            answer.map_err(|status| LlmError::ApiError {
                status,
                body: String::new(),
            })
        }
    }

    /// Never answers.
    struct SilentClient;

    #[async_trait]
    impl LlmClient for SilentClient {
        async fn complete(&self, _request: &LlmRequest) -> Result<String, LlmError> {
            std::future::pending().await
        }
    }

    const BASE: &str = "export function total(a: number) {\n  return a;\n}\n\nexport function scale(a: number) {\n  return a;\n}\n";
    const TASK_A: &str = "export function total(a: number) {\n  return a + 1;\n}\n\nexport function scale(a: number) {\n  return a * 3;\n}\n";
    const TASK_B: &str = "export function total(a: number) {\n  return a * 2;\n}\n\nexport function scale(a: number) {\n  return a / 3;\n}\n";

    fn fixture() -> (Vec<TaskSnapshot>, Vec<ConflictRegion>) {
        let snaps: Vec<TaskSnapshot> = [("a", "add one", TASK_A), ("b", "double", TASK_B)]
            .iter()
            .map(|(id, intent, after)| {
                let changes = SemanticAnalyzer::analyze("src/math.ts", BASE, after, "ts").unwrap();
                TaskSnapshot::new(*id, *intent, Utc::now(), after, changes)
            })
            .collect();
        let regions = ConflictDetector::detect("src/math.ts", &snaps);
        (snaps, regions)
    }

    fn ctx<'a>(snaps: &'a [TaskSnapshot], region: &'a ConflictRegion) -> MergeContext<'a> {
        MergeContext {
            file_path: "src/math.ts",
            baseline_content: BASE,
            language: Language::TypeScript,
            snapshots: snaps,
            region,
        }
    }

    fn config() -> ResolverConfig {
        ResolverConfig {
            timeout_secs: 5,
            retry_backoff_ms: 10,
            ..ResolverConfig::default()
        }
    }

    const TOTAL_ANSWER: &str = "Merged:\n```ts\nexport function total(a: number) {\n  return (a + 1) * 2;\n}\n```\n";

    #[test]
    fn test_prompt_context_is_deterministic() {
        let (snaps, regions) = fixture();
        assert_eq!(regions.len(), 2);
        let limits = ContextLimits::default();
        let first = to_prompt_context(&ctx(&snaps, &regions[0]), &limits);
        let second = to_prompt_context(&ctx(&snaps, &regions[0]), &limits);
        assert_eq!(first, second);
        assert!(first.starts_with("FILE: src/math.ts\nLOCATION: function:total\n"));
        assert!(first.contains("SEVERITY: high"));
        assert!(first.contains("TASK a\nINTENT: add one"));
        assert!(first.contains("+  return a + 1;"));
        let a = first.find("TASK a").unwrap();
        let b = first.find("TASK b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_prompt_context_truncation() {
        let (snaps, regions) = fixture();
        let limits = ContextLimits {
            max_snippet_chars: 10,
            max_context_chars: 120,
        };
        let text = to_prompt_context(&ctx(&snaps, &regions[0]), &limits);
        assert!(text.ends_with("... [truncated]"));
        assert!(text.chars().count() <= 120 + "\n... [truncated]".len());
    }

    #[test]
    fn test_extract_code_block_prefers_language_tag() {
        let answer = "```\nplain\n```\n```python\nx = 1\n```\n```tsx\nconst x = 1;\n```";
        assert_eq!(
            extract_code_block(answer, Language::TypeScript).unwrap(),
            "const x = 1;"
        );
        assert_eq!(extract_code_block(answer, Language::Rust).unwrap(), "plain");
        assert!(matches!(
            extract_code_block("no code here", Language::Go),
            Err(ResolverError::NoCodeBlockFound { .. })
        ));
        assert!(matches!(
            extract_code_block("```python\nx = 1\n```", Language::TypeScript),
            Err(ResolverError::NoCodeBlockFound { .. })
        ));
    }

    #[test]
    fn test_check_code() {
        assert!(check_code("fn a() {}", Language::Rust).is_ok());
        assert!(check_code("fn a() {", Language::Rust).is_err());
        assert!(check_code("fn a() }{", Language::Rust).is_err());
        assert!(check_code("<<<<<<< HEAD\nfn a() {}", Language::Rust).is_err());
        assert!(check_code("   ", Language::Python).is_err());
        assert!(check_code("hello world", Language::Go).is_err());
        assert!(check_code("def f(:\n    pass", Language::Python).is_ok());
    }

    #[test]
    fn test_split_batch() {
        let answer = "## REGION: function:b\n```ts\nb\n```\n## REGION: function:a\n```ts\na\n```\n";
        let sections = split_batch(answer, &["function:a", "function:b"]).unwrap();
        assert!(sections[0].contains("\na\n"));
        assert!(sections[1].contains("\nb\n"));

        assert!(split_batch(answer, &["function:a"]).is_err());
        assert!(split_batch(answer, &["function:a", "function:c"]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_splices_answer() {
        let (snaps, regions) = fixture();
        let client = ScriptedClient::new(vec![Ok(TOTAL_ANSWER.into())]);
        let resolver = AiResolver::new(Some(client.clone()), config());

        let result = resolver
            .resolve(&ctx(&snaps, &regions[0]), &CancellationToken::new())
            .await;
        assert_eq!(result.decision, MergeDecision::AiResolved);
        assert_eq!(result.strategy_used.as_deref(), Some("ai_resolver"));
        let merged = result.merged_content.unwrap();
        assert!(merged.contains("return (a + 1) * 2;"));
        assert!(merged.contains("export function scale(a: number) {\n  return a;\n}"));
        assert_eq!(client.calls(), 1);
        assert!(client.prompts.lock().unwrap()[0].contains("LOCATION: function:total"));
    }

    #[tokio::test]
    async fn test_no_code_block_fails() {
        let (snaps, regions) = fixture();
        let client = ScriptedClient::new(vec![Ok("I cannot merge this.".into())]);
        let resolver = AiResolver::new(Some(client), config());
        let result = resolver
            .resolve(&ctx(&snaps, &regions[0]), &CancellationToken::new())
            .await;
        assert_eq!(result.decision, MergeDecision::Failed);
        assert!(matches!(
            result.error,
            Some(MergeFailure::NoCodeBlockFound { .. })
        ));
        assert!(result.merged_content.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let (snaps, regions) = fixture();
        let client = ScriptedClient::new(vec![Err(503), Ok(TOTAL_ANSWER.into())]);
        let resolver = AiResolver::new(Some(client.clone()), config());
        let result = resolver
            .resolve(&ctx(&snaps, &regions[0]), &CancellationToken::new())
            .await;
        assert_eq!(result.decision, MergeDecision::AiResolved);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (snaps, regions) = fixture();
        let client = ScriptedClient::new(vec![Err(400)]);
        let resolver = AiResolver::new(Some(client.clone()), config());
        let result = resolver
            .resolve(&ctx(&snaps, &regions[0]), &CancellationToken::new())
            .await;
        assert!(matches!(
            result.error,
            Some(MergeFailure::ResolverTransport { .. })
        ));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_escalates_to_human() {
        let (snaps, regions) = fixture();
        let resolver = AiResolver::new(Some(Arc::new(SilentClient)), config());
        let result = resolver
            .resolve(&ctx(&snaps, &regions[0]), &CancellationToken::new())
            .await;
        assert_eq!(result.decision, MergeDecision::HumanRequired);
        assert!(result.reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_fails_region() {
        let (snaps, regions) = fixture();
        let resolver = AiResolver::new(Some(Arc::new(SilentClient)), config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = resolver.resolve(&ctx(&snaps, &regions[0]), &cancel).await;
        assert_eq!(result.decision, MergeDecision::Failed);
        assert_eq!(result.error, Some(MergeFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_unavailable_resolver_requires_human() {
        let (snaps, regions) = fixture();
        let resolver = AiResolver::new(None, config());
        assert!(!resolver.is_available());
        let result = resolver
            .resolve(&ctx(&snaps, &regions[0]), &CancellationToken::new())
            .await;
        assert_eq!(result.decision, MergeDecision::HumanRequired);
        assert_eq!(result.severity, ConflictSeverity::High);
    }

    #[tokio::test]
    async fn test_batch_resolution() {
        let (snaps, regions) = fixture();
        let answer = "## REGION: function:total\n```ts\nexport function total(a: number) {\n  return (a + 1) * 2;\n}\n```\n\
                      ## REGION: function:scale\n```ts\nexport function scale(a: number) {\n  return a;\n}\n```\n";
        let client = ScriptedClient::new(vec![Ok(answer.into())]);
        let resolver = AiResolver::new(Some(client.clone()), config());
        let ctxs: Vec<MergeContext<'_>> = regions.iter().map(|r| ctx(&snaps, r)).collect();

        let results = resolver.resolve_batch(&ctxs, &CancellationToken::new()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.decision == MergeDecision::AiResolved));
        assert!(results[1]
            .merged_content
            .as_deref()
            .unwrap()
            .contains("return (a + 1) * 2;"));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_count_mismatch_fails_everything() {
        let (snaps, regions) = fixture();
        let answer = "## REGION: function:total\n```ts\nexport function total(a: number) {\n  return a;\n}\n```\n";
        let client = ScriptedClient::new(vec![Ok(answer.into())]);
        let resolver = AiResolver::new(Some(client), config());
        let ctxs: Vec<MergeContext<'_>> = regions.iter().map(|r| ctx(&snaps, r)).collect();

        let results = resolver.resolve_batch(&ctxs, &CancellationToken::new()).await;
        assert!(results.iter().all(|r| matches!(
            r.error,
            Some(MergeFailure::MalformedResolverResponse { .. })
        )));
    }

    #[tokio::test]
    async fn test_batch_section_without_code_fails_everything() {
        let (snaps, regions) = fixture();
        let answer = "## REGION: function:total\n```ts\nexport function total(a: number) {\n  return (a + 1) * 2;\n}\n```\n\
                      ## REGION: function:scale\nI am not sure.\n";
        let client = ScriptedClient::new(vec![Ok(answer.into())]);
        let resolver = AiResolver::new(Some(client), config());
        let ctxs: Vec<MergeContext<'_>> = regions.iter().map(|r| ctx(&snaps, r)).collect();

        let results = resolver.resolve_batch(&ctxs, &CancellationToken::new()).await;
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.decision, MergeDecision::Failed);
            assert!(matches!(
                result.error,
                Some(MergeFailure::NoCodeBlockFound { .. })
            ));
            assert!(result.merged_content.is_none());
        }
    }
}
