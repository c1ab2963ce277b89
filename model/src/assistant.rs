//! A documentation-backed question answerer.
//!
//! Questions are answered by retrieving the most relevant passages from a local directory of IAM
//! documentation. Answers which cannot be grounded in the documentation are refused outright
//! rather than guessed at.

use crate::events::{Observer, TraceSummary};
use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// The answer given when no documentation passage matches the question.
pub const REFUSAL: &str =
    "I don't know the answer to that. My responses are based solely on the IAM documentation.";

/// The number of passages included in an answer.
const TOP_PASSAGES: usize = 3;

/// A paragraph of documentation, tagged with the file it came from.
#[derive(Clone, Debug)]
struct Passage {
    source: String,
    text: String,
}

/// An in-memory index of documentation passages.
#[derive(Clone, Debug, Default)]
pub struct DocStore {
    passages: Vec<Passage>,
}

impl DocStore {
    /// Load every Markdown and plain-text file under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        let mut store = Self::default();
        let entries =
            fs::read_dir(dir).with_context(|| format!("opening docs directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let markdown = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("md") | Some("txt")
            );
            if !markdown {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            store.insert(&name, &text);
        }
        tracing::info!(
            passages = store.passages.len(),
            "loaded documentation from {}",
            dir.display()
        );
        Ok(store)
    }

    /// Index a single document, splitting it into paragraph passages.
    pub fn insert(&mut self, source: &str, text: &str) {
        for paragraph in text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            self.passages.push(Passage {
                source: source.to_string(),
                text: paragraph.to_string(),
            });
        }
    }

    /// The best-matching passages for a question, highest score first. Passages which share no
    /// terms with the question are never returned.
    fn retrieve(&self, question: &str) -> Vec<&Passage> {
        let query = terms(question);
        let mut scored = self
            .passages
            .iter()
            .map(|passage| {
                let words = terms(&passage.text);
                (query.intersection(&words).count(), passage)
            })
            .filter(|(score, _)| *score > 0)
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(TOP_PASSAGES)
            .map(|(_, passage)| passage)
            .collect()
    }
}

/// Lowercased terms of 3+ characters, which is enough to drop most stop words.
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 3)
        .map(|word| word.to_lowercase())
        .collect()
}

/// Guess what kind of question this is.
fn infer_intent(question: &str) -> &'static str {
    let question = question.to_lowercase();
    let informational = ["how to", "how do", "how can", "what is", "steps to", "configure", "set up"];
    if informational.iter().any(|phrase| question.contains(phrase)) {
        "informational_query"
    } else {
        "general_question"
    }
}

/// Guess which identity system the question is about.
fn infer_system(question: &str) -> &'static str {
    let question = question.to_lowercase();
    if question.contains("entra") || question.contains("azure ad") {
        "Entra ID"
    } else if question.contains("active directory") || question.contains("on-prem") {
        "Active Directory"
    } else if question.contains("okta") {
        "Okta"
    } else {
        "Unknown"
    }
}

/// An answer to a documentation question.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Answer {
    pub response: String,
    /// The files the response was drawn from. Empty for refusals.
    pub sources: Vec<String>,
    pub trace: TraceSummary,
}

/// The question-answering agent.
#[derive(Clone)]
pub struct Assistant {
    docs: DocStore,
    events: Observer,
}

impl Assistant {
    pub fn new(docs: DocStore, events: Observer) -> Self {
        Self { docs, events }
    }

    /// Answer a question from the documentation, or refuse if nothing relevant is indexed.
    pub fn ask(&self, question: &str) -> Answer {
        let trace = TraceSummary {
            intent: infer_intent(question).into(),
            system: infer_system(question).into(),
            agent: "doc_assistant".into(),
            operation: "iam_query".into(),
        };
        self.events.step_detail("assistant_question", question);

        let passages = self.docs.retrieve(question);
        let answer = if passages.is_empty() {
            self.events.step("assistant_refusal");
            Answer {
                response: REFUSAL.into(),
                sources: vec![],
                trace: trace.clone(),
            }
        } else {
            let mut sources = vec![];
            for passage in &passages {
                if !sources.contains(&passage.source) {
                    sources.push(passage.source.clone());
                }
            }
            let response = passages
                .iter()
                .map(|passage| passage.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            self.events
                .step_detail("assistant_answer", sources.join(", "));
            Answer {
                response,
                sources,
                trace: trace.clone(),
            }
        };
        self.events.trace(trace);
        answer
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> DocStore {
        let mut docs = DocStore::default();
        docs.insert(
            "mfa.md",
            "# Multi-factor authentication\n\n\
             To require multi-factor authentication in Entra ID, create a conditional access \
             policy targeting all users and require the authentication strength you need.\n\n\
             Break-glass accounts should be excluded from every conditional access policy.",
        );
        docs.insert(
            "lockout.md",
            "Account lockout in Active Directory is controlled by the lockout threshold and \
             lockout duration settings in the default domain policy.",
        );
        docs
    }

    #[test]
    fn test_answers_cite_sources() {
        let assistant = Assistant::new(store(), Observer::new());
        let answer =
            assistant.ask("How do I require multi-factor authentication with conditional access?");
        assert!(answer.response.contains("conditional access"));
        assert_eq!(answer.sources, ["mfa.md"]);
        assert_eq!(answer.trace.intent, "informational_query");
        assert_eq!(answer.trace.system, "Unknown");
    }

    #[test]
    fn test_refuses_unknown_topics() {
        let events = Observer::new();
        let assistant = Assistant::new(store(), events.clone());
        let answer = assistant.ask("favorite pizza toppings?");
        assert_eq!(answer.response, REFUSAL);
        assert!(answer.sources.is_empty());

        // The refusal still leaves a trace in the event stream.
        let recorded = events.snapshot();
        assert!(recorded.iter().any(|event| event.trace.is_some()));
    }

    #[test]
    fn test_system_inference() {
        assert_eq!(infer_system("reset a password in Entra ID"), "Entra ID");
        assert_eq!(
            infer_system("Active Directory lockout policy"),
            "Active Directory"
        );
        assert_eq!(infer_system("rotate an Okta API token"), "Okta");
        assert_eq!(infer_system("what is SCIM?"), "Unknown");
    }
}
