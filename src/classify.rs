use std::sync::Arc;

use crate::model::FolderRole;

/// What a classifier gets to look at for one new message.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub subject: &'a str,
    pub from: &'a [String],
    pub body_text: Option<&'a str>,
    pub headers: &'a [(String, String)],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub is_junk: bool,
    /// 0.0 to 1.0.
    pub confidence: f64,
}

impl Verdict {
    pub fn clean() -> Self {
        Self {
            is_junk: false,
            confidence: 0.0,
        }
    }
}

pub trait Classifier: Send + Sync {
    fn classify(&self, input: &ClassifyInput<'_>) -> Verdict;
}

/// Decides whether a new message is re-placed into the junk folder.
#[derive(Clone)]
pub struct JunkPolicy {
    classifier: Arc<dyn Classifier>,
    threshold: f64,
}

impl JunkPolicy {
    pub fn new(classifier: Arc<dyn Classifier>, threshold: f64) -> Self {
        Self {
            classifier,
            threshold,
        }
    }

    /// Messages already in Junk or Trash are never classified.
    pub fn applies_to(&self, role: FolderRole) -> bool {
        !role.skips_classification()
    }

    pub fn is_junk(&self, input: &ClassifyInput<'_>) -> bool {
        let verdict = self.classifier.classify(input);
        verdict.is_junk && verdict.confidence >= self.threshold
    }
}

impl std::fmt::Debug for JunkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JunkPolicy")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Trusts the verdict a server-side filter stamped into the headers
/// (`X-Spam-Flag`, `X-Spam-Status`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SpamHeaderClassifier;

impl Classifier for SpamHeaderClassifier {
    fn classify(&self, input: &ClassifyInput<'_>) -> Verdict {
        for (name, value) in input.headers {
            let value = value.trim();
            if name.eq_ignore_ascii_case("X-Spam-Flag") && value.eq_ignore_ascii_case("yes") {
                return Verdict {
                    is_junk: true,
                    confidence: 1.0,
                };
            }
            if name.eq_ignore_ascii_case("X-Spam-Status")
                && value.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("yes"))
            {
                return Verdict {
                    is_junk: true,
                    confidence: 0.9,
                };
            }
        }
        Verdict::clean()
    }
}
