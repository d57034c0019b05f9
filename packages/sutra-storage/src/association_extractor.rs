//! Simple pattern-based association extractor
//!
//! Extracts typed associations from text using configurable regex patterns.
//! The extractor is advisory: its output enriches the graph but a failed or
//! empty extraction never fails the learn.

use crate::types::AssociationType;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ExtractedAssoc {
    pub target_term: String,
    pub confidence: f32,
    pub kind: AssociationType,
}

#[derive(Debug, Clone)]
struct AssocPattern {
    regex: Regex,
    kind: AssociationType,
    confidence: f32,
}

static DEFAULT_PATTERNS: Lazy<Vec<AssocPattern>> = Lazy::new(|| {
    vec![
        // Causal
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+causes\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Causal,
            confidence: 0.8,
        },
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+leads to\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Causal,
            confidence: 0.75,
        },
        // Hierarchical
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+is a[n]?\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Hierarchical,
            confidence: 0.85,
        },
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+type of\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Hierarchical,
            confidence: 0.8,
        },
        // Temporal
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+before\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Temporal,
            confidence: 0.7,
        },
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+after\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Temporal,
            confidence: 0.7,
        },
        // Compositional
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+part of\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Compositional,
            confidence: 0.8,
        },
        AssocPattern {
            regex: Regex::new(r"(?i)([A-Za-z][\w\- ]+?)\s+contains\s+([A-Za-z][\w\- ]+)").unwrap(),
            kind: AssociationType::Compositional,
            confidence: 0.75,
        },
    ]
});

#[derive(Debug, Clone)]
pub struct AssociationExtractorConfig {
    pub min_confidence: f32,
    pub max_associations_per_concept: usize,
}

impl Default for AssociationExtractorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_associations_per_concept: 10,
        }
    }
}

pub struct AssociationExtractor {
    patterns: &'static [AssocPattern],
    config: AssociationExtractorConfig,
}

impl AssociationExtractor {
    pub fn new(config: AssociationExtractorConfig) -> Self {
        Self {
            patterns: &DEFAULT_PATTERNS,
            config,
        }
    }

    pub fn extract(&self, content: &str) -> Vec<ExtractedAssoc> {
        let mut results = Vec::new();
        let text = content.trim();

        for pat in self.patterns.iter() {
            if pat.confidence < self.config.min_confidence {
                continue;
            }

            for caps in pat.regex.captures_iter(text) {
                if let Some(target) = caps.get(2) {
                    let target_term = target.as_str().trim().to_string();
                    if target_term.is_empty() {
                        continue;
                    }
                    results.push(ExtractedAssoc {
                        target_term,
                        confidence: pat.confidence,
                        kind: pat.kind,
                    });
                }
            }
        }

        // De-duplicate by target_term + kind
        results.sort_by(|a, b| a.target_term.cmp(&b.target_term));
        results.dedup_by(|a, b| a.target_term == b.target_term && (a.kind as u32) == (b.kind as u32));

        if results.len() > self.config.max_associations_per_concept {
            results.truncate(self.config.max_associations_per_concept);
        }

        debug!("extracted {} associations", results.len());
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_pattern() {
        let extractor = AssociationExtractor::new(Default::default());
        let results = extractor.extract("smoking causes cancer");

        assert!(!results.is_empty());
        let causal = results
            .iter()
            .find(|r| matches!(r.kind, AssociationType::Causal))
            .unwrap();
        assert_eq!(causal.target_term, "cancer");
    }

    #[test]
    fn test_hierarchical_pattern() {
        let extractor = AssociationExtractor::new(Default::default());
        let results = extractor.extract("a dog is an animal");

        let hier = results
            .iter()
            .find(|r| matches!(r.kind, AssociationType::Hierarchical))
            .unwrap();
        assert_eq!(hier.target_term, "animal");
    }

    #[test]
    fn test_no_match_is_empty() {
        let extractor = AssociationExtractor::new(Default::default());
        assert!(extractor.extract("completely unrelated words").is_empty());
    }

    #[test]
    fn test_dedup_and_cap() {
        let config = AssociationExtractorConfig {
            max_associations_per_concept: 1,
            ..Default::default()
        };
        let extractor = AssociationExtractor::new(config);

        let results = extractor.extract("rain causes floods and frost causes outages");
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_min_confidence_filters_patterns() {
        let config = AssociationExtractorConfig {
            min_confidence: 0.95,
            ..Default::default()
        };
        let extractor = AssociationExtractor::new(config);
        assert!(extractor.extract("smoking causes cancer").is_empty());
    }
}
