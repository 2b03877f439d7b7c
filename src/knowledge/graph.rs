use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::{Relation, SimilarPaper};

/// Concept ids are `concept:` plus a lowercase slug of the name, so the same
/// name always maps to the same concept. `None` when the name has no
/// letters or digits.
pub fn concept_id(name: &str) -> Option<String> {
    let mut slug = String::new();
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    (!slug.is_empty()).then(|| format!("concept:{}", slug))
}

/// Concept-overlap score of every other paper sharing a concept with the target.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub key: String,
    pub score: f64,
    pub shared_concepts: Vec<String>,
}

/// Score = Σ over shared concepts of `strength(target) × strength(candidate)`.
/// `others` may include the target's own edges; they are skipped.
pub(crate) fn score_candidates(target_key: &str, target: &[Relation], others: &[Relation]) -> Vec<Candidate> {
    let weights: HashMap<&str, f64> = target
        .iter()
        .map(|r| (r.concept_id.as_str(), r.strength))
        .collect();

    let mut scored: BTreeMap<&str, Candidate> = BTreeMap::new();
    for relation in others {
        if relation.paper_key == target_key {
            continue;
        }
        let Some(weight) = weights.get(relation.concept_id.as_str()) else {
            continue;
        };
        let entry = scored.entry(relation.paper_key.as_str()).or_insert_with(|| Candidate {
            key: relation.paper_key.clone(),
            score: 0.0,
            shared_concepts: Vec::new(),
        });
        entry.score += weight * relation.strength;
        entry.shared_concepts.push(relation.concept_id.clone());
    }

    scored
        .into_values()
        .map(|mut c| {
            c.shared_concepts.sort();
            c
        })
        .collect()
}

/// Score descending, then newest first with undated papers last, then key.
fn compare(a: &SimilarPaper, b: &SimilarPaper) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.paper.published_date, b.paper.published_date) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.paper.key().cmp(&b.paper.key()))
}

pub(crate) fn rank(mut similar: Vec<SimilarPaper>, top_k: usize) -> Vec<SimilarPaper> {
    similar.sort_by(compare);
    similar.truncate(top_k);
    similar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{Paper, Source};
    use chrono::NaiveDate;

    fn rel(concept: &str, paper: &str, strength: f64) -> Relation {
        Relation {
            concept_id: concept.to_string(),
            paper_key: paper.to_string(),
            strength,
        }
    }

    fn similar(id: &str, score: f64, date: Option<(i32, u32, u32)>) -> SimilarPaper {
        let mut paper = Paper::new(Source::Arxiv, id, format!("Paper {}", id));
        paper.published_date = date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d));
        SimilarPaper { paper, score, shared_concepts: Vec::new() }
    }

    #[test]
    fn test_concept_id_slug() {
        assert_eq!(concept_id("Graph Neural Networks").as_deref(), Some("concept:graph-neural-networks"));
        assert_eq!(concept_id("  graph   neural--networks! ").as_deref(), Some("concept:graph-neural-networks"));
        assert_eq!(concept_id("Zero-Knowledge Proofs"), concept_id("zero knowledge proofs"));
        assert_eq!(concept_id("???"), None);
        assert_eq!(concept_id(""), None);
    }

    #[test]
    fn test_score_is_sum_of_products() {
        let target = vec![rel("concept:a", "arxiv:t", 0.8), rel("concept:b", "arxiv:t", 0.5)];
        let others = vec![
            rel("concept:a", "arxiv:t", 0.8),
            rel("concept:a", "arxiv:x", 0.5),
            rel("concept:b", "arxiv:x", 1.0),
            rel("concept:b", "arxiv:y", 0.2),
            rel("concept:c", "arxiv:z", 1.0),
        ];
        let candidates = score_candidates("arxiv:t", &target, &others);
        assert_eq!(candidates.len(), 2);

        let x = candidates.iter().find(|c| c.key == "arxiv:x").unwrap();
        assert!((x.score - (0.8 * 0.5 + 0.5 * 1.0)).abs() < 1e-9);
        assert_eq!(x.shared_concepts, vec!["concept:a", "concept:b"]);

        let y = candidates.iter().find(|c| c.key == "arxiv:y").unwrap();
        assert!((y.score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_rank_tie_breaks() {
        let ranked = rank(
            vec![
                similar("undated", 0.5, None),
                similar("old", 0.5, Some((2019, 1, 1))),
                similar("best", 0.9, None),
                similar("new", 0.5, Some((2023, 6, 1))),
                similar("new-b", 0.5, Some((2023, 6, 1))),
            ],
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.paper.id.as_str()).collect();
        assert_eq!(ids, vec!["best", "new", "new-b", "old", "undated"]);

        assert_eq!(rank(vec![similar("a", 1.0, None), similar("b", 0.5, None)], 1).len(), 1);
    }
}
