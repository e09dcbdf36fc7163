//! Token-bounded rendering of a sub-graph.

use tracing::debug;

use crate::runtime::token_service::TokenService;

use super::retrieve::SubGraph;

const ENTITIES_HEADER: &str = "-----Entities-----\nid|entity|type|description|score";
const RELATIONSHIPS_HEADER: &str = "-----Relationships-----\nid|source|target|type|description|weight";
const REPORTS_HEADER: &str = "-----Reports-----\nid|title|rating|content";

/// Rendered graph context and what made it in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphContext {
    pub text: String,
    pub tokens: usize,
    pub entities: usize,
    pub relationships: usize,
    pub reports: usize,
    /// Some items were left out for lack of budget.
    pub truncated: bool,
}

impl GraphContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Renders a [`SubGraph`] into pipe-separated tables within a token budget.
///
/// Items are emitted in ranked order: entities, then relationships, then
/// reports. Rendering stops at the first item that would exceed the budget,
/// so nothing is ever cut mid-row.
#[derive(Debug, Clone)]
pub struct GraphContextBuilder {
    tokens: TokenService,
    max_context_tokens: usize,
}

struct Budget<'a> {
    tokens: &'a TokenService,
    remaining: usize,
    lines: Vec<String>,
    exhausted: bool,
}

impl Budget<'_> {
    /// Try to append `line`; returns false (and stops all later pushes) if it does not fit.
    fn push(&mut self, line: String) -> bool {
        if self.exhausted {
            return false;
        }
        // One extra token for the newline joining it to the previous line.
        let cost = self.tokens.count(&line) + usize::from(!self.lines.is_empty());
        if cost > self.remaining {
            self.exhausted = true;
            return false;
        }
        self.remaining -= cost;
        self.lines.push(line);
        true
    }

    /// Emit a section header followed by as many rows as fit.
    fn section(&mut self, header: &str, rows: impl IntoIterator<Item = String>) -> usize {
        let mut rows = rows.into_iter().peekable();
        if rows.peek().is_none() || !self.push(header.to_string()) {
            return 0;
        }
        let mut written = 0;
        for row in rows {
            if !self.push(row) {
                break;
            }
            written += 1;
        }
        if written == 0 {
            // A header without rows is noise.
            if let Some(header) = self.lines.pop() {
                self.remaining += self.tokens.count(&header) + usize::from(!self.lines.is_empty());
            }
        }
        written
    }
}

impl GraphContextBuilder {
    pub fn new(tokens: TokenService, max_context_tokens: usize) -> Self {
        Self {
            tokens,
            max_context_tokens,
        }
    }

    pub fn render(&self, subgraph: &SubGraph) -> GraphContext {
        let mut budget = Budget {
            tokens: &self.tokens,
            remaining: self.max_context_tokens,
            lines: Vec::new(),
            exhausted: false,
        };

        let entities = budget.section(
            ENTITIES_HEADER,
            subgraph.entities.iter().map(|s| {
                let e = &s.item;
                format!(
                    "{}|{}|{}|{}|{:.3}",
                    cell(&e.id),
                    cell(&e.name),
                    cell(&e.entity_type),
                    cell(e.description().unwrap_or_default()),
                    s.score
                )
            }),
        );
        let relationships = budget.section(
            RELATIONSHIPS_HEADER,
            subgraph.relationships.iter().map(|edge| {
                let r = &edge.relationship;
                format!(
                    "{}|{}|{}|{}|{}|{}",
                    cell(&r.id),
                    cell(&edge.source_name),
                    cell(&edge.target_name),
                    cell(&r.relation_type),
                    cell(r.description().unwrap_or(&r.name)),
                    r.weight
                )
            }),
        );
        let reports = budget.section(
            REPORTS_HEADER,
            subgraph.reports.iter().map(|c| {
                format!(
                    "{}|{}|{}|{}",
                    cell(&c.id),
                    cell(&c.title),
                    c.rating,
                    cell(&c.full_content)
                )
            }),
        );

        let truncated = entities < subgraph.entities.len()
            || relationships < subgraph.relationships.len()
            || reports < subgraph.reports.len();
        let tokens = self.max_context_tokens - budget.remaining;
        if truncated {
            debug!(
                entities,
                relationships,
                reports,
                tokens,
                max_tokens = self.max_context_tokens,
                "Graph context truncated at item boundary"
            );
        }

        GraphContext {
            text: budget.lines.join("\n"),
            tokens,
            entities,
            relationships,
            reports,
            truncated,
        }
    }
}

/// Keep a value on one row of one column.
fn cell(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '|' || c == '\n' || c == '\r' { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::retrieve::SubGraphEdge;
    use crate::graph::store::tests::{entity, relationship};
    use crate::rag::ranking::Scored;

    fn subgraph() -> SubGraph {
        let mut a = entity("a", "Alpha");
        a.attributes
            .insert("description".into(), serde_json::json!("first | letter\nof the alphabet"));
        SubGraph {
            entities: vec![
                Scored { item: a, score: 1.0 },
                Scored {
                    item: entity("b", "Beta"),
                    score: 0.5,
                },
            ],
            relationships: vec![SubGraphEdge {
                relationship: relationship("r1", "a", "b"),
                source_name: "Alpha".into(),
                target_name: "Beta".into(),
            }],
            reports: vec![],
        }
    }

    #[test]
    fn test_full_render() {
        let ctx = GraphContextBuilder::new(TokenService::estimating(), 10_000).render(&subgraph());
        assert!(!ctx.truncated);
        assert_eq!(ctx.entities, 2);
        assert_eq!(ctx.relationships, 1);
        let lines: Vec<_> = ctx.text.lines().collect();
        assert_eq!(lines[0], "-----Entities-----");
        assert_eq!(lines[2], "a|Alpha|thing|first   letter of the alphabet|1.000");
        assert!(ctx.text.contains("-----Relationships-----"));
        assert!(!ctx.text.contains("-----Reports-----"));
        assert!(ctx.tokens <= 10_000);
    }

    #[test]
    fn test_truncates_at_item_boundary() {
        let tokens = TokenService::estimating();
        let header_cost = tokens.count(ENTITIES_HEADER);
        let first_row = "a|Alpha|thing|first   letter of the alphabet|1.000";
        let budget = header_cost + 1 + tokens.count(first_row) + 1;

        let ctx = GraphContextBuilder::new(tokens, budget).render(&subgraph());
        assert!(ctx.truncated);
        assert_eq!(ctx.entities, 1);
        assert_eq!(ctx.relationships, 0);
        assert!(ctx.text.ends_with("1.000"));
        assert!(ctx.tokens <= budget);
    }

    #[test]
    fn test_zero_budget_renders_nothing() {
        let ctx = GraphContextBuilder::new(TokenService::estimating(), 0).render(&subgraph());
        assert!(ctx.is_empty());
        assert!(ctx.truncated);
    }
}
