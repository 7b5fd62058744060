use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use tracing::warn;

use tx_protocol::Learning;
use tx_protocol::LearningEdgeType;
use tx_protocol::RetrievalError;
use tx_protocol::Task;
use tx_state::StateRuntime;

use crate::clock::Clock;
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;
use crate::embedding::cosine;
use crate::reranker::RerankerClient;

/// How much of the candidate pool each index contributes before fusion.
const POOL_FLOOR: usize = 50;
/// Relevance multiplier per expansion hop.
const EXPANSION_DECAY: f64 = 0.5;
/// Positional decay applied when a requested rerank has no backend.
const POSITION_DECAY: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub min_score: Option<f64>,
    pub rerank: bool,
    pub expand_graph: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: None,
            rerank: false,
            expand_graph: false,
        }
    }
}

/// One retrieval result with every component score exposed for display.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub learning: Learning,
    /// 1-based rank in the keyword index, when matched.
    pub bm25_rank: Option<usize>,
    /// 1-based rank in the vector index, when matched.
    pub vector_rank: Option<usize>,
    pub rrf_score: f64,
    pub recency_score: f64,
    pub reranker_score: Option<f64>,
    pub relevance_score: f64,
    /// 0 for direct hits; 1 or 2 for graph-expanded ones.
    pub expansion_hops: u32,
    pub expansion_path: Vec<i64>,
    pub source_edge: Option<LearningEdgeType>,
}

/// Hybrid retrieval: BM25 keyword index and cosine vector index fused with
/// reciprocal-rank fusion, a recency tiebreak, an optional reranker pass,
/// and optional bounded graph expansion.
pub struct RetrievalEngine {
    state: Arc<StateRuntime>,
    embedding: Arc<EmbeddingClient>,
    reranker: Arc<RerankerClient>,
    config: RetrievalConfig,
    clock: Clock,
}

impl RetrievalEngine {
    pub fn new(
        state: Arc<StateRuntime>,
        embedding: Arc<EmbeddingClient>,
        reranker: Arc<RerankerClient>,
        config: RetrievalConfig,
        clock: Clock,
    ) -> Self {
        Self {
            state,
            embedding,
            reranker,
            config,
            clock,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let now = self.clock.now();
        let pool = options.limit.saturating_mul(5).max(POOL_FLOOR);

        let keyword_ranked: Vec<i64> = self
            .state
            .keyword_search(query, pool)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let vector_ranked = self.vector_ranked(query, pool).await?;

        let mut bm25_rank: HashMap<i64, usize> = HashMap::new();
        for (position, id) in keyword_ranked.iter().enumerate() {
            bm25_rank.insert(*id, position + 1);
        }
        let mut vector_rank: HashMap<i64, usize> = HashMap::new();
        for (position, id) in vector_ranked.iter().enumerate() {
            vector_rank.insert(*id, position + 1);
        }

        let ids: Vec<i64> = keyword_ranked
            .iter()
            .chain(vector_ranked.iter())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let learnings = self.state.learnings_by_ids(&ids).await?;

        let mut hits: Vec<RetrievalHit> = learnings
            .into_iter()
            .map(|learning| {
                let bm25 = bm25_rank.get(&learning.id).copied();
                let vector = vector_rank.get(&learning.id).copied();
                let rrf = rrf_score(self.config.rrf_k, &[bm25, vector]);
                let recency =
                    recency_score(learning.created_at, now, self.config.half_life_days);
                RetrievalHit {
                    relevance_score: self.config.w_rrf * rrf + self.config.w_recency * recency,
                    bm25_rank: bm25,
                    vector_rank: vector,
                    rrf_score: rrf,
                    recency_score: recency,
                    reranker_score: None,
                    expansion_hops: 0,
                    expansion_path: Vec::new(),
                    source_edge: None,
                    learning,
                }
            })
            .collect();
        sort_hits(&mut hits);

        if options.rerank {
            self.apply_rerank(query, &mut hits).await?;
            sort_hits(&mut hits);
        }

        let min_score = options.min_score.unwrap_or(self.config.min_score);
        hits.retain(|hit| hit.relevance_score >= min_score);
        hits.truncate(options.limit);

        if options.expand_graph {
            self.expand_graph(&mut hits, now).await?;
            sort_hits(&mut hits);
        }

        Ok(hits)
    }

    /// Learnings relevant to a task: query from title + description, usage
    /// recorded on everything returned so future recency signals improve.
    pub async fn context_for_task(
        &self,
        task: &Task,
        options: &SearchOptions,
    ) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let query = format!("{} {}", task.title, task.description);
        let hits = self.search(query.trim(), options).await?;
        let ids: Vec<i64> = hits.iter().map(|hit| hit.learning.id).collect();
        self.state
            .increment_usage_many(&ids, self.clock.now())
            .await?;
        Ok(hits)
    }

    async fn vector_ranked(&self, query: &str, pool: usize) -> Result<Vec<i64>, RetrievalError> {
        if !self.embedding.is_available() {
            return Ok(Vec::new());
        }
        let query_vector = match self.embedding.embed(query).await {
            Ok(vector) => vector,
            Err(err @ RetrievalError::EmbeddingDimensionMismatch { .. }) => return Err(err),
            Err(RetrievalError::EmbeddingUnavailable) => return Ok(Vec::new()),
            Err(err) => {
                warn!("embedding lookup failed, falling back to keyword-only: {err}");
                return Ok(Vec::new());
            }
        };
        let documents = self.state.embedded_learnings().await?;
        let mut scored = Vec::with_capacity(documents.len());
        for (id, document) in documents {
            if document.len() != query_vector.len() {
                return Err(RetrievalError::EmbeddingDimensionMismatch {
                    expected: document.len(),
                    actual: query_vector.len(),
                });
            }
            scored.push((id, cosine(&query_vector, &document)));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(pool);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    async fn apply_rerank(
        &self,
        query: &str,
        hits: &mut [RetrievalHit],
    ) -> Result<(), RetrievalError> {
        if hits.is_empty() {
            return Ok(());
        }
        if !self.reranker.is_available() {
            // Documented degradation: keep the fusion ordering, decay scores
            // slightly by position, and leave reranker_score unset.
            warn!("reranker unavailable; keeping fusion order with positional decay");
            for (position, hit) in hits.iter_mut().enumerate() {
                hit.relevance_score *= 1.0 - POSITION_DECAY * position as f64;
            }
            return Ok(());
        }
        let documents: Vec<&str> = hits.iter().map(|hit| hit.learning.content.as_str()).collect();
        let scores = self.reranker.rerank(query, &documents).await?;
        for (hit, score) in hits.iter_mut().zip(scores) {
            hit.reranker_score = Some(score);
            hit.relevance_score += self.config.w_reranker * score;
        }
        Ok(())
    }

    /// Bounded-depth expansion over learning-to-learning edges: direct hits
    /// seed a walk of at most two hops, each hop halving the inherited
    /// relevance.
    async fn expand_graph(
        &self,
        hits: &mut Vec<RetrievalHit>,
        now: DateTime<Utc>,
    ) -> Result<(), RetrievalError> {
        let mut present: HashSet<i64> = hits.iter().map(|hit| hit.learning.id).collect();
        let mut frontier: Vec<(i64, f64, Vec<i64>)> = hits
            .iter()
            .map(|hit| (hit.learning.id, hit.relevance_score, vec![hit.learning.id]))
            .collect();

        for hop in 1..=2_u32 {
            if frontier.is_empty() {
                break;
            }
            let frontier_ids: Vec<i64> = frontier.iter().map(|(id, _, _)| *id).collect();
            let edges = self.state.learning_edges_from(&frontier_ids).await?;
            let by_source: HashMap<i64, (f64, Vec<i64>)> = frontier
                .iter()
                .map(|(id, score, path)| (*id, (*score, path.clone())))
                .collect();

            let mut next_frontier = Vec::new();
            for (from, to, edge_type) in edges {
                if present.contains(&to) {
                    continue;
                }
                let Some((source_score, source_path)) = by_source.get(&from) else {
                    continue;
                };
                let Some(learning) = self.state.learnings_by_ids(&[to]).await?.pop() else {
                    continue;
                };
                present.insert(to);
                let relevance = source_score * EXPANSION_DECAY;
                let mut path = source_path.clone();
                path.push(to);
                next_frontier.push((to, relevance, path.clone()));
                hits.push(RetrievalHit {
                    recency_score: recency_score(
                        learning.created_at,
                        now,
                        self.config.half_life_days,
                    ),
                    learning,
                    bm25_rank: None,
                    vector_rank: None,
                    rrf_score: 0.0,
                    reranker_score: None,
                    relevance_score: relevance,
                    expansion_hops: hop,
                    expansion_path: path,
                    source_edge: Some(edge_type),
                });
            }
            frontier = next_frontier;
        }
        Ok(())
    }
}

/// Reciprocal Rank Fusion: `sum(1 / (k + rank))` over every index the item
/// appeared in.
fn rrf_score(k: f64, ranks: &[Option<usize>]) -> f64 {
    ranks
        .iter()
        .flatten()
        .map(|rank| 1.0 / (k + *rank as f64))
        .sum()
}

/// Monotone age decay: half the weight every `half_life_days`.
fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    if half_life_days <= 0.0 {
        return 0.0;
    }
    0.5_f64.powf(age_days / half_life_days)
}

fn sort_hits(hits: &mut [RetrievalHit]) {
    hits.sort_by(|a, b| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| a.learning.id.cmp(&b.learning.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingBackendConfig;
    use crate::config::BackendConfig;
    use crate::test_support::test_epoch;
    use crate::test_support::test_state;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tx_state::LearningCreateParams;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn engine_with(
        state: Arc<StateRuntime>,
        embedding: EmbeddingClient,
        clock: Clock,
    ) -> RetrievalEngine {
        RetrievalEngine::new(
            state,
            Arc::new(embedding),
            Arc::new(RerankerClient::Noop),
            RetrievalConfig::default(),
            clock,
        )
    }

    #[test]
    fn rrf_and_recency_formulas() {
        assert_eq!(rrf_score(60.0, &[Some(1), None]), 1.0 / 61.0);
        assert_eq!(
            rrf_score(60.0, &[Some(1), Some(2)]),
            1.0 / 61.0 + 1.0 / 62.0
        );
        assert_eq!(rrf_score(60.0, &[None, None]), 0.0);

        let now = test_epoch();
        assert_eq!(recency_score(now, now, 30.0), 1.0);
        let month_old = recency_score(now - Duration::days(30), now, 30.0);
        assert!((month_old - 0.5).abs() < 1e-9);
        let older = recency_score(now - Duration::days(60), now, 30.0);
        assert!(older < month_old);
    }

    #[tokio::test]
    async fn keyword_only_search_works_without_embedding_backend() {
        let (state, _dir) = test_state().await;
        let clock = Clock::fixed(test_epoch());
        state
            .insert_learning(
                &LearningCreateParams::manual("claims renew their lease every ten heartbeats"),
                clock.now(),
            )
            .await
            .expect("insert");

        let engine = engine_with(state, EmbeddingClient::Noop, clock);
        let hits = engine
            .search("lease renew", &SearchOptions::default())
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bm25_rank, Some(1));
        assert_eq!(hits[0].vector_rank, None);
        assert!(hits[0].reranker_score.is_none());
    }

    #[tokio::test]
    async fn fusion_combines_keyword_and_vector_signals() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [1.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let (state, _dir) = test_state().await;
        let clock = Clock::fixed(test_epoch());
        // L1: strong keyword match, weak vector.
        let l1 = state
            .insert_learning(
                &LearningCreateParams {
                    keywords: vec!["retry".to_string(), "backoff".to_string()],
                    embedding: Some(vec![0.0, 1.0]),
                    ..LearningCreateParams::manual(
                        "retry with exponential backoff; retry only retriable errors",
                    )
                },
                clock.now(),
            )
            .await
            .expect("insert");
        // L2: weak keyword match, strong vector.
        let l2 = state
            .insert_learning(
                &LearningCreateParams {
                    embedding: Some(vec![0.95, 0.05]),
                    ..LearningCreateParams::manual("transient network failures deserve a retry")
                },
                clock.now(),
            )
            .await
            .expect("insert");

        let embedding = EmbeddingClient::from_config(&EmbeddingBackendConfig {
            backend: BackendConfig {
                base_url: Some(format!("{}/v1", server.uri())),
                model: "embed".to_string(),
                api_key_env: String::new(),
                timeout_seconds: 5,
            },
            dimension: Some(2),
        });
        let engine = engine_with(state, embedding, clock);
        let hits = engine
            .search("retry backoff", &SearchOptions::default())
            .await
            .expect("search");

        assert_eq!(hits.len(), 2);
        let h1 = hits.iter().find(|h| h.learning.id == l1.id).expect("l1 hit");
        let h2 = hits.iter().find(|h| h.learning.id == l2.id).expect("l2 hit");
        // Each index favors its own champion.
        assert!(h1.bm25_rank.expect("l1 keyword rank") < h2.bm25_rank.expect("l2 keyword rank"));
        assert!(h2.vector_rank.expect("l2 vector rank") < h1.vector_rank.expect("l1 vector rank"));
        // No reranker: no reranker scores, and relevance is exactly the
        // weighted blend of the reported components.
        for hit in &hits {
            assert!(hit.reranker_score.is_none());
            let expected = RetrievalConfig::default().w_rrf * hit.rrf_score
                + RetrievalConfig::default().w_recency * hit.recency_score;
            assert!((hit.relevance_score - expected).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn graph_expansion_tags_hops_and_paths() {
        let (state, _dir) = test_state().await;
        let clock = Clock::fixed(test_epoch());
        let seed = state
            .insert_learning(
                &LearningCreateParams::manual("workers coordinate through store leases"),
                clock.now(),
            )
            .await
            .expect("insert");
        let neighbor = state
            .insert_learning(
                &LearningCreateParams::manual("unrelated wording entirely"),
                clock.now(),
            )
            .await
            .expect("insert");
        state
            .add_learning_edge(
                seed.id,
                neighbor.id,
                LearningEdgeType::Refines,
                clock.now(),
            )
            .await
            .expect("edge");

        let engine = engine_with(state, EmbeddingClient::Noop, clock);
        let hits = engine
            .search(
                "store leases",
                &SearchOptions {
                    expand_graph: true,
                    ..SearchOptions::default()
                },
            )
            .await
            .expect("search");

        let expanded = hits
            .iter()
            .find(|hit| hit.learning.id == neighbor.id)
            .expect("expanded hit");
        assert_eq!(expanded.expansion_hops, 1);
        assert_eq!(expanded.expansion_path, vec![seed.id, neighbor.id]);
        assert_eq!(expanded.source_edge, Some(LearningEdgeType::Refines));
        let direct = hits
            .iter()
            .find(|hit| hit.learning.id == seed.id)
            .expect("direct hit");
        assert!(expanded.relevance_score < direct.relevance_score);
    }

    #[tokio::test]
    async fn context_for_task_records_usage() {
        let (state, _dir) = test_state().await;
        let clock = Clock::fixed(test_epoch());
        let learning = state
            .insert_learning(
                &LearningCreateParams::manual("parser errors should carry line numbers"),
                clock.now(),
            )
            .await
            .expect("insert");
        let task = state
            .create_task(
                &tx_state::TaskCreateParams {
                    title: "improve parser errors".to_string(),
                    description: "line numbers everywhere".to_string(),
                    ..tx_state::TaskCreateParams::default()
                },
                clock.now(),
            )
            .await
            .expect("task");

        let engine = engine_with(state.clone(), EmbeddingClient::Noop, clock);
        let hits = engine
            .context_for_task(&task, &SearchOptions::default())
            .await
            .expect("context");
        assert_eq!(hits.len(), 1);
        let refreshed = state
            .get_learning(learning.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(refreshed.usage_count, 1);
    }
}
