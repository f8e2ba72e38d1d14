//! Per-record resolution orchestrator.
//!
//! For one record: seed known values, search, fetch the most promising
//! pages, extract and rank candidates, optionally ask the LLM about empty or
//! tied fields, then run the postal cascade. Every value stored on the
//! [`ResolvedRecord`] has passed the [`Validator`] for its field.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use recordfill_cache::PostalCache;
use recordfill_extract::html::page_text;
use recordfill_extract::{
    ExtractContext, Extractor, RankedCandidates, RankedValue, Validator, rank, rank_key,
    split_address,
};
use recordfill_shared::{
    Candidate, FieldKind, PartialRecord, Provenance, ResolvedRecord, ResolverConfig, Result,
};
use recordfill_sources::{
    Fetch, Llm, PostalApi, PostalPortal, SearchBackend, SearchHit, SessionControl,
    prioritize_hits, retry_once,
};

use crate::cascade::{CascadeSources, PostalCascade, PostalOutcome, PostalRequest};
use crate::disambiguate::Disambiguator;
use crate::query::build_queries;

/// Fields pulled out of snippets and pages.
const EXTRACTED: [FieldKind; 10] = [
    FieldKind::Address,
    FieldKind::Complement,
    FieldKind::Neighborhood,
    FieldKind::PostalCode,
    FieldKind::City,
    FieldKind::Phone,
    FieldKind::Mobile,
    FieldKind::Email,
    FieldKind::Category,
    FieldKind::OrgId,
];

/// Fields the LLM may be asked about.
const LLM_FIELDS: [FieldKind; 6] = [
    FieldKind::Address,
    FieldKind::Phone,
    FieldKind::Mobile,
    FieldKind::Email,
    FieldKind::Category,
    FieldKind::Neighborhood,
];

/// The clients one worker resolves with. Browser-backed entries belong to
/// that worker alone.
#[derive(Clone, Default)]
pub struct Sources {
    pub fetch: Option<Arc<dyn Fetch>>,
    pub search: Vec<Arc<dyn SearchBackend>>,
    pub llm: Option<Arc<dyn Llm>>,
    pub postal_api: Option<Arc<dyn PostalApi>>,
    pub portal: Option<Arc<dyn PostalPortal>>,
    pub session: Option<Arc<dyn SessionControl>>,
}

/// Everything gathered for one record across search rounds.
#[derive(Default)]
struct Evidence {
    candidates: Vec<Candidate>,
    page_text: String,
    issued: HashSet<String>,
    fetched: HashSet<String>,
    dead_backends: HashSet<String>,
}

/// Resolves records one at a time for a single worker.
pub struct Resolver {
    config: ResolverConfig,
    extractor: Extractor,
    validator: Validator,
    fetch: Option<Arc<dyn Fetch>>,
    search: Vec<Arc<dyn SearchBackend>>,
    session: Option<Arc<dyn SessionControl>>,
    disambiguator: Option<Disambiguator>,
    cascade: PostalCascade,
}

impl Resolver {
    pub fn new(config: ResolverConfig, sources: Sources, cache: PostalCache) -> Self {
        let search = if config.use_search {
            sources.search
        } else {
            Vec::new()
        };
        let cascade = PostalCascade::new(
            CascadeSources {
                postal_api: sources.postal_api,
                search: search.clone(),
                portal: sources.portal,
            },
            cache,
            config.cascade.clone(),
            &config.filters,
            config.search_limit,
        );
        let validator = Validator::new(&config.filters);
        let disambiguator = sources
            .llm
            .filter(|_| config.use_llm)
            .map(|llm| Disambiguator::new(llm, validator.clone(), config.llm_page_budget));

        Self {
            extractor: Extractor::new(&config.filters),
            validator,
            fetch: sources.fetch,
            search,
            session: sources.session,
            disambiguator,
            cascade,
            config,
        }
    }

    /// Resolve one record from scratch.
    pub async fn resolve(&self, record: PartialRecord) -> Result<ResolvedRecord> {
        let mut draft = ResolvedRecord::new(record);
        self.resolve_into(&mut draft).await?;
        Ok(draft)
    }

    /// Resolve into `draft`, which keeps whatever was found if this future
    /// is interrupted.
    ///
    /// Source failures are absorbed; only cache failures are returned.
    #[instrument(skip_all, fields(row = draft.input.row, name = %draft.input.name))]
    pub async fn resolve_into(&self, draft: &mut ResolvedRecord) -> Result<()> {
        let record = draft.input.clone();
        self.seed(draft);
        let targets: Vec<FieldKind> = FieldKind::RESOLVABLE
            .into_iter()
            .filter(|f| !draft.has(*f))
            .collect();

        let mut postal_hint = None;
        if !targets.is_empty() && !self.search.is_empty() {
            let mut evidence = Evidence::default();
            let label = &self.config.identifier_label;

            let first: Vec<String> = build_queries(&record, None, label)
                .into_iter()
                .take(self.config.max_queries.max(1))
                .collect();
            self.gather(&record, &first, &mut evidence).await;

            if record.identifier.is_none() {
                if let Some(id) = self.discovered_org_id(&evidence) {
                    info!(org_id = %id, "organisation id discovered, searching again");
                    let second: Vec<String> = build_queries(&record, Some(&id), label)
                        .into_iter()
                        .filter(|q| !evidence.issued.contains(q))
                        .take(self.config.max_queries.max(1))
                        .collect();
                    draft.discovered_id = Some(id);
                    self.gather(&record, &second, &mut evidence).await;
                }
            }

            postal_hint = self.apply(draft, &record, &evidence).await;
        }

        self.resolve_postal(draft, &record, postal_hint).await?;

        draft.finalize(&targets);
        info!(
            status = draft.status.as_str(),
            resolved = draft.resolved_count(),
            "record finished"
        );
        Ok(())
    }

    /// Run only the postal cascade.
    pub async fn postal_code(&self, req: &PostalRequest) -> Result<Option<PostalOutcome>> {
        self.cascade.resolve(req).await
    }

    /// Tear down this worker's browser, if any.
    pub async fn release(&self) {
        if let Some(session) = &self.session {
            session.release().await;
        }
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// Copy valid input values onto the draft with `input` provenance.
    fn seed(&self, draft: &mut ResolvedRecord) {
        let input = draft.input.clone();
        for field in FieldKind::RESOLVABLE {
            let Some(value) = input.known(field) else {
                continue;
            };
            // The street column usually holds no number; judge it as a line.
            let value = match (field, input.known(FieldKind::Number)) {
                (FieldKind::Address, Some(number)) if !value.chars().any(|c| c.is_ascii_digit()) => {
                    format!("{value}, {number}")
                }
                _ => value.to_string(),
            };
            match self.validator.check(field, &value) {
                Ok(()) => {
                    draft.set(field, value, Provenance::Input);
                }
                Err(reason) => debug!(%field, %reason, "input value not kept"),
            }
        }
    }

    /// Search with each query, extract snippets, then fetch and extract the
    /// best pages not fetched yet.
    async fn gather(&self, record: &PartialRecord, queries: &[String], ev: &mut Evidence) {
        let region = record.region.as_deref();
        let limit = self.config.search_limit.max(1);
        let mut hits: Vec<SearchHit> = Vec::new();

        for query in queries {
            ev.issued.insert(query.clone());
            let live: Vec<&Arc<dyn SearchBackend>> = self
                .search
                .iter()
                .filter(|b| !ev.dead_backends.contains(b.name()))
                .collect();
            if live.is_empty() {
                break;
            }

            debug!(%query, backends = live.len(), "searching");
            let results = join_all(
                live.iter()
                    .map(|b| retry_once(b.name(), move || b.search(query, limit))),
            )
            .await;

            for (backend, result) in live.iter().zip(results) {
                match result {
                    Ok(found) => {
                        let ctx = ExtractContext {
                            source: Provenance::SearchSnippet,
                            origin: backend.name(),
                            region,
                        };
                        for hit in &found {
                            let text = format!("{}\n{}", hit.title, hit.snippet);
                            ev.candidates
                                .extend(self.extractor.extract_text(&text, &EXTRACTED, &ctx));
                        }
                        hits.extend(found);
                    }
                    Err(e) => {
                        warn!(backend = backend.name(), error = %e, "search backend skipped for this record");
                        ev.dead_backends.insert(backend.name().to_string());
                    }
                }
            }
        }

        let Some(fetch) = &self.fetch else {
            return;
        };
        let pages: Vec<SearchHit> = prioritize_hits(hits, &record.name, usize::MAX)
            .into_iter()
            .filter(|h| !ev.fetched.contains(&h.url))
            .take(self.config.max_urls.saturating_sub(ev.fetched.len()))
            .collect();
        if pages.is_empty() {
            return;
        }

        let use_browser = self.config.browser_fetch;
        let source = if use_browser {
            Provenance::BrowserPage
        } else {
            Provenance::Page
        };
        let bodies = join_all(
            pages
                .iter()
                .map(|h| retry_once("fetch", move || fetch.fetch(&h.url, use_browser))),
        )
        .await;

        let text_cap = self.config.llm_page_budget.saturating_mul(2);
        for (page, body) in pages.iter().zip(bodies) {
            ev.fetched.insert(page.url.clone());
            let html = match body {
                Ok(html) => html,
                Err(e) => {
                    debug!(url = %page.url, error = %e, "page skipped");
                    continue;
                }
            };
            let ctx = ExtractContext {
                source,
                origin: &page.url,
                region,
            };
            ev.candidates
                .extend(self.extractor.extract_html(&html, &EXTRACTED, &ctx));
            if ev.page_text.chars().count() < text_cap {
                ev.page_text.push_str(&page_text(&html));
                ev.page_text.push_str("\n\n");
            }
        }
    }

    fn discovered_org_id(&self, ev: &Evidence) -> Option<String> {
        let ranked = rank(ev.candidates.iter().filter(|c| c.field == FieldKind::OrgId));
        first_valid(&self.validator, &ranked, FieldKind::OrgId).map(|r| r.value.clone())
    }

    /// Store the best value for every missing field. Returns the best postal
    /// code candidate, which the cascade verifies instead of storing directly.
    async fn apply(
        &self,
        draft: &mut ResolvedRecord,
        record: &PartialRecord,
        ev: &Evidence,
    ) -> Option<(String, Provenance)> {
        let ranked = rank(&ev.candidates);

        let mut ask: Vec<FieldKind> = Vec::new();
        let mut tied: HashSet<FieldKind> = HashSet::new();
        for field in LLM_FIELDS {
            if draft.has(field) {
                continue;
            }
            let accepted: Vec<&RankedValue> = valid_values(&self.validator, &ranked, field);
            match accepted.as_slice() {
                [] => ask.push(field),
                [a, b, ..] if self.config.llm_disambiguate && a.count == b.count => {
                    ask.push(field);
                    tied.insert(field);
                }
                _ => {}
            }
        }

        let llm_answers = match &self.disambiguator {
            Some(d) if !ask.is_empty() => d.resolve(record, &ev.page_text, &ask, &ranked).await,
            _ => Vec::new(),
        };

        for field in FieldKind::RESOLVABLE {
            if draft.has(field) || field == FieldKind::PostalCode {
                continue;
            }
            let llm = llm_answers.iter().find(|c| c.field == field);
            let chosen: Option<(String, Provenance)> = if tied.contains(&field) {
                // The LLM only breaks a tie by naming one of the tied values.
                let options = valid_values(&self.validator, &ranked, field);
                let picked = llm.and_then(|c| {
                    let key = rank_key(field, &c.value);
                    options.iter().find(|o| rank_key(field, &o.value) == key)
                });
                picked
                    .or_else(|| options.first())
                    .map(|o| (o.value.clone(), o.source))
            } else {
                first_valid(&self.validator, &ranked, field)
                    .map(|r| (r.value.clone(), r.source))
                    .or_else(|| llm.map(|c| (c.value.clone(), c.source)))
            };

            if let Some((value, source)) = chosen {
                if field == FieldKind::Address {
                    self.apply_address_parts(draft, &value, source);
                }
                draft.set(field, value, source);
            }
        }

        first_valid(&self.validator, &ranked, FieldKind::PostalCode)
            .map(|r| (r.value.clone(), r.source))
            .or_else(|| {
                llm_answers
                    .iter()
                    .find(|c| c.field == FieldKind::PostalCode)
                    .map(|c| (c.value.clone(), c.source))
            })
    }

    /// Fill number and complement from a chosen address line.
    fn apply_address_parts(&self, draft: &mut ResolvedRecord, line: &str, source: Provenance) {
        let parts = split_address(line);
        let pieces = [
            (FieldKind::Number, parts.number),
            (FieldKind::Complement, parts.complement),
        ];
        for (field, value) in pieces {
            let Some(value) = value else {
                continue;
            };
            if !draft.has(field) && self.validator.check(field, &value).is_ok() {
                draft.set(field, value, source);
            }
        }
    }

    async fn resolve_postal(
        &self,
        draft: &mut ResolvedRecord,
        record: &PartialRecord,
        hint: Option<(String, Provenance)>,
    ) -> Result<()> {
        if draft.has(FieldKind::PostalCode) {
            return Ok(());
        }

        let street = draft
            .value(FieldKind::Address)
            .map(|line| split_address(line).street)
            .or_else(|| record.known(FieldKind::Address).map(str::to_string))
            .unwrap_or_default();
        let req = PostalRequest {
            street,
            number: draft.value(FieldKind::Number).map(str::to_string),
            city: draft.value(FieldKind::City).unwrap_or_default().to_string(),
            region: draft
                .value(FieldKind::Region)
                .or(record.region.as_deref())
                .unwrap_or_default()
                .to_string(),
            neighborhood: draft.value(FieldKind::Neighborhood).map(str::to_string),
            hint: hint.as_ref().map(|(code, _)| code.clone()),
        };

        match self.cascade.resolve(&req).await? {
            Some(outcome) => {
                let provenance = outcome.provenance;
                let payload = outcome.payload;
                draft.set(FieldKind::PostalCode, payload.postal_code, provenance);
                let extras = [
                    (FieldKind::Neighborhood, payload.neighborhood),
                    (FieldKind::City, payload.city),
                    (FieldKind::Region, payload.region),
                ];
                for (field, value) in extras {
                    if !draft.has(field) && self.validator.check(field, &value).is_ok() {
                        draft.set(field, value, provenance);
                    }
                }
            }
            None => {
                if let Some((code, source)) = hint {
                    debug!(%code, "postal cascade empty, keeping extracted code");
                    draft.set(FieldKind::PostalCode, code, source);
                }
            }
        }
        Ok(())
    }
}

fn valid_values<'a>(
    validator: &Validator,
    ranked: &'a RankedCandidates,
    field: FieldKind,
) -> Vec<&'a RankedValue> {
    ranked
        .get(field)
        .iter()
        .filter(|r| validator.check(field, &r.value).is_ok())
        .collect()
}

fn first_valid<'a>(
    validator: &Validator,
    ranked: &'a RankedCandidates,
    field: FieldKind,
) -> Option<&'a RankedValue> {
    ranked
        .get(field)
        .iter()
        .find(|r| validator.check(field, &r.value).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockFetch, MockLlm, MockPortal, MockPostalApi, MockSearch, MockSession, hit};
    use recordfill_shared::{CacheKey, PostalPayload, RecordStatus};
    use std::collections::BTreeMap;

    fn jane() -> PartialRecord {
        PartialRecord {
            name: "Jane Doe".into(),
            region: Some("SP".into()),
            street: Some("Rua X".into()),
            city: Some("São Paulo".into()),
            ..PartialRecord::default()
        }
    }

    fn config() -> ResolverConfig {
        ResolverConfig::default()
    }

    #[tokio::test]
    async fn structured_api_fills_postal_code_and_cache() {
        let api = Arc::new(MockPostalApi::returning(vec![PostalPayload::code("01310-200")]));
        let cache = PostalCache::in_memory();
        let sources = Sources {
            postal_api: Some(api.clone()),
            ..Sources::default()
        };
        let resolver = Resolver::new(config(), sources, cache.clone());

        let out = resolver.resolve(jane()).await.unwrap();
        let postal = out.get(FieldKind::PostalCode).unwrap();
        assert_eq!(postal.value, "01310-200");
        assert_eq!(postal.provenance.as_str(), "structured-api");

        let key = CacheKey::new("rua x", "sao paulo", "SP");
        assert_eq!(key.to_string(), "rua x|sao paulo|SP");
        let entry = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.payload.postal_code, "01310-200");
    }

    #[tokio::test]
    async fn total_failure_falls_back_to_city_default() {
        let mut cfg = config();
        cfg.cascade.city_defaults =
            BTreeMap::from([("São Paulo/SP".to_string(), "01000-000".to_string())]);
        let search = Arc::new(MockSearch::failing("search"));
        let portal = Arc::new(MockPortal::failing());
        let sources = Sources {
            search: vec![search.clone()],
            postal_api: Some(Arc::new(MockPostalApi::failing())),
            portal: Some(portal.clone()),
            fetch: Some(Arc::new(MockFetch::default())),
            ..Sources::default()
        };
        let resolver = Resolver::new(cfg, sources, PostalCache::in_memory());

        let out = resolver.resolve(jane()).await.unwrap();
        let postal = out.get(FieldKind::PostalCode).unwrap();
        assert_eq!(postal.value, "01000-000");
        assert_eq!(postal.provenance.as_str(), "city-default");
        assert_eq!(out.status, RecordStatus::Partial);
    }

    #[tokio::test]
    async fn malformed_llm_answer_leaves_fields_unresolved() {
        let page = "<html><body><h1>Dra. Jane Doe</h1><p>Atendimento com hora marcada.</p></body></html>";
        let llm = Arc::new(MockLlm::answering("Sorry, I cannot find that information."));
        let cache = PostalCache::in_memory();
        let sources = Sources {
            search: vec![Arc::new(MockSearch::returning(
                "search",
                vec![hit("https://clinica.test/jane-doe", "Dra. Jane Doe")],
            ))],
            fetch: Some(Arc::new(MockFetch::with_page("https://clinica.test/jane-doe", page))),
            llm: Some(llm.clone()),
            postal_api: Some(Arc::new(MockPostalApi::returning(Vec::new()))),
            ..Sources::default()
        };
        let resolver = Resolver::new(config(), sources, cache.clone());

        let out = resolver.resolve(jane()).await.unwrap();
        assert_eq!(llm.calls(), 1);
        assert!(!out.has(FieldKind::Email));
        assert!(!out.has(FieldKind::Phone));
        assert!(!out.has(FieldKind::PostalCode));

        let entry = cache.get(&CacheKey::new("Rua X", "São Paulo", "SP")).await.unwrap();
        assert!(entry.is_none_or(|e| !e.is_found()));
    }

    #[tokio::test]
    async fn extracts_ranks_and_attributes_sources() {
        let page_a = r#"<html><body>
            <p>Dra. Jane Doe - Dermatologia</p>
            <p>Rua Augusta, 1500 - Sala 12 - Consolação</p>
            <p>São Paulo - SP</p>
            <a href="tel:+551133334444">Ligue</a>
            <a href="mailto:contato@clinicajane.com.br">E-mail</a>
        </body></html>"#;
        let page_b = r#"<html><body><p>Telefone: (11) 3333-4444</p>
            <p>Rua Augusta, 1500</p></body></html>"#;
        let mut fetch = MockFetch::with_page("https://clinicajane.com.br/jane-doe", page_a);
        fetch
            .pages
            .insert("https://guia.test/medicos".into(), page_b.into());
        let fetch = Arc::new(fetch);
        let sources = Sources {
            search: vec![Arc::new(MockSearch::returning(
                "search",
                vec![
                    hit("https://guia.test/medicos", "Jane Doe, (11) 98888-7777"),
                    hit("https://clinicajane.com.br/jane-doe", ""),
                ],
            ))],
            fetch: Some(fetch.clone()),
            postal_api: Some(Arc::new(MockPostalApi::returning(vec![PostalPayload {
                postal_code: "01305-100".into(),
                neighborhood: "Consolação".into(),
                ..PostalPayload::default()
            }]))),
            ..Sources::default()
        };
        let resolver = Resolver::new(config(), sources, PostalCache::in_memory());

        let record = PartialRecord {
            street: None,
            city: None,
            ..jane()
        };
        let out = resolver.resolve(record).await.unwrap();

        assert_eq!(out.value(FieldKind::Phone), Some("(11) 3333-4444"));
        assert_eq!(out.get(FieldKind::Phone).unwrap().provenance, Provenance::Page);
        let mobile = out.get(FieldKind::Mobile).unwrap();
        assert_eq!(mobile.value, "(11) 98888-7777");
        assert_eq!(mobile.provenance, Provenance::SearchSnippet);
        assert_eq!(out.value(FieldKind::Email), Some("contato@clinicajane.com.br"));
        assert_eq!(out.value(FieldKind::Number), Some("1500"));
        assert_eq!(out.value(FieldKind::Category), Some("Dermatologia"));
        assert_eq!(out.value(FieldKind::City), Some("São Paulo"));
        assert_eq!(out.value(FieldKind::PostalCode), Some("01305-100"));
        // The name slug URL is fetched first; both pages fit under max_urls.
        assert_eq!(fetch.calls(), 2);
        assert_eq!(fetch.browser_calls(), 0);
    }

    #[tokio::test]
    async fn discovered_org_id_triggers_second_round() {
        let search = Arc::new(MockSearch::returning(
            "search",
            vec![hit("https://cnpj.test/x", "Jane Doe Clinica LTDA CNPJ 11.222.333/0001-81")],
        ));
        let sources = Sources {
            search: vec![search.clone()],
            ..Sources::default()
        };
        let resolver = Resolver::new(config(), sources, PostalCache::in_memory());

        let record = PartialRecord {
            name: "Jane Doe".into(),
            region: Some("SP".into()),
            ..PartialRecord::default()
        };
        let out = resolver.resolve(record).await.unwrap();
        assert_eq!(out.discovered_id.as_deref(), Some("11.222.333/0001-81"));
        // "Jane Doe SP", "Jane Doe", then "Jane Doe 11.222.333/0001-81".
        assert_eq!(search.calls(), 3);
    }

    #[tokio::test]
    async fn invalid_input_values_are_not_kept() {
        let record = PartialRecord {
            email: Some("not-an-email".into()),
            phone: Some("(11) 3333-4444".into()),
            street: Some("Rua Augusta".into()),
            number: Some("10".into()),
            ..jane()
        };
        let resolver = Resolver::new(config(), Sources::default(), PostalCache::in_memory());
        let out = resolver.resolve(record).await.unwrap();

        assert!(!out.has(FieldKind::Email));
        assert_eq!(out.get(FieldKind::Phone).unwrap().provenance, Provenance::Input);
        assert_eq!(out.value(FieldKind::Address), Some("Rua Augusta, 10"));
        assert_eq!(out.status, RecordStatus::Unresolved);
    }

    #[tokio::test]
    async fn release_reaches_the_session() {
        let session = Arc::new(MockSession::default());
        let sources = Sources {
            session: Some(session.clone()),
            ..Sources::default()
        };
        let resolver = Resolver::new(config(), sources, PostalCache::in_memory());
        resolver.release().await;
        assert_eq!(session.releases(), 1);
    }
}
