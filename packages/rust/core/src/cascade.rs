//! Postal-code cascade.
//!
//! An ordered fallback of independent lookup strategies, cheapest first:
//!
//! | stage | provenance |
//! |---|---|
//! | cache | whatever produced the cached entry |
//! | structured lookup by address | `structured-api` |
//! | structured lookup by candidate code | `code-api` |
//! | search-engine scrape | `search-scrape` |
//! | lookup portal form | `portal` |
//! | city-level default | `city-default` |
//!
//! A stage only runs when every earlier stage came back empty. Within a
//! stage, address variants (as given, abbreviations expanded, street type
//! dropped, number dropped) are tried in turn. The outcome of a run, found
//! or exhausted, is written to the cache under the request's [`CacheKey`].

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use futures::future::join_all;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use recordfill_cache::PostalCache;
use recordfill_extract::{ExtractContext, Extractor, Validator, normalize_postal_code, rank};
use recordfill_shared::text::{
    collapse_whitespace, digits, expand_abbreviations, normalize_key, strip_accents, strip_number,
    strip_street_type,
};
use recordfill_shared::{
    CacheEntry, CacheKey, CascadeConfig, CascadeStage, FieldKind, FiltersConfig, PostalPayload,
    Provenance, Result,
};
use recordfill_sources::{PostalApi, PostalPortal, SearchBackend, retry_once};

/// Street names shorter than this are not worth a lookup.
const MIN_VARIANT_CHARS: usize = 3;

static UP_TO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bate (\d+)").expect("valid regex"));
static BETWEEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bde (\d+) (?:a|ao|ate) (\d+)").expect("valid regex"));
static FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bde (\d+) (?:ao|a) fim\b").expect("valid regex"));

/// What the cascade is asked to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostalRequest {
    /// Street name, ideally without the house number.
    pub street: String,
    pub number: Option<String>,
    pub city: String,
    pub region: String,
    pub neighborhood: Option<String>,
    /// A code surfaced earlier (page extraction), verified by the code stage.
    pub hint: Option<String>,
}

/// A resolved postal code and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostalOutcome {
    pub payload: PostalPayload,
    pub provenance: Provenance,
    pub from_cache: bool,
}

/// Clients the cascade may call. Missing clients skip their stage.
#[derive(Clone, Default)]
pub struct CascadeSources {
    pub postal_api: Option<Arc<dyn PostalApi>>,
    pub search: Vec<Arc<dyn SearchBackend>>,
    pub portal: Option<Arc<dyn PostalPortal>>,
}

/// Cache-checked, strictly ordered postal-code resolver.
pub struct PostalCascade {
    sources: CascadeSources,
    cache: PostalCache,
    config: CascadeConfig,
    validator: Validator,
    extractor: Extractor,
    search_limit: usize,
}

impl PostalCascade {
    pub fn new(
        sources: CascadeSources,
        cache: PostalCache,
        config: CascadeConfig,
        filters: &FiltersConfig,
        search_limit: usize,
    ) -> Self {
        Self {
            sources,
            cache,
            config,
            validator: Validator::new(filters),
            extractor: Extractor::new(filters),
            search_limit: search_limit.max(1),
        }
    }

    /// Resolve a postal code for `req`.
    ///
    /// Source failures never surface here; only a broken cache is an error.
    #[instrument(skip_all, fields(street = %req.street, city = %req.city, region = %req.region))]
    pub async fn resolve(&self, req: &PostalRequest) -> Result<Option<PostalOutcome>> {
        if req.city.trim().is_empty() || req.region.trim().is_empty() {
            debug!("no city or region, skipping postal cascade");
            return Ok(None);
        }

        let key = (!req.street.trim().is_empty())
            .then(|| CacheKey::new(&req.street, &req.city, &req.region));

        if let Some(key) = &key {
            if self.config.is_enabled(CascadeStage::Cache) {
                if let Some(entry) = self.cache.get(key).await? {
                    debug!(%key, found = entry.is_found(), "postal cache hit");
                    return Ok(match (entry.is_found(), entry.provenance) {
                        (true, Some(provenance)) => Some(PostalOutcome {
                            payload: entry.payload,
                            provenance,
                            from_cache: true,
                        }),
                        _ => None,
                    });
                }
            }
        }

        let outcome = self.run_stages(req).await;

        if let Some(key) = key {
            match &outcome {
                Some(o) => {
                    let entry = CacheEntry::found(o.payload.clone(), o.provenance);
                    self.cache.put(key, entry).await?;
                }
                None if self.config.cache_negative => {
                    self.cache.put(key, CacheEntry::not_found()).await?;
                }
                None => {}
            }
        }
        Ok(outcome)
    }

    async fn run_stages(&self, req: &PostalRequest) -> Option<PostalOutcome> {
        // Fixed order regardless of how the stage list is written.
        for stage in CascadeStage::ALL {
            if stage == CascadeStage::Cache || !self.config.is_enabled(stage) {
                continue;
            }
            let found = match stage {
                CascadeStage::Cache => None,
                CascadeStage::StructuredAddress => self.structured_address(req).await,
                CascadeStage::CodeLookup => self.code_lookup(req).await,
                CascadeStage::SearchScrape => self.search_scrape(req).await,
                CascadeStage::Portal => self.portal(req).await,
                CascadeStage::CityDefault => self.city_default(req).await,
            };
            if let Some(payload) = found {
                let provenance = stage_provenance(stage);
                info!(stage = stage.as_str(), code = %payload.postal_code, "postal code resolved");
                return Some(PostalOutcome {
                    payload,
                    provenance,
                    from_cache: false,
                });
            }
            debug!(stage = stage.as_str(), "stage exhausted");
        }
        None
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn structured_address(&self, req: &PostalRequest) -> Option<PostalPayload> {
        let api = self.sources.postal_api.as_ref()?;
        for variant in address_variants(&req.street) {
            match retry_once("postal-api", || api.lookup(&variant, &req.city, &req.region)).await {
                Ok(entries) => {
                    if let Some(payload) = self.pick(entries, req) {
                        return Some(payload);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "postal API skipped for this record");
                    return None;
                }
            }
        }
        None
    }

    async fn code_lookup(&self, req: &PostalRequest) -> Option<PostalPayload> {
        let api = self.sources.postal_api.as_ref()?;
        let code = normalize_postal_code(req.hint.as_deref()?)?;
        let details = match retry_once("postal-api", || api.lookup_code(&code)).await {
            Ok(details) => details?,
            Err(e) => {
                warn!(error = %e, "code lookup skipped for this record");
                return None;
            }
        };
        if !same_place(&details, req) {
            debug!(%code, city = %details.city, "candidate code belongs to another city");
            return None;
        }
        self.accept(details)
    }

    async fn search_scrape(&self, req: &PostalRequest) -> Option<PostalPayload> {
        if self.sources.search.is_empty() {
            return None;
        }
        let number = req.number.as_deref().unwrap_or_default();
        let mut skipped: HashSet<usize> = HashSet::new();

        for variant in address_variants(&req.street) {
            let query =
                collapse_whitespace(&format!("CEP {variant} {number} {} {}", req.city, req.region));
            let codes = self.search_codes(&query, &req.region, &mut skipped).await;
            if let Some(code) = codes.into_iter().next() {
                return Some(PostalPayload {
                    postal_code: code,
                    city: req.city.clone(),
                    region: req.region.clone(),
                    ..PostalPayload::default()
                });
            }
            if skipped.len() == self.sources.search.len() {
                break;
            }
        }
        None
    }

    async fn portal(&self, req: &PostalRequest) -> Option<PostalPayload> {
        let portal = self.sources.portal.as_ref()?;
        for variant in address_variants(&req.street) {
            let query = collapse_whitespace(&format!("{variant} {} {}", req.city, req.region));
            match retry_once("portal", || portal.search(&query)).await {
                Ok(rows) => {
                    let rows = rows.into_iter().filter(|r| same_place(r, req)).collect();
                    if let Some(payload) = self.pick(rows, req) {
                        return Some(payload);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "postal portal skipped for this record");
                    return None;
                }
            }
        }
        None
    }

    async fn city_default(&self, req: &PostalRequest) -> Option<PostalPayload> {
        let city_key = normalize_key(&req.city);
        let configured = self.config.city_defaults.iter().find_map(|(place, code)| {
            let (city, region) = place.rsplit_once('/')?;
            (normalize_key(city) == city_key && region.trim().eq_ignore_ascii_case(&req.region))
                .then_some(code)
        });

        let code = match configured {
            Some(code) => Some(code.clone()),
            None => {
                let query = format!("CEP geral {} {}", req.city, req.region);
                let mut skipped = HashSet::new();
                let codes = self.search_codes(&query, &req.region, &mut skipped).await;
                // City-wide codes end in -000.
                let generic = codes.iter().find(|c| c.ends_with("-000")).cloned();
                generic.or_else(|| codes.into_iter().next())
            }
        }?;

        self.accept(PostalPayload {
            postal_code: code,
            city: req.city.clone(),
            region: req.region.to_uppercase(),
            ..PostalPayload::default()
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Validated postal codes found in search snippets, most corroborated
    /// first. Backends that stay unavailable after a retry are added to
    /// `skipped` and not called again.
    async fn search_codes(
        &self,
        query: &str,
        region: &str,
        skipped: &mut HashSet<usize>,
    ) -> Vec<String> {
        let live: Vec<(usize, &Arc<dyn SearchBackend>)> = self
            .sources
            .search
            .iter()
            .enumerate()
            .filter(|(i, _)| !skipped.contains(i))
            .collect();

        let limit = self.search_limit;
        let results = join_all(live.iter().map(|(_, backend)| {
            retry_once(backend.name(), move || backend.search(query, limit))
        }))
        .await;

        let mut candidates = Vec::new();
        for ((index, backend), result) in live.iter().zip(results) {
            match result {
                Ok(hits) => {
                    let ctx = ExtractContext {
                        source: Provenance::SearchScrape,
                        origin: backend.name(),
                        region: Some(region),
                    };
                    for hit in hits {
                        let text = format!("{}\n{}", hit.title, hit.snippet);
                        candidates.extend(self.extractor.extract_text(
                            &text,
                            &[FieldKind::PostalCode],
                            &ctx,
                        ));
                    }
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "search backend skipped for this record");
                    skipped.insert(*index);
                }
            }
        }

        rank(&candidates)
            .get(FieldKind::PostalCode)
            .iter()
            .filter(|r| self.validator.check(FieldKind::PostalCode, &r.value).is_ok())
            .map(|r| r.value.clone())
            .collect()
    }

    /// Normalise and validate a payload's postal code.
    fn accept(&self, mut payload: PostalPayload) -> Option<PostalPayload> {
        let code = normalize_postal_code(&payload.postal_code)?;
        if let Err(reason) = self.validator.check(FieldKind::PostalCode, &code) {
            debug!(%code, %reason, "postal code rejected");
            return None;
        }
        payload.postal_code = code;
        Some(payload)
    }

    /// Best entry for the request: house number inside the entry's range,
    /// then matching neighborhood; ties keep directory order.
    fn pick(&self, entries: Vec<PostalPayload>, req: &PostalRequest) -> Option<PostalPayload> {
        let number = req.number.as_deref().map(digits).and_then(|d| d.parse::<u32>().ok());
        let neighborhood = req.neighborhood.as_deref().map(normalize_key);

        let mut best: Option<(i32, PostalPayload)> = None;
        for entry in entries {
            let Some(entry) = self.accept(entry) else {
                continue;
            };
            let mut score = 0;
            if let Some(n) = number {
                score += match number_fits(&entry.complement, n) {
                    Some(true) => 3,
                    Some(false) => -3,
                    None => 0,
                };
            }
            if neighborhood.is_some() && neighborhood == Some(normalize_key(&entry.neighborhood)) {
                score += 2;
            }
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, entry));
            }
        }
        best.map(|(_, entry)| entry)
    }
}

fn stage_provenance(stage: CascadeStage) -> Provenance {
    match stage {
        CascadeStage::Cache | CascadeStage::StructuredAddress => Provenance::StructuredApi,
        CascadeStage::CodeLookup => Provenance::CodeApi,
        CascadeStage::SearchScrape => Provenance::SearchScrape,
        CascadeStage::Portal => Provenance::Portal,
        CascadeStage::CityDefault => Provenance::CityDefault,
    }
}

/// City and region of `payload` agree with the request (blank fields agree).
fn same_place(payload: &PostalPayload, req: &PostalRequest) -> bool {
    let city_ok =
        payload.city.trim().is_empty() || normalize_key(&payload.city) == normalize_key(&req.city);
    let region_ok = payload.region.trim().is_empty()
        || payload.region.trim().eq_ignore_ascii_case(req.region.trim());
    city_ok && region_ok
}

/// Street spellings to try, in order, without duplicates.
pub fn address_variants(street: &str) -> Vec<String> {
    let original = collapse_whitespace(street);
    let expanded = expand_abbreviations(&original);
    let stripped = strip_street_type(&expanded);
    let no_number = strip_number(&expanded);
    let bare = strip_number(&stripped);

    let mut seen = HashSet::new();
    [original, expanded, stripped, no_number, bare]
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| v.chars().count() >= MIN_VARIANT_CHARS)
        .filter(|v| seen.insert(v.to_lowercase()))
        .collect()
}

/// Whether house number `n` falls in a directory range such as
/// `até 610`, `de 612 a 1000 - lado par`, or `de 1001 ao fim`.
///
/// `None` when the complement states no range.
pub fn number_fits(complement: &str, n: u32) -> Option<bool> {
    let text = strip_accents(complement).to_lowercase();
    let mut verdict: Option<bool> = None;
    let mut restrict = |ok: bool| verdict = Some(verdict.unwrap_or(true) && ok);

    if let Some(caps) = BETWEEN_RE.captures(&text) {
        let lo = caps[1].parse::<u32>().unwrap_or(0);
        let hi = caps[2].parse::<u32>().unwrap_or(u32::MAX);
        restrict(n >= lo && n <= hi);
    } else if let Some(caps) = FROM_RE.captures(&text) {
        restrict(n >= caps[1].parse::<u32>().unwrap_or(0));
    } else if let Some(caps) = UP_TO_RE.captures(&text) {
        restrict(n <= caps[1].parse::<u32>().unwrap_or(u32::MAX));
    }
    if text.contains("lado par") {
        restrict(n % 2 == 0);
    } else if text.contains("lado impar") {
        restrict(n % 2 == 1);
    }
    verdict
}
