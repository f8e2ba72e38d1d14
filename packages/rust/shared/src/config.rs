//! Application configuration for recordfill.
//!
//! User config lives at `~/.recordfill/recordfill.toml`.
//! CLI flags override config file values, which override defaults.
//! Every key has a default, so a missing file is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RecordfillError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "recordfill.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".recordfill";

// ---------------------------------------------------------------------------
// Config structs (matching recordfill.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    /// Which source clients are enabled.
    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub cascade: CascadeConfig,

    /// Header names of the input/output table.
    #[serde(default)]
    pub columns: ColumnsConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[endpoints]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Search aggregator (SearXNG-compatible JSON API) base URL.
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Engines requested from the aggregator.
    #[serde(default = "default_search_engines")]
    pub search_engines: String,

    /// Result language requested from the aggregator.
    #[serde(default = "default_search_language")]
    pub search_language: String,

    /// LLM inference endpoint (Ollama-compatible `/api/generate`).
    #[serde(default = "default_llm_url")]
    pub llm_url: String,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    /// Structured postal API base URL.
    #[serde(default = "default_postal_api_url")]
    pub postal_api_url: String,

    /// WebDriver server driving the headless browser.
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Search results page scraped through the browser.
    #[serde(default = "default_browser_search_url")]
    pub browser_search_url: String,

    /// Government postal lookup portal.
    #[serde(default = "default_portal_url")]
    pub portal_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            search_engines: default_search_engines(),
            search_language: default_search_language(),
            llm_url: default_llm_url(),
            llm_model: default_llm_model(),
            postal_api_url: default_postal_api_url(),
            webdriver_url: default_webdriver_url(),
            browser_search_url: default_browser_search_url(),
            portal_url: default_portal_url(),
        }
    }
}

fn default_search_url() -> String {
    "http://localhost:8080".into()
}
fn default_search_engines() -> String {
    "google,bing,duckduckgo".into()
}
fn default_search_language() -> String {
    "pt-BR".into()
}
fn default_llm_url() -> String {
    "http://localhost:11434".into()
}
fn default_llm_model() -> String {
    "llama3.1:8b".into()
}
fn default_postal_api_url() -> String {
    "https://viacep.com.br".into()
}
fn default_webdriver_url() -> String {
    "http://localhost:9515".into()
}
fn default_browser_search_url() -> String {
    "https://www.bing.com/search".into()
}
fn default_portal_url() -> String {
    "https://buscacepinter.correios.com.br/app/endereco/index.php".into()
}

/// `[timeouts]` section, in seconds per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_search_timeout")]
    pub search_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_secs: u64,
    #[serde(default = "default_browser_timeout")]
    pub browser_secs: u64,
    #[serde(default = "default_postal_timeout")]
    pub postal_secs: u64,
    #[serde(default = "default_llm_timeout")]
    pub llm_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            search_secs: default_search_timeout(),
            fetch_secs: default_fetch_timeout(),
            browser_secs: default_browser_timeout(),
            postal_secs: default_postal_timeout(),
            llm_secs: default_llm_timeout(),
        }
    }
}

fn default_search_timeout() -> u64 {
    15
}
fn default_fetch_timeout() -> u64 {
    20
}
fn default_browser_timeout() -> u64 {
    30
}
fn default_postal_timeout() -> u64 {
    10
}
fn default_llm_timeout() -> u64 {
    45
}

/// `[filters]` section: blacklists and reference lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Result URLs on these domains (or their subdomains) are never fetched.
    #[serde(default = "default_domain_blacklist")]
    pub domain_blacklist: Vec<String>,

    /// Email domains rejected by the validator.
    #[serde(default = "default_email_denylist")]
    pub email_denylist: Vec<String>,

    /// Phrases signalling an explanation or refusal rather than data.
    #[serde(default = "default_refusal_terms")]
    pub refusal_terms: Vec<String>,

    /// Lead-in phrases stripped from extracted addresses.
    #[serde(default = "default_boilerplate")]
    pub boilerplate: Vec<String>,

    /// Known categories (specialties) matched in page text.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    /// Resource extensions that are never fetched.
    #[serde(default = "default_skip_extensions")]
    pub skip_extensions: Vec<String>,

    /// Require addresses to start with a street-type word.
    #[serde(default = "default_true")]
    pub require_street_type: bool,

    /// User agents rotated across browser sessions and HTTP fetches.
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            domain_blacklist: default_domain_blacklist(),
            email_denylist: default_email_denylist(),
            refusal_terms: default_refusal_terms(),
            boilerplate: default_boilerplate(),
            categories: default_categories(),
            skip_extensions: default_skip_extensions(),
            require_street_type: true,
            user_agents: default_user_agents(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_domain_blacklist() -> Vec<String> {
    strings(&[
        "google.com",
        "bing.com",
        "yahoo.com",
        "facebook.com",
        "linkedin.com",
        "instagram.com",
        "twitter.com",
        "youtube.com",
    ])
}
fn default_email_denylist() -> Vec<String> {
    strings(&["pixeon.com", "boaconsulta.com", "example.com", "dominio.com"])
}
fn default_refusal_terms() -> Vec<String> {
    strings(&["não posso", "não é possível", "ajudar", "exemplo"])
}
fn default_boilerplate() -> Vec<String> {
    strings(&[
        "Endereço para correspondência",
        "Endereço para atendimento",
        "Endereço para consulta",
        "Endereço comercial",
        "Endereço:",
        "Município/UF",
        "Bairro:",
        "CEP:",
        "Local de atendimento",
    ])
}
fn default_categories() -> Vec<String> {
    strings(&[
        "Acupuntura",
        "Alergia e Imunologia",
        "Anestesiologia",
        "Angiologia",
        "Cardiologia",
        "Cirurgia Geral",
        "Cirurgia Plástica",
        "Clínica Médica",
        "Dermatologia",
        "Endocrinologia",
        "Gastroenterologia",
        "Geriatria",
        "Ginecologia e Obstetrícia",
        "Hematologia",
        "Infectologia",
        "Mastologia",
        "Nefrologia",
        "Neurologia",
        "Nutrologia",
        "Oftalmologia",
        "Oncologia",
        "Ortopedia e Traumatologia",
        "Otorrinolaringologia",
        "Pediatria",
        "Pneumologia",
        "Psiquiatria",
        "Radiologia",
        "Reumatologia",
        "Urologia",
    ])
}
fn default_skip_extensions() -> Vec<String> {
    strings(&[
        ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".zip", ".rar",
    ])
}
fn default_user_agents() -> Vec<String> {
    strings(&[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    ])
}
fn default_true() -> bool {
    true
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Parallel workers, each owning one browser session.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Flush the output every K completed records.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Recycle a worker's browser after N navigations.
    #[serde(default = "default_browser_recycle")]
    pub browser_recycle: usize,

    /// Maximum result URLs fetched per record.
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,

    /// Maximum queries issued per record per round.
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,

    /// Results requested from each search backend.
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            checkpoint_every: default_checkpoint_every(),
            browser_recycle: default_browser_recycle(),
            max_urls: default_max_urls(),
            max_queries: default_max_queries(),
            search_limit: default_search_limit(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_checkpoint_every() -> usize {
    10
}
fn default_browser_recycle() -> usize {
    5
}
fn default_max_urls() -> usize {
    5
}
fn default_max_queries() -> usize {
    3
}
fn default_search_limit() -> usize {
    10
}

/// `[sources]` section: which source clients take part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub search_aggregator: bool,
    #[serde(default = "default_true")]
    pub browser_search: bool,
    /// Render result pages in the browser instead of plain HTTP.
    #[serde(default)]
    pub browser_fetch: bool,
    #[serde(default = "default_true")]
    pub page_fetch: bool,
    #[serde(default = "default_true")]
    pub postal_api: bool,
    #[serde(default = "default_true")]
    pub postal_portal: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            search_aggregator: true,
            browser_search: true,
            browser_fetch: false,
            page_fetch: true,
            postal_api: true,
            postal_portal: true,
        }
    }
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Use the LLM to fill fields regex extraction left empty.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Also ask the LLM to pick among several ranked candidates.
    #[serde(default = "default_true")]
    pub disambiguate: bool,

    /// Page text is truncated to this many characters in prompts.
    #[serde(default = "default_page_budget")]
    pub page_budget: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disambiguate: true,
            page_budget: default_page_budget(),
        }
    }
}

fn default_page_budget() -> usize {
    4000
}

/// One state of the postal-code cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CascadeStage {
    Cache,
    StructuredAddress,
    CodeLookup,
    SearchScrape,
    Portal,
    CityDefault,
}

impl CascadeStage {
    /// All states in cost order.
    pub const ALL: [CascadeStage; 6] = [
        CascadeStage::Cache,
        CascadeStage::StructuredAddress,
        CascadeStage::CodeLookup,
        CascadeStage::SearchScrape,
        CascadeStage::Portal,
        CascadeStage::CityDefault,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::StructuredAddress => "structured-address",
            Self::CodeLookup => "code-lookup",
            Self::SearchScrape => "search-scrape",
            Self::Portal => "portal",
            Self::CityDefault => "city-default",
        }
    }
}

/// `[cascade]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Enabled states. Order is always the cost order of [`CascadeStage::ALL`].
    #[serde(default = "default_stages")]
    pub stages: Vec<CascadeStage>,

    /// Cache exhausted lookups as `not_found`.
    #[serde(default = "default_true")]
    pub cache_negative: bool,

    /// Static city codes keyed by `"<city>/<REGION>"`.
    #[serde(default)]
    pub city_defaults: BTreeMap<String, String>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            cache_negative: true,
            city_defaults: BTreeMap::new(),
        }
    }
}

impl CascadeConfig {
    pub fn is_enabled(&self, stage: CascadeStage) -> bool {
        self.stages.contains(&stage)
    }
}

fn default_stages() -> Vec<CascadeStage> {
    CascadeStage::ALL.to_vec()
}

/// `[columns]` section: header names of the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnsConfig {
    #[serde(default = "col_hash")]
    pub hash: String,
    #[serde(default = "col_identifier")]
    pub identifier: String,
    /// Label prefixed to the identifier in queries (`CRM 12345`).
    #[serde(default = "col_identifier")]
    pub identifier_label: String,
    #[serde(default = "col_region")]
    pub region: String,
    #[serde(default = "col_first_name")]
    pub first_name: String,
    #[serde(default = "col_last_name")]
    pub last_name: String,
    #[serde(default = "col_organization")]
    pub organization: String,
    #[serde(default = "col_category")]
    pub category: String,
    #[serde(default = "col_full_address")]
    pub full_address: String,
    #[serde(default = "col_address")]
    pub address: String,
    #[serde(default = "col_number")]
    pub number: String,
    #[serde(default = "col_complement")]
    pub complement: String,
    #[serde(default = "col_neighborhood")]
    pub neighborhood: String,
    #[serde(default = "col_postal_code")]
    pub postal_code: String,
    #[serde(default = "col_city")]
    pub city: String,
    #[serde(default = "col_state")]
    pub state: String,
    #[serde(default = "col_phone")]
    pub phone: String,
    #[serde(default = "col_mobile")]
    pub mobile: String,
    #[serde(default = "col_email")]
    pub email: String,
    #[serde(default = "col_status")]
    pub status: String,
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            hash: col_hash(),
            identifier: col_identifier(),
            identifier_label: col_identifier(),
            region: col_region(),
            first_name: col_first_name(),
            last_name: col_last_name(),
            organization: col_organization(),
            category: col_category(),
            full_address: col_full_address(),
            address: col_address(),
            number: col_number(),
            complement: col_complement(),
            neighborhood: col_neighborhood(),
            postal_code: col_postal_code(),
            city: col_city(),
            state: col_state(),
            phone: col_phone(),
            mobile: col_mobile(),
            email: col_email(),
            status: col_status(),
        }
    }
}

fn col_hash() -> String {
    "Hash".into()
}
fn col_identifier() -> String {
    "CRM".into()
}
fn col_region() -> String {
    "UF".into()
}
fn col_first_name() -> String {
    "Firstname".into()
}
fn col_last_name() -> String {
    "LastName".into()
}
fn col_organization() -> String {
    "Empresa".into()
}
fn col_category() -> String {
    "Medical specialty".into()
}
fn col_full_address() -> String {
    "Endereco Completo A1".into()
}
fn col_address() -> String {
    "Address A1".into()
}
fn col_number() -> String {
    "Numero A1".into()
}
fn col_complement() -> String {
    "Complement A1".into()
}
fn col_neighborhood() -> String {
    "Bairro A1".into()
}
fn col_postal_code() -> String {
    "postal code A1".into()
}
fn col_city() -> String {
    "City A1".into()
}
fn col_state() -> String {
    "State A1".into()
}
fn col_phone() -> String {
    "Phone A1".into()
}
fn col_mobile() -> String {
    "Cell phone A1".into()
}
fn col_email() -> String {
    "E-mail A1".into()
}
fn col_status() -> String {
    "STATUS".into()
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Postal cache file. A leading `~/` expands to the home directory.
    #[serde(default = "default_cache_path")]
    pub path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

fn default_cache_path() -> String {
    "~/.recordfill/postal_cache.json".into()
}

// ---------------------------------------------------------------------------
// Resolver config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime resolution settings, merged from the config file and CLI flags.
/// Passed explicitly into the orchestrator; nothing reads process globals.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub workers: usize,
    pub checkpoint_every: usize,
    pub browser_recycle: usize,
    pub max_urls: usize,
    pub max_queries: usize,
    pub search_limit: usize,
    /// Search backends are queried at all.
    pub use_search: bool,
    /// Browser-backed clients take part.
    pub use_browser: bool,
    /// Render result pages in the browser.
    pub browser_fetch: bool,
    pub use_llm: bool,
    pub llm_disambiguate: bool,
    pub llm_page_budget: usize,
    pub identifier_label: String,
    pub filters: FiltersConfig,
    pub cascade: CascadeConfig,
}

impl From<&AppConfig> for ResolverConfig {
    fn from(config: &AppConfig) -> Self {
        let mut cascade = config.cascade.clone();
        if !config.sources.postal_api {
            cascade
                .stages
                .retain(|s| !matches!(s, CascadeStage::StructuredAddress | CascadeStage::CodeLookup));
        }
        if !config.sources.postal_portal {
            cascade.stages.retain(|s| *s != CascadeStage::Portal);
        }
        Self {
            workers: config.batch.workers.max(1),
            checkpoint_every: config.batch.checkpoint_every.max(1),
            browser_recycle: config.batch.browser_recycle.max(1),
            max_urls: config.batch.max_urls,
            max_queries: config.batch.max_queries.max(1),
            search_limit: config.batch.search_limit,
            use_search: config.sources.search_aggregator || config.sources.browser_search,
            use_browser: config.sources.browser_search
                || config.sources.browser_fetch
                || config.sources.postal_portal,
            browser_fetch: config.sources.browser_fetch,
            use_llm: config.llm.enabled,
            llm_disambiguate: config.llm.disambiguate,
            llm_page_budget: config.llm.page_budget,
            identifier_label: config.columns.identifier_label.clone(),
            filters: config.filters.clone(),
            cascade,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.recordfill/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RecordfillError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.recordfill/recordfill.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RecordfillError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        RecordfillError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject settings that would make a run meaningless.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.batch.workers == 0 {
        return Err(RecordfillError::config("batch.workers must be at least 1"));
    }
    if config.batch.checkpoint_every == 0 {
        return Err(RecordfillError::config(
            "batch.checkpoint_every must be at least 1",
        ));
    }
    for (key, code) in &config.cascade.city_defaults {
        if !key.contains('/') {
            return Err(RecordfillError::config(format!(
                "cascade.city_defaults key {key:?} must look like \"<city>/<REGION>\""
            )));
        }
        if crate::text::digits(code).len() != 8 {
            return Err(RecordfillError::config(format!(
                "cascade.city_defaults[{key:?}] = {code:?} is not an 8-digit postal code"
            )));
        }
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RecordfillError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RecordfillError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RecordfillError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| RecordfillError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
