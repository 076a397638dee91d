//! Source-specific extraction for Transferlens: stats-site scraping and the
//! news-feed adapter, behind the collaborator traits the pipeline consumes.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};
use thiserror::Error;
use tl_core::PlayerProfile;
use tl_storage::{FetchError, HttpFetcher};
use tracing::warn;

pub const CRATE_NAME: &str = "tl-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// A crawlable parent entity: team display name plus its squad page URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamRef {
    pub name: String,
    pub squad_url: String,
}

/// Enumerates teams and squads and resolves one player profile per call.
/// Every method is one or more blocking remote round trips.
#[async_trait]
pub trait SquadSource: Send + Sync {
    async fn fetch_teams(&self) -> Result<Vec<TeamRef>, AdapterError>;
    /// Profile URLs for one squad, deduplicated, discovery order preserved.
    async fn fetch_players(&self, squad_url: &str) -> Result<Vec<String>, AdapterError>;
    async fn fetch_player(&self, profile_url: &str) -> Result<PlayerProfile, AdapterError>;
}

/// Resolves a player by display name via the site's quick search.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn lookup(&self, player_name: &str) -> Result<PlayerProfile, AdapterError>;
}

/// Recent news summaries for a player, capped, stripped to plain text.
#[async_trait]
pub trait NewsFeed: Send + Sync {
    async fn recent_summaries(
        &self,
        player_name: &str,
        cap: usize,
    ) -> Result<Vec<String>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct StatsSiteConfig {
    pub base_url: String,
    /// Competition landing page, relative to `base_url`.
    pub start_path: String,
    /// Competition code and season used on the per-player performance page.
    pub competition: String,
    pub season: String,
}

impl Default for StatsSiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.transfermarkt.com".to_string(),
            start_path: "/laliga/startseite/wettbewerb/ES1".to_string(),
            competition: "ES1".to_string(),
            season: "2023".to_string(),
        }
    }
}

impl StatsSiteConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("TL_SITE_BASE_URL").unwrap_or(defaults.base_url),
            start_path: std::env::var("TL_SITE_START_PATH").unwrap_or(defaults.start_path),
            competition: std::env::var("TL_SITE_COMPETITION").unwrap_or(defaults.competition),
            season: std::env::var("TL_SITE_SEASON").unwrap_or(defaults.season),
        }
    }
}

/// The stats-site crawl adapter. Parsing is split from fetching so the
/// selector logic stays testable against static HTML.
pub struct StatsSiteSource {
    http: Arc<HttpFetcher>,
    config: StatsSiteConfig,
}

impl StatsSiteSource {
    pub fn new(http: Arc<HttpFetcher>, config: StatsSiteConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl SquadSource for StatsSiteSource {
    async fn fetch_teams(&self) -> Result<Vec<TeamRef>, AdapterError> {
        let url = format!("{}{}", self.config.base_url, self.config.start_path);
        let html = self.http.fetch_text(&url).await?;
        parse_team_links(&html, &self.config.base_url)
    }

    async fn fetch_players(&self, squad_url: &str) -> Result<Vec<String>, AdapterError> {
        let html = self.http.fetch_text(squad_url).await?;
        parse_player_links(&html, &self.config.base_url)
    }

    async fn fetch_player(&self, profile_url: &str) -> Result<PlayerProfile, AdapterError> {
        let html = self.http.fetch_text(profile_url).await?;
        let mut profile = parse_player_profile(&html)?;

        // Best-effort enrichment: the performance page is slow and flaky,
        // and a player without it still makes a usable row of zeros.
        let perf_url =
            performance_url(profile_url, &self.config.competition, &self.config.season);
        match self.http.fetch_text(&perf_url).await {
            Ok(perf_html) => {
                let (appearances, goals, assists) = parse_performance_totals(&perf_html)?;
                profile.appearances = appearances;
                profile.goals = goals;
                profile.assists = assists;
            }
            Err(err) => {
                warn!(url = perf_url.as_str(), error = %err, "performance page fetch failed; keeping zeros");
            }
        }

        Ok(profile)
    }
}

/// Quick-search lookup for the live scorer. Search hit → profile page parse;
/// the performance page is skipped here, matching the training encoding of
/// unknown counts as zeros.
pub struct StatsSiteProfileLookup {
    http: Arc<HttpFetcher>,
    config: StatsSiteConfig,
}

impl StatsSiteProfileLookup {
    pub fn new(http: Arc<HttpFetcher>, config: StatsSiteConfig) -> Self {
        Self { http, config }
    }

    fn search_url(&self, player_name: &str) -> Result<Url, AdapterError> {
        let mut url = Url::parse(&format!(
            "{}/schnellsuche/ergebnis/schnellsuche",
            self.config.base_url
        ))
        .map_err(|e| AdapterError::Message(format!("bad search url: {e}")))?;
        url.query_pairs_mut().append_pair("query", player_name);
        Ok(url)
    }
}

#[async_trait]
impl ProfileLookup for StatsSiteProfileLookup {
    async fn lookup(&self, player_name: &str) -> Result<PlayerProfile, AdapterError> {
        let search_url = self.search_url(player_name)?;
        let search_html = self.http.fetch_text(search_url.as_str()).await?;
        let Some(profile_path) = parse_search_result_href(&search_html)? else {
            return Err(AdapterError::Message(format!(
                "no results found for '{player_name}'"
            )));
        };

        let profile_url = format!("{}{}", self.config.base_url, profile_path);
        let html = self.http.fetch_text(&profile_url).await?;
        let mut profile = parse_player_profile(&html)?;
        profile.name = Some(player_name.to_string());
        Ok(profile)
    }
}

/// Google-News-style RSS search feed.
pub struct GoogleNewsFeed {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl GoogleNewsFeed {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, "https://news.google.com")
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl NewsFeed for GoogleNewsFeed {
    async fn recent_summaries(
        &self,
        player_name: &str,
        cap: usize,
    ) -> Result<Vec<String>, AdapterError> {
        let mut url = Url::parse(&format!("{}/rss/search", self.base_url))
            .map_err(|e| AdapterError::Message(format!("bad feed url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("q", &format!("{player_name} transfer rumors"))
            .append_pair("hl", "en-US")
            .append_pair("gl", "US")
            .append_pair("ceid", "US:en");

        let feed_xml = self.http.fetch_text(url.as_str()).await?;
        parse_feed_summaries(&feed_xml, cap)
    }
}

fn selector(input: &str) -> Result<Selector, AdapterError> {
    Selector::parse(input).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, sel: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(sel)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, sel: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(sel)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

/// First run of digits, dots and commas in a display string — the numeric
/// part of e.g. "€25.00m Last update: Jun 14, 2024".
fn first_number_run(text: &str) -> Option<String> {
    let mut run = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            run.push(ch);
        } else if !run.is_empty() {
            break;
        }
    }
    text_or_none(run)
}

/// The "(27)" part of "Jun 3, 1997 (27)".
fn parenthesized_number(text: &str) -> Option<u32> {
    let start = text.find('(')?;
    let rest = &text[start + 1..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

/// Teams on the competition landing page.
pub fn parse_team_links(html: &str, base_url: &str) -> Result<Vec<TeamRef>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = selector("td.hauptlink.no-border-links a")?;

    let mut out = Vec::new();
    for node in document.select(&sel) {
        let Some(href) = node.value().attr("href") else {
            continue;
        };
        let name = node
            .value()
            .attr("title")
            .and_then(|t| text_or_none(t.to_string()))
            .or_else(|| text_or_none(node.text().collect::<String>()));
        let Some(name) = name else {
            continue;
        };
        out.push(TeamRef {
            name,
            squad_url: format!("{base_url}{href}"),
        });
    }
    Ok(out)
}

/// Player profile URLs on a squad page, deduplicated, first-seen order.
pub fn parse_player_links(html: &str, base_url: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = selector("table.inline-table td.hauptlink a")?;

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for node in document.select(&sel) {
        let Some(href) = node.value().attr("href") else {
            continue;
        };
        if !href.contains("/profil/spieler") {
            continue;
        }
        let url = format!("{base_url}{href}");
        if seen.insert(url.clone()) {
            out.push(url);
        }
    }
    Ok(out)
}

/// Profile-page parse. Every field the page may omit stays an Option; the
/// record constructor owns the defaulting.
pub fn parse_player_profile(html: &str) -> Result<PlayerProfile, AdapterError> {
    let document = Html::parse_document(html);

    let name = select_first_text(&document, "header.data-header strong")?;
    let mut market_value = select_first_text(&document, "a.data-header__market-value-wrapper")?
        .as_deref()
        .and_then(first_number_run);

    let mut profile = PlayerProfile {
        name,
        ..Default::default()
    };

    let spans = select_all_texts(
        &document,
        "div.spielerdatenundfakten div.info-table span.info-table__content",
    )?;
    for pair in spans.chunks(2) {
        let [label, value] = pair else {
            continue;
        };
        match label.trim().trim_end_matches(':') {
            "Date of birth/Age" => profile.age = parenthesized_number(value),
            "Position" => profile.position = Some(value.clone()),
            "Market value" => market_value = first_number_run(value).or(market_value),
            "Joined" => profile.joined = Some(value.clone()),
            "Contract expires" => profile.contract_expires = Some(value.clone()),
            _ => {}
        }
    }

    profile.market_value = market_value;
    Ok(profile)
}

/// Season totals from the performance page footer: appearances, goals,
/// assists. Non-numeric cells count as zero.
pub fn parse_performance_totals(html: &str) -> Result<(u32, u32, u32), AdapterError> {
    let document = Html::parse_document(html);
    let cells = select_all_texts(&document, "table.items tfoot tr td.zentriert")?;
    let number = |idx: usize| -> u32 {
        cells
            .get(idx)
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0)
    };
    Ok((number(0), number(1), number(2)))
}

/// First quick-search hit's profile path.
pub fn parse_search_result_href(html: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = selector("table.items tbody tr td:nth-of-type(2) a")?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr("href"))
        .map(ToString::to_string))
}

/// Profile URL → per-competition performance detail URL.
pub fn performance_url(profile_url: &str, competition: &str, season: &str) -> String {
    let detail = profile_url.replace("/profil/", "/leistungsdatendetails/");
    format!("{detail}/wettbewerb/{competition}/saison/{season}")
}

/// RSS search results → plain-text summaries. Each item's description is
/// itself HTML; it gets parsed a second time and reduced to text.
pub fn parse_feed_summaries(feed_xml: &str, cap: usize) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(feed_xml);
    let sel = selector("item description")?;

    let mut out = Vec::new();
    for node in document.select(&sel) {
        if out.len() >= cap {
            break;
        }
        let raw = node.text().collect::<String>();
        let fragment = Html::parse_fragment(&raw);
        let text = fragment
            .root_element()
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !text.is_empty() {
            out.push(text);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEAM_TABLE: &str = r#"
        <table>
          <tr><td class="hauptlink no-border-links">
            <a href="/real-madrid/startseite/verein/418" title="Real Madrid">Real Madrid</a>
          </td></tr>
          <tr><td class="hauptlink no-border-links">
            <a href="/fc-barcelona/startseite/verein/131">FC Barcelona</a>
          </td></tr>
        </table>"#;

    #[test]
    fn team_links_prefer_the_title_attribute() {
        let teams = parse_team_links(TEAM_TABLE, "https://example.com").expect("parse");
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].name, "Real Madrid");
        assert_eq!(
            teams[0].squad_url,
            "https://example.com/real-madrid/startseite/verein/418"
        );
        assert_eq!(teams[1].name, "FC Barcelona");
    }

    #[test]
    fn player_links_filter_and_dedup_preserving_order() {
        let html = r#"
            <table class="inline-table"><tr>
              <td class="hauptlink"><a href="/a/profil/spieler/1">A</a></td>
              <td class="hauptlink"><a href="/b/profil/spieler/2">B</a></td>
              <td class="hauptlink"><a href="/a/profil/spieler/1">A again</a></td>
              <td class="hauptlink"><a href="/club/startseite/verein/9">club</a></td>
            </tr></table>"#;
        let links = parse_player_links(html, "https://example.com").expect("parse");
        assert_eq!(
            links,
            vec![
                "https://example.com/a/profil/spieler/1",
                "https://example.com/b/profil/spieler/2",
            ]
        );
    }

    #[test]
    fn profile_parse_extracts_the_info_table_pairs() {
        let html = r#"
            <header class="data-header"><strong>Vini Jr.</strong></header>
            <a class="data-header__market-value-wrapper">
              €150.00m
              <p class="data-header__last-update">Last update: Jun 14, 2024</p>
            </a>
            <div class="spielerdatenundfakten"><div class="info-table">
              <span class="info-table__content">Date of birth/Age:</span>
              <span class="info-table__content">Jul 12, 2000 (24)</span>
              <span class="info-table__content">Position:</span>
              <span class="info-table__content">Attack - Left Winger</span>
              <span class="info-table__content">Joined:</span>
              <span class="info-table__content">Jul 12, 2018</span>
              <span class="info-table__content">Contract expires:</span>
              <span class="info-table__content">Jun 30, 2027</span>
            </div></div>"#;
        let profile = parse_player_profile(html).expect("parse");
        assert_eq!(profile.name.as_deref(), Some("Vini Jr."));
        assert_eq!(profile.age, Some(24));
        assert_eq!(profile.position.as_deref(), Some("Attack - Left Winger"));
        assert_eq!(profile.market_value.as_deref(), Some("150.00"));
        assert_eq!(profile.joined.as_deref(), Some("Jul 12, 2018"));
        assert_eq!(profile.contract_expires.as_deref(), Some("Jun 30, 2027"));
    }

    #[test]
    fn profile_parse_tolerates_a_sparse_page() {
        let profile = parse_player_profile("<html><body></body></html>").expect("parse");
        assert_eq!(profile, PlayerProfile::default());
    }

    #[test]
    fn performance_totals_default_non_numeric_cells_to_zero() {
        let html = r#"
            <table class="items"><tfoot><tr>
              <td class="zentriert">31</td>
              <td class="zentriert">15</td>
              <td class="zentriert">-</td>
            </tr></tfoot></table>"#;
        assert_eq!(parse_performance_totals(html).expect("parse"), (31, 15, 0));
        assert_eq!(parse_performance_totals("<p/>").expect("parse"), (0, 0, 0));
    }

    #[test]
    fn performance_url_swaps_the_path_segment() {
        assert_eq!(
            performance_url(
                "https://example.com/vini/profil/spieler/371998",
                "ES1",
                "2023"
            ),
            "https://example.com/vini/leistungsdatendetails/spieler/371998/wettbewerb/ES1/saison/2023"
        );
    }

    #[test]
    fn search_takes_the_first_result() {
        let html = r#"
            <table class="items"><tbody>
              <tr><td>img</td><td><a href="/vini/profil/spieler/371998">Vini Jr.</a></td></tr>
              <tr><td>img</td><td><a href="/other/profil/spieler/5">Other</a></td></tr>
            </tbody></table>"#;
        assert_eq!(
            parse_search_result_href(html).expect("parse").as_deref(),
            Some("/vini/profil/spieler/371998")
        );
        assert_eq!(parse_search_result_href("<p/>").expect("parse"), None);
    }

    #[test]
    fn feed_summaries_strip_markup_and_honor_the_cap() {
        let xml = r#"<rss><channel>
            <item><description>&lt;a href="x"&gt;Club agrees fee&lt;/a&gt; for   striker</description></item>
            <item><description>Second  item</description></item>
            <item><description>Third item</description></item>
        </channel></rss>"#;
        let summaries = parse_feed_summaries(xml, 2).expect("parse");
        assert_eq!(
            summaries,
            vec!["Club agrees fee for striker", "Second item"]
        );
    }
}
