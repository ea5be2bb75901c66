use std::fmt;
use std::path::Path;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};
use thirtyfour::By;

use crate::crawler::error::CrawlError;
use crate::crawler::path::NavigationPath;

/// A per-site crawl configuration: one or more journeys, each a linear list
/// of navigation steps. Sitemaps are external documents (JSON or YAML) under
/// a `crawler_config.journeys` wrapper and are decoded into closed types
/// once, at load time. A malformed sitemap fails the run before any browser
/// or database work happens.
#[derive(Debug, Clone)]
pub struct Sitemap {
    pub journeys: Vec<Journey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Journey {
    pub journey_id: String,
    pub description: String,
    pub steps: Vec<Step>,
}

impl Journey {
    /// The breadcrumb every record from this journey starts from: `Home`,
    /// then the description of each top-level click marked as a breadcrumb,
    /// then the journey id.
    pub fn initial_path(&self) -> NavigationPath {
        let mut segments = vec!["Home".to_string()];
        for step in &self.steps {
            if let Step::Click(click) = step {
                if click.is_breadcrumb {
                    if let Some(description) = &click.description {
                        segments.push(description.clone());
                    }
                }
            }
        }
        segments.push(self.journey_id.clone());
        NavigationPath::new(segments)
    }

    pub fn has_numeric_pagination(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step, Step::NumericPaginationLoop(_)))
    }
}

/// How to find an element on the page.
#[derive(Debug, Clone, Deserialize)]
pub struct Locator {
    #[serde(rename = "type", default)]
    pub kind: LocatorKind,
    pub value: String,
}

impl Locator {
    pub fn xpath(value: impl Into<String>) -> Self {
        Self {
            kind: LocatorKind::Xpath,
            value: value.into(),
        }
    }

    pub fn by(&self) -> By {
        match self.kind {
            LocatorKind::Xpath => By::XPath(self.value.as_str()),
            LocatorKind::Css => By::Css(self.value.as_str()),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LocatorKind::Xpath => write!(f, "xpath:{}", self.value),
            LocatorKind::Css => write!(f, "css:{}", self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorKind {
    #[default]
    Xpath,
    Css,
}

/// What to extract from a matched cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractKind {
    #[default]
    Text,
    Href,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    pub locator: Locator,
    #[serde(default)]
    pub kind: ExtractKind,
}

/// Row-and-columns extraction layout for one results listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapingConfig {
    pub row: Locator,
    pub columns: Vec<ColumnConfig>,
    /// Column whose value is the record's unique key within its dedup scope.
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

fn default_key_column() -> String {
    "link".to_string()
}

fn default_segment_prefix() -> String {
    "Letter-".to_string()
}

fn default_disabled_class() -> String {
    "disabled".to_string()
}

/// One navigation action. Closed set, decoded from the sitemap's `action`
/// field; an unrecognized action becomes `Unknown` so newer sitemaps keep
/// working against older binaries (the dispatcher logs and skips it).
#[derive(Debug, Clone)]
pub enum Step {
    Click(ClickStep),
    AlphabetLoop(AlphabetLoopStep),
    NextButtonPaginationLoop(NextButtonLoopStep),
    NumericPaginationLoop(NumericLoopStep),
    UrlLoop(UrlLoopStep),
    ProcessResults(ProcessResultsStep),
    Unknown {
        action: String,
        description: Option<String>,
    },
}

impl Step {
    /// Human-readable label for log lines.
    pub fn label(&self) -> &str {
        let description = match self {
            Step::Click(s) => &s.description,
            Step::AlphabetLoop(s) => &s.description,
            Step::NextButtonPaginationLoop(s) => &s.description,
            Step::NumericPaginationLoop(s) => &s.description,
            Step::UrlLoop(s) => &s.description,
            Step::ProcessResults(s) => &s.description,
            Step::Unknown { description, .. } => description,
        };
        description.as_deref().unwrap_or(self.action_name())
    }

    pub fn action_name(&self) -> &str {
        match self {
            Step::Click(_) => "click",
            Step::AlphabetLoop(_) => "alphabet_loop",
            Step::NextButtonPaginationLoop(_) => "next_button_pagination_loop",
            Step::NumericPaginationLoop(_) => "numeric_pagination_loop",
            Step::UrlLoop(_) => "url_loop",
            Step::ProcessResults(_) => "process_results",
            Step::Unknown { action, .. } => action,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickStep {
    #[serde(default)]
    pub description: Option<String>,
    pub target: Locator,
    /// Click via JavaScript instead of the WebDriver click command.
    #[serde(default)]
    pub force_js: bool,
    /// Breadcrumb clicks contribute their description to the journey's
    /// navigation path.
    #[serde(default)]
    pub is_breadcrumb: bool,
}

/// Iterate an A-Z (or similar) index: click each index link in turn and run
/// the nested steps on the filtered listing.
#[derive(Debug, Clone, Deserialize)]
pub struct AlphabetLoopStep {
    #[serde(default)]
    pub description: Option<String>,
    /// Matches the full set of index links.
    pub target: Locator,
    /// When set, clicked after each index to return to the listing page.
    /// A nested failure then halts the journey instead of skipping ahead,
    /// since the crawler can no longer trust where it is.
    #[serde(default)]
    pub breadcrumb: Option<Locator>,
    /// Click index links via JavaScript (some sites swallow native clicks
    /// on these controls).
    #[serde(default)]
    pub use_js_click: bool,
    /// Remember the last fully processed index within this journey's retry
    /// loop, so a retried attempt skips straight past completed letters.
    #[serde(default)]
    pub track_resume_index: bool,
    /// Collect all index hrefs up front and navigate to each directly
    /// instead of clicking, for sites that rebuild the index DOM on every
    /// selection.
    #[serde(default)]
    pub visit_by_href: bool,
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,
    pub loop_steps: Vec<Step>,
}

/// Scrape-then-advance over a "next" control until it disappears or is
/// marked disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct NextButtonLoopStep {
    #[serde(default)]
    pub description: Option<String>,
    pub next_button: Locator,
    /// CSS class that marks the control inert on the final page.
    #[serde(default = "default_disabled_class")]
    pub disabled_class: String,
    /// Where the disabled class appears: on the control itself or on its
    /// parent element (common with `<li><a>` pagination markup).
    #[serde(default)]
    pub disabled_check_on: DisabledCheckOn,
    pub loop_steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisabledCheckOn {
    Control,
    #[default]
    Parent,
}

/// Numbered-page pagination. Supports resuming mid-listing: intermediate
/// pages are fast-forwarded through by clicking their page-number controls
/// without scraping.
#[derive(Debug, Clone, Deserialize)]
pub struct NumericLoopStep {
    #[serde(default)]
    pub description: Option<String>,
    /// XPath template for the control of a specific page; must contain
    /// `{page}`.
    pub page_number_template: String,
    /// Clicked when the numbered control is not in the visible window.
    pub next_button_fallback: Locator,
    pub loop_steps: Vec<Step>,
}

impl NumericLoopStep {
    pub fn page_locator(&self, page: u32) -> Locator {
        Locator::xpath(self.page_number_template.replace("{page}", &page.to_string()))
    }
}

/// Collect a set of section URLs up front and visit each directly.
#[derive(Debug, Clone, Deserialize)]
pub struct UrlLoopStep {
    #[serde(default)]
    pub description: Option<String>,
    pub target: Locator,
    /// Query parameter whose value labels the path segment for each URL.
    #[serde(default = "default_label_param")]
    pub label_param: String,
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,
    pub loop_steps: Vec<Step>,
}

fn default_label_param() -> String {
    "key".to_string()
}

/// Scrape the current listing and persist the new records.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessResultsStep {
    #[serde(default)]
    pub description: Option<String>,
    /// Waited on before the rows, for listings rendered inside a container
    /// that appears late.
    #[serde(default)]
    pub container: Option<Locator>,
    pub scraping_config: ScrapingConfig,
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let action = value
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| D::Error::custom("step is missing an 'action' field"))?
            .to_string();

        let decoded = match action.as_str() {
            "click" => serde_json::from_value(value).map(Step::Click),
            "alphabet_loop" => serde_json::from_value(value).map(Step::AlphabetLoop),
            "next_button_pagination_loop" => {
                serde_json::from_value(value).map(Step::NextButtonPaginationLoop)
            }
            "numeric_pagination_loop" => {
                serde_json::from_value(value).map(Step::NumericPaginationLoop)
            }
            "url_loop" => serde_json::from_value(value).map(Step::UrlLoop),
            "process_results" => serde_json::from_value(value).map(Step::ProcessResults),
            _ => {
                let description = value
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                return Ok(Step::Unknown {
                    action,
                    description,
                });
            }
        };

        decoded.map_err(|e| D::Error::custom(format!("invalid '{}' step: {}", action, e)))
    }
}

#[derive(Debug, Deserialize)]
struct SitemapFile {
    crawler_config: CrawlerConfigSection,
}

#[derive(Debug, Deserialize)]
struct CrawlerConfigSection {
    journeys: Vec<Journey>,
}

impl Sitemap {
    /// Loads and validates a sitemap file. The format is chosen by
    /// extension: `.yaml`/`.yml` parse as YAML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self, CrawlError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CrawlError::Config(format!("could not read sitemap {}: {}", path.display(), e))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let file: SitemapFile = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                CrawlError::Config(format!("invalid sitemap {}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| {
                CrawlError::Config(format!("invalid sitemap {}: {}", path.display(), e))
            })?
        };

        let sitemap = Sitemap {
            journeys: file.crawler_config.journeys,
        };
        sitemap.validate()?;
        Ok(sitemap)
    }

    fn validate(&self) -> Result<(), CrawlError> {
        if self.journeys.is_empty() {
            return Err(CrawlError::Config(
                "sitemap defines no journeys".to_string(),
            ));
        }
        for journey in &self.journeys {
            if journey.steps.is_empty() {
                return Err(CrawlError::Config(format!(
                    "journey '{}' has no steps",
                    journey.journey_id
                )));
            }
            validate_steps(&journey.journey_id, &journey.steps)?;
        }
        Ok(())
    }
}

fn validate_steps(journey_id: &str, steps: &[Step]) -> Result<(), CrawlError> {
    for step in steps {
        match step {
            Step::AlphabetLoop(s) => {
                require_loop_steps(journey_id, step, &s.loop_steps)?;
                validate_steps(journey_id, &s.loop_steps)?;
            }
            Step::NextButtonPaginationLoop(s) => {
                require_loop_steps(journey_id, step, &s.loop_steps)?;
                validate_steps(journey_id, &s.loop_steps)?;
            }
            Step::NumericPaginationLoop(s) => {
                if !s.page_number_template.contains("{page}") {
                    return Err(CrawlError::Config(format!(
                        "journey '{}': page_number_template '{}' has no {{page}} placeholder",
                        journey_id, s.page_number_template
                    )));
                }
                require_loop_steps(journey_id, step, &s.loop_steps)?;
                validate_steps(journey_id, &s.loop_steps)?;
            }
            Step::UrlLoop(s) => {
                require_loop_steps(journey_id, step, &s.loop_steps)?;
                validate_steps(journey_id, &s.loop_steps)?;
            }
            Step::ProcessResults(s) => {
                if s.scraping_config.columns.is_empty() {
                    return Err(CrawlError::Config(format!(
                        "journey '{}': process_results step defines no columns",
                        journey_id
                    )));
                }
            }
            Step::Click(_) | Step::Unknown { .. } => {}
        }
    }
    Ok(())
}

fn require_loop_steps(journey_id: &str, step: &Step, loop_steps: &[Step]) -> Result<(), CrawlError> {
    if loop_steps.is_empty() {
        return Err(CrawlError::Config(format!(
            "journey '{}': {} step has an empty loop_steps list",
            journey_id,
            step.action_name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_steps(json: &str) -> Vec<Step> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn decodes_click_step_with_defaults() {
        let steps = decode_steps(
            r#"[{
                "action": "click",
                "description": "Acts in force",
                "target": {"type": "xpath", "value": "//a[text()='In force']"}
            }]"#,
        );
        match &steps[0] {
            Step::Click(s) => {
                assert_eq!(s.description.as_deref(), Some("Acts in force"));
                assert!(!s.force_js);
                assert!(!s.is_breadcrumb);
                assert_eq!(s.target.kind, LocatorKind::Xpath);
            }
            other => panic!("expected click step, got {:?}", other),
        }
    }

    #[test]
    fn decodes_nested_loop_steps() {
        let steps = decode_steps(
            r#"[{
                "action": "alphabet_loop",
                "target": {"value": "//ul[@class='index']//a"},
                "use_js_click": true,
                "track_resume_index": true,
                "loop_steps": [
                    {
                        "action": "process_results",
                        "scraping_config": {
                            "row": {"value": "//table//tr"},
                            "columns": [
                                {"name": "title", "locator": {"value": "./td[1]/a"}},
                                {"name": "link", "locator": {"value": "./td[1]/a"}, "kind": "href"}
                            ]
                        }
                    }
                ]
            }]"#,
        );
        match &steps[0] {
            Step::AlphabetLoop(s) => {
                assert!(s.use_js_click);
                assert!(s.track_resume_index);
                assert!(!s.visit_by_href);
                assert_eq!(s.segment_prefix, "Letter-");
                assert_eq!(s.loop_steps.len(), 1);
                match &s.loop_steps[0] {
                    Step::ProcessResults(p) => {
                        assert_eq!(p.scraping_config.key_column, "link");
                        assert_eq!(p.scraping_config.columns[1].kind, ExtractKind::Href);
                    }
                    other => panic!("expected process_results, got {:?}", other),
                }
            }
            other => panic!("expected alphabet_loop, got {:?}", other),
        }
    }

    #[test]
    fn unknown_action_decodes_to_unknown_variant() {
        let steps = decode_steps(
            r#"[{"action": "solve_captcha", "description": "future feature"}]"#,
        );
        match &steps[0] {
            Step::Unknown {
                action,
                description,
            } => {
                assert_eq!(action, "solve_captcha");
                assert_eq!(description.as_deref(), Some("future feature"));
            }
            other => panic!("expected unknown step, got {:?}", other),
        }
    }

    #[test]
    fn step_without_action_is_rejected() {
        let result: Result<Vec<Step>, _> =
            serde_json::from_str(r#"[{"description": "no action here"}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn numeric_template_without_placeholder_fails_validation() {
        let journey = Journey {
            journey_id: "vic-acts".to_string(),
            description: "test".to_string(),
            steps: decode_steps(
                r#"[{
                    "action": "numeric_pagination_loop",
                    "page_number_template": "//a[text()='2']",
                    "next_button_fallback": {"value": "//a[@title='Next']"},
                    "loop_steps": [{"action": "click", "target": {"value": "//a"}}]
                }]"#,
            ),
        };
        let sitemap = Sitemap {
            journeys: vec![journey],
        };
        let err = sitemap.validate().unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));
        assert!(err.to_string().contains("{page}"));
    }

    #[test]
    fn empty_loop_steps_fail_validation() {
        let journey = Journey {
            journey_id: "nsw-acts".to_string(),
            description: "test".to_string(),
            steps: decode_steps(
                r#"[{
                    "action": "url_loop",
                    "target": {"value": "//div[@id='index']//a"},
                    "loop_steps": []
                }]"#,
            ),
        };
        let sitemap = Sitemap {
            journeys: vec![journey],
        };
        assert!(sitemap.validate().is_err());
    }

    #[test]
    fn initial_path_includes_breadcrumb_clicks_and_journey_id() {
        let journey: Journey = serde_json::from_str(
            r#"{
                "journey_id": "vic-acts-in-force",
                "description": "Acts currently in force",
                "steps": [
                    {"action": "click", "description": "Acts in force",
                     "target": {"value": "//a[1]"}, "is_breadcrumb": true},
                    {"action": "click", "description": "Dismiss banner",
                     "target": {"value": "//button"}},
                    {"action": "process_results", "scraping_config": {
                        "row": {"value": "//tr"},
                        "columns": [{"name": "title", "locator": {"value": "."}}]
                    }}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            journey.initial_path().render(),
            "Home/Acts in force/vic-acts-in-force"
        );
    }

    #[test]
    fn numeric_page_locator_substitutes_page_number() {
        let step = NumericLoopStep {
            description: None,
            page_number_template: "//a[@aria-label='Page {page}']".to_string(),
            next_button_fallback: Locator::xpath("//a[@title='Next']"),
            loop_steps: Vec::new(),
        };
        assert_eq!(
            step.page_locator(7).value,
            "//a[@aria-label='Page 7']"
        );
    }

    #[test]
    fn yaml_sitemap_round_trips_through_json_value() {
        let yaml = r#"
crawler_config:
  journeys:
    - journey_id: tas-acts
      description: Consolidated acts
      steps:
        - action: alphabet_loop
          target:
            value: "//div[@id='az']//a"
          loop_steps:
            - action: process_results
              scraping_config:
                row:
                  value: "//table//tr"
                columns:
                  - name: title
                    locator:
                      value: "./td[1]"
"#;
        let file: SitemapFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.crawler_config.journeys.len(), 1);
        assert!(matches!(
            file.crawler_config.journeys[0].steps[0],
            Step::AlphabetLoop(_)
        ));
    }
}
